//! Compressed tar extraction and payload discovery.
//!
//! Packages and application descriptors are gzipped tar streams. Extraction
//! is tolerant: hidden entries are skipped when requested, unsupported entry
//! types are skipped with a warning, and entries that would escape the
//! destination directory are dropped. One bad entry never fails the whole
//! archive.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::{Archive, EntryType};
use tracing::warn;

/// Unpack a gzipped tar stream into `dest`.
///
/// Only directories and regular files are materialized, preserving the
/// stored permission bits. With `skip_hidden` set, entries whose name starts
/// with a dot are dropped.
pub fn unpack_tgz<R: Read>(src: R, dest: &Path, skip_hidden: bool) -> io::Result<()> {
    let decoder = GzDecoder::new(src);
    let mut archive = Archive::new(decoder);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if skip_hidden && is_hidden(&path) {
            warn!(entry = %path.display(), "skipping hidden entry");
            continue;
        }

        // Entries must not escape the destination directory.
        if path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)))
        {
            warn!(entry = %path.display(), "skipping entry escaping destination");
            continue;
        }

        let target = dest.join(&path);
        let mode = entry.header().mode().unwrap_or(0o644);

        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
                set_mode(&target, mode)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = File::create(&target)?;
                io::copy(&mut entry, &mut file)?;
                set_mode(&target, mode)?;
            }
            other => {
                warn!(
                    entry = %path.display(),
                    entry_type = ?other,
                    "skipping unsupported entry type"
                );
            }
        }
    }

    Ok(())
}

fn is_hidden(path: &Path) -> bool {
    path.to_string_lossy().starts_with('.')
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

/// Find all regular files under `dir` whose name ends with `suffix`,
/// depth-first.
pub fn find_files_with_suffix(dir: &Path, suffix: &str) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    collect_with_suffix(dir, suffix, &mut found)?;
    Ok(found)
}

fn collect_with_suffix(dir: &Path, suffix: &str, found: &mut Vec<PathBuf>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_with_suffix(&path, suffix, found)?;
        } else if path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(suffix))
        {
            found.push(path);
        }
    }
    Ok(())
}
