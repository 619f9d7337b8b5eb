//! Integration tests for the reconciliation flow.
//!
//! These tests drive full reconciliation passes against a wiremock OCI
//! registry, a mock orchestrator, and verifier doubles:
//! 1. The desired-state manifest is served as an OCI artifact layer
//! 2. Component packages and key rings are served as content-addressed blobs
//! 3. The deployment tree lives in a tempdir

use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use margo_edge_agent::compose::{MockOrchestrator, OrchestratorCall};
use margo_edge_agent::reconciler::Reconciler;
use margo_edge_agent::registry::{Reference, RegistryClient, RegistryConfig};
use margo_edge_agent::store::DeploymentStore;
use margo_edge_agent::verify::{PackageVerifier, VerifyError};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Verifier double that accepts every signature.
struct AcceptAll;

impl PackageVerifier for AcceptAll {
    fn verify_detached(&self, _: &[u8], _: &Path, _: &Path) -> Result<(), VerifyError> {
        Ok(())
    }
}

/// Verifier double that rejects every signature.
struct RejectAll;

impl PackageVerifier for RejectAll {
    fn verify_detached(&self, _: &[u8], _: &Path, _: &Path) -> Result<(), VerifyError> {
        Err(VerifyError::NoValidBinding)
    }
}

fn digest_of(bytes: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// Build a gzipped tar archive from (name, contents) pairs.
fn build_tgz(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    let tar_bytes = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(&tar_bytes).unwrap();
    encoder.finish().unwrap()
}

/// Build a component package: an outer tgz holding the application
/// descriptor (itself a tgz with the compose file and one image archive)
/// plus its detached signature.
fn build_package(name: &str) -> Vec<u8> {
    let payload = build_tgz(&[
        ("docker-compose.yaml", b"services: {}\n".as_slice()),
        ("images/service.tar", b"fake image archive".as_slice()),
    ]);
    build_tgz(&[
        (&format!("{name}.app"), payload.as_slice()),
        (&format!("{name}.app.sig"), b"detached signature".as_slice()),
    ])
}

/// Serve `bytes` as a content-addressed blob; returns its digest.
async fn mount_blob(server: &MockServer, repo: &str, bytes: &[u8], expect: Option<u64>) -> String {
    let digest = digest_of(bytes);
    let mock = Mock::given(method("GET"))
        .and(path(format!("/v2/{repo}/blobs/{digest}")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(bytes.to_vec()));
    match expect {
        Some(n) => mock.expect(n).mount(server).await,
        None => mock.mount(server).await,
    }
    digest
}

/// Serve the desired-state document for the given components as an OCI
/// artifact under `acme/fleet:desired`.
async fn mount_desired_state(server: &MockServer, components: &[(&str, &str, &str)]) {
    let mut yaml = String::new();
    yaml.push_str("apiVersion: margo.org/v1\n");
    yaml.push_str("kind: ApplicationDeployment\n");
    yaml.push_str("metadata:\n  name: fleet\n  namespace: edge\n");
    yaml.push_str("spec:\n  deploymentProfile:\n    type: docker-compose\n    components:\n");
    for (name, key_digest, package_digest) in components {
        let uri = server.uri();
        yaml.push_str(&format!("      - name: {name}\n"));
        yaml.push_str("        properties:\n");
        yaml.push_str(&format!(
            "          keyLocation: {uri}/v2/acme/{name}/blobs/{key_digest}\n"
        ));
        yaml.push_str(&format!(
            "          packageLocation: {uri}/v2/acme/{name}/blobs/{package_digest}\n"
        ));
    }

    let yaml_bytes = yaml.into_bytes();
    let yaml_digest = mount_blob(server, "acme/fleet", &yaml_bytes, None).await;

    let manifest = serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.empty.v1+json",
            "digest": "sha256:0000000000000000000000000000000000000000000000000000000000000000",
            "size": 2
        },
        "layers": [{
            "mediaType": "application/vnd.margo.desired-state.v1+yaml",
            "digest": yaml_digest,
            "size": yaml_bytes.len()
        }]
    });

    Mock::given(method("GET"))
        .and(path("/v2/acme/fleet/manifests/desired"))
        .respond_with(
            ResponseTemplate::new(200).set_body_bytes(serde_json::to_vec(&manifest).unwrap()),
        )
        .mount(server)
        .await;
}

fn reconciler(
    server: &MockServer,
    store: DeploymentStore,
    orchestrator: Arc<MockOrchestrator>,
    verifier: Arc<dyn PackageVerifier>,
) -> (Reconciler, watch::Sender<bool>) {
    let registry = RegistryClient::new(RegistryConfig::default()).unwrap();
    let desired_ref = Reference::parse(&format!("{}/acme/fleet:desired", server.uri())).unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconciler = Reconciler::new(
        registry,
        desired_ref,
        store,
        verifier,
        orchestrator,
        Duration::from_secs(3),
        shutdown_rx,
    );
    (reconciler, shutdown_tx)
}

fn ensure_running_count(orchestrator: &MockOrchestrator) -> usize {
    orchestrator
        .calls()
        .iter()
        .filter(|c| matches!(c, OrchestratorCall::EnsureRunning(_)))
        .count()
}

#[tokio::test]
async fn test_apply_deploys_new_component() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    let package = build_package("demo");
    let package_digest = mount_blob(&server, "acme/demo", &package, None).await;
    let key_digest = mount_blob(&server, "acme/demo", b"test key ring", None).await;
    mount_desired_state(&server, &[("demo", &key_digest, &package_digest)]).await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    reconciler.reconcile().await.unwrap();

    // Round-trip: the stored digest is exactly the package digest and the
    // deployment was ensured running.
    let dir = store.component_dir("demo");
    assert!(dir.join("docker-compose.yaml").exists());
    assert_eq!(
        store.stored_digest("demo").unwrap().as_deref(),
        Some(package_digest.as_str())
    );

    let calls = orchestrator.calls();
    assert!(calls.contains(&OrchestratorCall::LoadImage(dir.join("images/service.tar"))));
    assert!(calls.contains(&OrchestratorCall::EnsureRunning(dir.clone())));
}

#[tokio::test]
async fn test_second_pass_is_idempotent() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    let package = build_package("demo");
    // The package and key blobs may be fetched exactly once across both passes.
    let package_digest = mount_blob(&server, "acme/demo", &package, Some(1)).await;
    let key_digest = mount_blob(&server, "acme/demo", b"test key ring", Some(1)).await;
    mount_desired_state(&server, &[("demo", &key_digest, &package_digest)]).await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    reconciler.reconcile().await.unwrap();
    reconciler.reconcile().await.unwrap();

    assert_eq!(
        store.stored_digest("demo").unwrap().as_deref(),
        Some(package_digest.as_str())
    );
    // Second pass still self-heals: ensure_running once per pass.
    assert_eq!(ensure_running_count(&orchestrator), 2);
}

#[tokio::test]
async fn test_convergence_leaves_current_component_untouched() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    // Component a is already deployed with a matching digest; its blobs are
    // deliberately not served, so any fetch attempt for it would fail.
    let package_a = build_package("a");
    let digest_a = digest_of(&package_a);
    let key_digest_a = digest_of(b"key a");
    std::fs::create_dir_all(store.component_dir("a")).unwrap();
    std::fs::write(store.component_dir("a").join("docker-compose.yaml"), b"services: {}\n").unwrap();
    store.write_digest("a", &digest_a).unwrap();

    let package_b = build_package("b");
    let package_digest_b = mount_blob(&server, "acme/b", &package_b, None).await;
    let key_digest_b = mount_blob(&server, "acme/b", b"key b", None).await;
    mount_desired_state(
        &server,
        &[
            ("a", &key_digest_a, &digest_a),
            ("b", &key_digest_b, &package_digest_b),
        ],
    )
    .await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    reconciler.reconcile().await.unwrap();

    // a untouched, b deployed, both ensured running.
    assert_eq!(store.stored_digest("a").unwrap().as_deref(), Some(digest_a.as_str()));
    assert!(store.component_dir("b").join("docker-compose.yaml").exists());

    let calls = orchestrator.calls();
    assert!(calls.contains(&OrchestratorCall::EnsureRunning(store.component_dir("a"))));
    assert!(calls.contains(&OrchestratorCall::EnsureRunning(store.component_dir("b"))));
}

#[tokio::test]
async fn test_purge_removes_stale_deployments() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    let package_a = build_package("a");
    let digest_a = digest_of(&package_a);
    let package_b = build_package("b");
    let digest_b = digest_of(&package_b);

    for (name, digest) in [("a", &digest_a), ("b", &digest_b)] {
        std::fs::create_dir_all(store.component_dir(name)).unwrap();
        std::fs::write(store.component_dir(name).join("content"), name).unwrap();
        store.write_digest(name, digest).unwrap();
    }
    std::fs::create_dir_all(store.component_dir("c")).unwrap();
    store.write_digest("c", "sha256:stale").unwrap();

    mount_desired_state(
        &server,
        &[
            ("a", "sha256:ka", &digest_a),
            ("b", "sha256:kb", &digest_b),
        ],
    )
    .await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    reconciler.reconcile().await.unwrap();

    assert!(!store.component_dir("c").exists());
    assert_eq!(
        std::fs::read(store.component_dir("a").join("content")).unwrap(),
        b"a"
    );
    assert_eq!(
        std::fs::read(store.component_dir("b").join("content")).unwrap(),
        b"b"
    );
    assert!(orchestrator
        .calls()
        .contains(&OrchestratorCall::TearDown(store.component_dir("c"))));
}

#[tokio::test]
async fn test_rejected_package_changes_nothing() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    let package = build_package("demo");
    let package_digest = mount_blob(&server, "acme/demo", &package, None).await;
    let key_digest = mount_blob(&server, "acme/demo", b"test key ring", None).await;
    mount_desired_state(&server, &[("demo", &key_digest, &package_digest)]).await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(RejectAll),
    );
    // The pass itself succeeds; the component failure is isolated.
    reconciler.reconcile().await.unwrap();

    assert_eq!(store.stored_digest("demo").unwrap(), None);
    assert!(!store.component_dir("demo").exists());
    assert!(!orchestrator
        .calls()
        .contains(&OrchestratorCall::EnsureRunning(store.component_dir("demo"))));
}

#[tokio::test]
async fn test_failure_of_one_component_isolates_others() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    // broken's blobs are never served: its fetch fails with a 404.
    let package_broken = build_package("broken");
    let digest_broken = digest_of(&package_broken);

    let package_ok = build_package("ok");
    let package_digest_ok = mount_blob(&server, "acme/ok", &package_ok, None).await;
    let key_digest_ok = mount_blob(&server, "acme/ok", b"key ok", None).await;
    mount_desired_state(
        &server,
        &[
            ("broken", "sha256:kx", &digest_broken),
            ("ok", &key_digest_ok, &package_digest_ok),
        ],
    )
    .await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    reconciler.reconcile().await.unwrap();

    assert_eq!(store.stored_digest("broken").unwrap(), None);
    assert_eq!(
        store.stored_digest("ok").unwrap().as_deref(),
        Some(package_digest_ok.as_str())
    );
    assert!(orchestrator
        .calls()
        .contains(&OrchestratorCall::EnsureRunning(store.component_dir("ok"))));
}

#[tokio::test]
async fn test_stale_digest_triggers_replacement() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    // Existing deployment with an outdated digest and a compose descriptor.
    let dir = store.component_dir("demo");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("docker-compose.yaml"), b"services: {}\n").unwrap();
    std::fs::write(dir.join("old-content"), b"old").unwrap();
    store.write_digest("demo", "sha256:outdated").unwrap();

    let package = build_package("demo");
    let package_digest = mount_blob(&server, "acme/demo", &package, None).await;
    let key_digest = mount_blob(&server, "acme/demo", b"test key ring", None).await;
    mount_desired_state(&server, &[("demo", &key_digest, &package_digest)]).await;

    let (reconciler, _shutdown) = reconciler(
        &server,
        store.clone(),
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    reconciler.reconcile().await.unwrap();

    // The old directory was torn down and fully replaced.
    assert!(!dir.join("old-content").exists());
    assert!(dir.join("docker-compose.yaml").exists());
    assert_eq!(
        store.stored_digest("demo").unwrap().as_deref(),
        Some(package_digest.as_str())
    );

    let calls = orchestrator.calls();
    assert!(calls.contains(&OrchestratorCall::TearDown(dir.clone())));
    assert!(calls.contains(&OrchestratorCall::EnsureRunning(dir.clone())));
}

#[tokio::test]
async fn test_cancelled_pass_aborts_before_fetch() {
    let server = MockServer::start().await;
    let deploy_dir = tempfile::tempdir().unwrap();
    let store = DeploymentStore::open(deploy_dir.path()).unwrap();
    let orchestrator = Arc::new(MockOrchestrator::new());

    Mock::given(method("GET"))
        .and(path("/v2/acme/fleet/manifests/desired"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let (reconciler, shutdown) = reconciler(
        &server,
        store,
        Arc::clone(&orchestrator),
        Arc::new(AcceptAll),
    );
    shutdown.send(true).unwrap();

    let result = reconciler.reconcile().await;
    assert!(result.is_err());
    assert!(orchestrator.calls().is_empty());
}
