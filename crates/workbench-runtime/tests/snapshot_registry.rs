mod common;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::routing::{delete, head};
use axum::Router;
use common::{test_config, MockBehavior, MockContainerApi};
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;
use workbench_common::{InstanceKey, MachineConfig, MachineSource, WorkbenchError};
use workbench_runtime::{
    ContainerApi, Credentials, DiscardLogSink, LocalWorkspaceFolders, LogSink, RuntimeConfig,
    WorkspaceRuntime,
};

const DIGEST: &str = "sha256:4f0e2b4a";

#[derive(Clone, Default)]
struct FakeRegistry {
    deleted: Arc<Mutex<HashSet<String>>>,
    lookups: Arc<AtomicUsize>,
    fail_deletes: bool,
}

async fn manifest_head(
    State(registry): State<FakeRegistry>,
    Path((repository, _reference)): Path<(String, String)>,
) -> (StatusCode, HeaderMap) {
    registry.lookups.fetch_add(1, Ordering::SeqCst);
    if registry.deleted.lock().unwrap().contains(&repository) {
        return (StatusCode::NOT_FOUND, HeaderMap::new());
    }
    let mut headers = HeaderMap::new();
    headers.insert("Docker-Content-Digest", HeaderValue::from_static(DIGEST));
    (StatusCode::OK, headers)
}

async fn manifest_delete(
    State(registry): State<FakeRegistry>,
    Path((repository, digest)): Path<(String, String)>,
) -> StatusCode {
    if registry.fail_deletes {
        return StatusCode::METHOD_NOT_ALLOWED;
    }
    if digest != DIGEST || !registry.deleted.lock().unwrap().insert(repository) {
        return StatusCode::NOT_FOUND;
    }
    StatusCode::ACCEPTED
}

async fn hub_delete(
    State(registry): State<FakeRegistry>,
    Path(repository): Path<String>,
    headers: HeaderMap,
) -> StatusCode {
    if !headers.contains_key("authorization") {
        return StatusCode::UNAUTHORIZED;
    }
    if !registry.deleted.lock().unwrap().insert(repository) {
        return StatusCode::NOT_FOUND;
    }
    StatusCode::ACCEPTED
}

async fn serve(registry: FakeRegistry) -> SocketAddr {
    let app = Router::new()
        .route(
            "/v2/:repository/manifests/:reference",
            head(manifest_head).delete(manifest_delete),
        )
        .route("/v1/repositories/:repository/", delete(hub_delete))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn registry_config(root: &std::path::Path, addr: SocketAddr) -> RuntimeConfig {
    let mut config = test_config(root);
    config.snapshot.use_registry = true;
    config.snapshot.registry = Some(addr.to_string());
    config.snapshot.registry_scheme = "http".to_string();
    config.snapshot.hub_url = format!("http://{addr}");
    config
        .registry_auth
        .insert("docker.io".to_string(), Credentials::new("dev", "secret"));
    config
}

fn runtime(api: &MockContainerApi, config: RuntimeConfig) -> WorkspaceRuntime {
    let folders = LocalWorkspaceFolders::new(config.workspaces_root.clone());
    WorkspaceRuntime::new(config, Arc::new(api.clone()), Arc::new(folders)).unwrap()
}

fn logs() -> Arc<dyn LogSink> {
    Arc::new(DiscardLogSink)
}

#[tokio::test]
async fn test_registry_snapshot_round_trip() -> Result<()> {
    let dir = tempdir()?;
    let registry = FakeRegistry::default();
    let addr = serve(registry.clone()).await;
    let api = MockContainerApi::new();
    let rt = runtime(&api, registry_config(dir.path(), addr));

    let instance = rt
        .create_instance(
            "ws1",
            MachineConfig::dev("dev"),
            MachineSource::recipe("FROM base\nCMD sleep 1\n"),
            logs(),
            CancellationToken::new(),
        )
        .await?;

    let key = rt.save(&instance.id, logs()).await?;
    assert_eq!(key.registry.as_deref(), Some(addr.to_string().as_str()));
    assert_eq!(key.digest.as_deref(), Some(DIGEST));
    assert_eq!(api.count("push_image"), 1);
    // Pushed snapshots are not kept on the daemon.
    assert!(!api.has_image(&key.location()));

    let restored = rt
        .restore(
            "ws1",
            MachineConfig::dev("dev"),
            &key,
            logs(),
            CancellationToken::new(),
        )
        .await?;
    assert_eq!(api.count("pull_image"), 1);
    assert!(!api.has_image(&key.location()));
    rt.destroy(&restored.id).await?;

    rt.remove_snapshot(&key).await?;
    rt.remove_snapshot(&key).await?;
    assert!(registry
        .deleted
        .lock()
        .unwrap()
        .contains(&key.repository));
    // The digest was known, so no lookup was needed.
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 0);
    Ok(())
}

#[tokio::test]
async fn test_remove_snapshot_without_digest_looks_it_up() -> Result<()> {
    let dir = tempdir()?;
    let registry = FakeRegistry::default();
    let addr = serve(registry.clone()).await;
    let api = MockContainerApi::new();
    let rt = runtime(&api, registry_config(dir.path(), addr));

    let key = InstanceKey {
        registry: Some(addr.to_string()),
        repository: "machine_snapshot_lookup".to_string(),
        tag: "latest".to_string(),
        digest: None,
    };
    rt.remove_snapshot(&key).await?;
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 1);

    // Already deleted: the lookup misses and removal still succeeds.
    rt.remove_snapshot(&key).await?;
    assert_eq!(registry.lookups.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn test_registry_refusing_delete_is_not_removable() -> Result<()> {
    let dir = tempdir()?;
    let registry = FakeRegistry {
        fail_deletes: true,
        ..Default::default()
    };
    let addr = serve(registry).await;
    let api = MockContainerApi::new();
    let rt = runtime(&api, registry_config(dir.path(), addr));

    let key = InstanceKey {
        registry: Some(addr.to_string()),
        repository: "machine_snapshot_locked".to_string(),
        tag: "latest".to_string(),
        digest: Some(DIGEST.to_string()),
    };
    let err = rt.remove_snapshot(&key).await.unwrap_err();
    assert!(matches!(err, WorkbenchError::SnapshotNotRemovable { .. }));
    Ok(())
}

#[tokio::test]
async fn test_hub_snapshot_removal() -> Result<()> {
    let dir = tempdir()?;
    let registry = FakeRegistry::default();
    let addr = serve(registry.clone()).await;
    let api = MockContainerApi::new();
    let rt = runtime(&api, registry_config(dir.path(), addr));

    let key = InstanceKey {
        registry: Some("docker.io".to_string()),
        repository: "machine_snapshot_hub".to_string(),
        tag: "latest".to_string(),
        digest: None,
    };
    rt.remove_snapshot(&key).await?;
    rt.remove_snapshot(&key).await?;
    assert!(registry
        .deleted
        .lock()
        .unwrap()
        .contains("machine_snapshot_hub"));
    Ok(())
}

#[tokio::test]
async fn test_failed_push_is_reported_and_local_image_dropped() -> Result<()> {
    let dir = tempdir()?;
    let registry = FakeRegistry::default();
    let addr = serve(registry).await;
    let api = MockContainerApi::new();
    let rt = runtime(&api, registry_config(dir.path(), addr));

    let instance = rt
        .create_instance(
            "ws1",
            MachineConfig::dev("dev"),
            MachineSource::recipe("FROM base\nCMD sleep 1\n"),
            logs(),
            CancellationToken::new(),
        )
        .await?;
    let images_before = api.image_count();

    api.set_behavior(MockBehavior {
        push_failure: true,
        ..Default::default()
    });
    let err = rt.save(&instance.id, logs()).await.unwrap_err();
    assert!(matches!(err, WorkbenchError::PushFailed { .. }));
    assert_eq!(api.count("commit_container"), 1);
    assert_eq!(api.image_count(), images_before);
    Ok(())
}

#[tokio::test]
async fn test_commit_of_vanished_container_fails() -> Result<()> {
    let dir = tempdir()?;
    let api = MockContainerApi::new();
    let rt = runtime(&api, test_config(dir.path()));

    let instance = rt
        .create_instance(
            "ws1",
            MachineConfig::dev("dev"),
            MachineSource::recipe("FROM base\nCMD sleep 1\n"),
            logs(),
            CancellationToken::new(),
        )
        .await?;
    api.remove_container(&instance.container_id, true, true).await?;

    let err = rt.save(&instance.id, logs()).await.unwrap_err();
    assert!(matches!(err, WorkbenchError::CommitFailed { .. }));
    Ok(())
}
