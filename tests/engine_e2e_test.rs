// Runs against a real Docker or Podman engine and pulls the k0s image.
// Run with: cargo test --features engine-e2e --test engine_e2e -- --nocapture

use std::time::Duration;

use k0da::controllers::{ClusterController, CreateOptions};
use k0da::models::{ClusterConfig, NodeSpec};
use k0da::runtime::{detect, DetectOptions};
use k0da::storage::KubeconfigStore;
use k0da::Settings;
use serial_test::serial;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn controller(runtime: std::sync::Arc<dyn k0da::runtime::ContainerRuntime>, tmp: &TempDir) -> ClusterController {
    ClusterController::new(
        runtime,
        Settings::with_root(tmp.path().join("clusters")),
        KubeconfigStore::new(tmp.path().join("kubeconfig")),
        CancellationToken::new(),
    )
}

#[tokio::test]
#[serial]
async fn test_detect_finds_engine() {
    let runtime = detect(&DetectOptions::default()).await.unwrap();
    println!("Detected engine: {}", runtime.name());
    assert!(["docker", "podman"].contains(&runtime.name()));
}

async fn engine_networks(engine: &str) -> Vec<String> {
    let out = tokio::process::Command::new(engine)
        .args(["network", "ls", "--format", "{{.Name}}"])
        .output()
        .await
        .unwrap();
    assert!(out.status.success(), "{} network ls failed", engine);
    String::from_utf8_lossy(&out.stdout)
        .lines()
        .map(|l| l.trim().to_string())
        .collect()
}

#[tokio::test]
#[serial]
async fn test_ensure_network_twice_creates_one() {
    let runtime = detect(&DetectOptions::default()).await.unwrap();
    let name = format!("k0da-e2e-net-{}", &uuid::Uuid::new_v4().to_string()[..8]);
    // A longer name sharing the prefix must not satisfy the lookup.
    let decoy = format!("{}-decoy", name);

    runtime.ensure_network(&decoy).await.unwrap();
    let first = runtime.ensure_network(&name).await;
    let second = runtime.ensure_network(&name).await;
    let listed = engine_networks(runtime.name()).await;

    for network in [&name, &decoy] {
        let _ = tokio::process::Command::new(runtime.name())
            .args(["network", "rm", network.as_str()])
            .output()
            .await;
    }

    first.unwrap();
    second.unwrap();
    assert_eq!(listed.iter().filter(|n| **n == name).count(), 1, "networks: {:?}", listed);
    println!("✓ Network {} created once", name);
}

#[tokio::test]
#[serial]
async fn test_two_node_cluster_lifecycle() {
    let tmp = TempDir::new().unwrap();
    let runtime = detect(&DetectOptions::default()).await.unwrap();
    let controller = controller(runtime, &tmp);
    let name = format!("k0da-e2e-{}", &uuid::Uuid::new_v4().to_string()[..8]);

    let mut config = ClusterConfig::default();
    config.spec.nodes = vec![NodeSpec::controller(&name), NodeSpec::worker("")];

    let created = controller
        .create(&CreateOptions {
            name: name.clone(),
            config,
            image: None,
            wait: true,
            timeout: Duration::from_secs(180),
        })
        .await;

    let listed = controller.list(true).await;
    let deleted = controller.delete(&name).await;

    created.unwrap();
    let clusters = listed.unwrap();
    let cluster = clusters.iter().find(|c| c.name == name).unwrap();
    assert_eq!(cluster.nodes, 2);
    println!("✓ Cluster {} ran with {} nodes", name, cluster.nodes);

    deleted.unwrap();
    let (contexts, _) = KubeconfigStore::new(tmp.path().join("kubeconfig"))
        .contexts()
        .await
        .unwrap();
    assert!(contexts.is_empty());
}
