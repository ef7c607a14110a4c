use std::path::Path;

use k0da::models::ClusterConfig;
use k0da::storage::{ClusterLayout, ManifestStore};
use k0da::Error;
use tempfile::TempDir;

fn store(root: &Path) -> ManifestStore {
    ManifestStore::new(ClusterLayout::new(&root.join("clusters"), "dev"))
}

#[tokio::test]
async fn test_manifests_staged_in_declared_order() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("b.yaml"), "kind: B\n").unwrap();
    std::fs::write(tmp.path().join("a.yaml"), "kind: A\n").unwrap();

    let mut config = ClusterConfig::default();
    config.spec.k0s.manifests = vec![
        tmp.path().join("b.yaml").display().to_string(),
        tmp.path().join("a.yaml").display().to_string(),
    ];

    let store = store(tmp.path());
    let staged = store.stage_manifests(&config).await.unwrap();

    let names: Vec<_> = staged
        .iter()
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["000_b.yaml", "001_a.yaml"]);
    assert_eq!(std::fs::read_to_string(&staged[0]).unwrap(), "kind: B\n");
    assert!(staged.iter().all(|p| p.starts_with(store.layout().manifests_dir())));
}

#[tokio::test]
async fn test_relative_manifests_resolve_against_config_file() {
    let tmp = TempDir::new().unwrap();
    let project = tmp.path().join("project");
    std::fs::create_dir_all(project.join("deploy")).unwrap();
    std::fs::write(project.join("deploy/app.yaml"), "kind: App\n").unwrap();
    let config_path = project.join("cluster.yaml");
    std::fs::write(
        &config_path,
        "apiVersion: k0da.k0sproject.io/v1alpha1\nkind: Cluster\nspec:\n  k0s:\n    manifests:\n    - deploy/app.yaml\n",
    )
    .unwrap();

    let config = ClusterConfig::load(Some(&config_path)).unwrap();
    let staged = store(tmp.path()).stage_manifests(&config).await.unwrap();

    assert_eq!(staged.len(), 1);
    assert!(staged[0].ends_with("000_app.yaml"));
    assert_eq!(std::fs::read_to_string(&staged[0]).unwrap(), "kind: App\n");
}

#[tokio::test]
async fn test_restaging_clears_previous_manifests() {
    let tmp = TempDir::new().unwrap();
    std::fs::write(tmp.path().join("a.yaml"), "a").unwrap();
    std::fs::write(tmp.path().join("b.yaml"), "b").unwrap();
    let store = store(tmp.path());

    let mut config = ClusterConfig::default();
    config.spec.k0s.manifests = vec![
        tmp.path().join("a.yaml").display().to_string(),
        tmp.path().join("b.yaml").display().to_string(),
    ];
    store.stage_manifests(&config).await.unwrap();

    config.spec.k0s.manifests.truncate(1);
    store.stage_manifests(&config).await.unwrap();

    let entries = std::fs::read_dir(store.layout().manifests_dir()).unwrap().count();
    assert_eq!(entries, 1);
}

#[tokio::test]
async fn test_missing_manifest_is_staging_error() {
    let tmp = TempDir::new().unwrap();
    let mut config = ClusterConfig::default();
    config.spec.k0s.manifests = vec![tmp.path().join("nope.yaml").display().to_string()];

    let err = store(tmp.path()).stage_manifests(&config).await.unwrap_err();
    assert!(matches!(err, Error::Staging { .. }), "got {:?}", err);
}

#[tokio::test]
async fn test_token_file_is_owner_only() {
    let tmp = TempDir::new().unwrap();
    let store = store(tmp.path());

    let path = store.write_token("dev-worker-0", "  secret-token\n").await.unwrap();

    assert_eq!(path, store.layout().token_file("dev-worker-0"));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "secret-token\n");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}

#[tokio::test]
async fn test_k0s_config_merges_inline_overrides() {
    let tmp = TempDir::new().unwrap();
    let config = ClusterConfig::from_yaml(
        "spec:\n  k0s:\n    config:\n      spec:\n        network:\n          provider: calico\n",
    )
    .unwrap();

    let path = store(tmp.path()).write_k0s_config(&config).await.unwrap();
    let written: serde_yaml::Value =
        serde_yaml::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

    assert_eq!(written["kind"], "ClusterConfig");
    assert_eq!(written["metadata"]["name"], "k0s");
    assert_eq!(written["spec"]["network"]["provider"], "calico");
}

#[cfg(unix)]
#[tokio::test]
async fn test_token_rewrite_narrows_loose_permissions() {
    use std::os::unix::fs::PermissionsExt;
    let tmp = TempDir::new().unwrap();
    let store = store(tmp.path());
    let path = store.layout().token_file("dev-worker-0");
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, "stale-token-with-more-bytes\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644)).unwrap();

    store.write_token("dev-worker-0", "fresh").await.unwrap();

    assert_eq!(std::fs::read_to_string(&path).unwrap(), "fresh\n");
    let mode = std::fs::metadata(&path).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o600);
}
