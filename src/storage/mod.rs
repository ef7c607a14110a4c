pub mod kubeconfig_store;
pub mod manifest_store;

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

pub use kubeconfig_store::{Kubeconfig, KubeconfigStore};
pub use manifest_store::ManifestStore;

/// Host-side directory of one cluster: `<root>/<name>`.
#[derive(Debug, Clone)]
pub struct ClusterLayout {
    dir: PathBuf,
}

impl ClusterLayout {
    pub fn new(clusters_root: &Path, cluster: &str) -> Self {
        Self {
            dir: clusters_root.join(cluster),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.dir.join("manifests")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dir.join("etc-k0s")
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("k0s.yaml")
    }

    pub fn tokens_dir(&self) -> PathBuf {
        self.dir.join("tokens")
    }

    pub fn token_file(&self, node: &str) -> PathBuf {
        self.tokens_dir().join(format!("{}.token", node))
    }
}

/// Writes `data` to a file only the owner can read. New files are created
/// 0600 and existing ones are narrowed before anything is written.
pub async fn write_private(path: &Path, data: &[u8]) -> crate::Result<()> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);
    let mut file = options.open(path).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(std::fs::Permissions::from_mode(0o600)).await?;
    }
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}
