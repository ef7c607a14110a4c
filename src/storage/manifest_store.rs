use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;
use tracing::{debug, info};

use super::{write_private, ClusterLayout};
use crate::models::version::http_client;
use crate::models::ClusterConfig;
use crate::{Error, Result};

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Stages files bind-mounted into node containers: manifests, the effective
/// k0s config and join tokens.
pub struct ManifestStore {
    layout: ClusterLayout,
}

impl ManifestStore {
    pub fn new(layout: ClusterLayout) -> Self {
        Self { layout }
    }

    pub fn layout(&self) -> &ClusterLayout {
        &self.layout
    }

    /// Clears the manifests directory and stages every declared manifest as
    /// `NNN_<basename>` in declared order.
    pub async fn stage_manifests(&self, config: &ClusterConfig) -> Result<Vec<PathBuf>> {
        let dir = self.layout.manifests_dir();
        clear_dir(&dir).await?;

        let mut staged = Vec::with_capacity(config.spec.k0s.manifests.len());
        let client = http_client(DOWNLOAD_TIMEOUT)?;
        for (index, source) in config.spec.k0s.manifests.iter().enumerate() {
            let source = source.trim();
            let target = dir.join(staged_name(index, source));

            if is_remote(source) {
                download(&client, source, &target).await?;
            } else {
                let path = resolve_local(source, config.base_dir());
                fs::copy(&path, &target).await.map_err(|e| {
                    Error::staging("manifest", format!("copy {}: {}", path.display(), e))
                })?;
            }
            debug!("Staged manifest {} as {}", source, target.display());
            staged.push(target);
        }

        if !staged.is_empty() {
            info!("Staged {} manifest(s) into {}", staged.len(), dir.display());
        }
        Ok(staged)
    }

    /// Writes the merged k0s config to `etc-k0s/k0s.yaml`.
    pub async fn write_k0s_config(&self, config: &ClusterConfig) -> Result<PathBuf> {
        let effective = config.effective_k0s_config()?;
        let data = serde_yaml::to_string(&effective)?;
        fs::create_dir_all(self.layout.config_dir()).await?;
        let path = self.layout.config_file();
        fs::write(&path, data).await.map_err(|e| {
            Error::staging("k0s config", format!("write {}: {}", path.display(), e))
        })?;
        Ok(path)
    }

    /// Writes a join token readable only by the owner.
    pub async fn write_token(&self, node: &str, token: &str) -> Result<PathBuf> {
        fs::create_dir_all(self.layout.tokens_dir()).await?;
        let path = self.layout.token_file(node);
        write_private(&path, format!("{}\n", token.trim()).as_bytes()).await?;
        Ok(path)
    }
}

pub fn staged_name(index: usize, source: &str) -> String {
    let trimmed = source.trim_end_matches('/');
    let base = trimmed
        .split('?')
        .next()
        .unwrap_or(trimmed)
        .rsplit('/')
        .next()
        .filter(|b| !b.is_empty())
        .unwrap_or("manifest.yaml");
    format!("{:03}_{}", index, base)
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

fn resolve_local(source: &str, base_dir: Option<&Path>) -> PathBuf {
    let path = PathBuf::from(source);
    match base_dir {
        Some(base) if path.is_relative() => base.join(path),
        _ => path,
    }
}

async fn clear_dir(dir: &Path) -> Result<()> {
    if fs::metadata(dir).await.is_ok() {
        fs::remove_dir_all(dir).await?;
    }
    fs::create_dir_all(dir).await?;
    Ok(())
}

async fn download(client: &reqwest::Client, url: &str, target: &Path) -> Result<()> {
    debug!("Downloading manifest {}", url);
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::staging(
            "manifest",
            format!("download {}: status {}", url, response.status()),
        ));
    }
    let body = response.bytes().await?;
    fs::write(target, &body).await?;
    Ok(())
}
