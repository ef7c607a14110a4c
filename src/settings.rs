use std::path::PathBuf;
use std::time::Duration;

use crate::controllers::RetryPolicy;
use crate::{Error, Result};

pub const DEFAULT_IMAGE_REPO: &str = "quay.io/k0sproject/k0s";
pub const DEFAULT_K0S_VERSION: &str = "v1.33.3-k0s.0";
pub const DEFAULT_NETWORK: &str = "k0da";
pub const DEFAULT_CLUSTER_NAME: &str = "k0da";
pub const STABLE_VERSION_URL: &str = "https://docs.k0sproject.io/stable.txt";

/// Process-wide defaults. Built once in `main` and handed to the controller
/// so tests can swap in short intervals and a temp directory.
#[derive(Debug, Clone)]
pub struct Settings {
    pub image_repo: String,
    pub default_version: String,
    pub stable_version_url: String,
    /// Query the stable channel when neither the CLI nor the config pins an image.
    pub fetch_stable: bool,
    pub default_network: String,
    /// Parent of every per-cluster host directory (`~/.k0da/clusters`).
    pub clusters_root: PathBuf,
    pub readiness_interval: Duration,
    pub port_lookup: RetryPolicy,
    /// How many non-primary node containers may be launched at once.
    pub join_concurrency: usize,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::staging("cluster directory", "could not determine home directory"))?;
        Ok(Self::with_root(home.join(".k0da").join("clusters")))
    }

    pub fn with_root(clusters_root: PathBuf) -> Self {
        Self {
            image_repo: DEFAULT_IMAGE_REPO.to_string(),
            default_version: DEFAULT_K0S_VERSION.to_string(),
            stable_version_url: STABLE_VERSION_URL.to_string(),
            fetch_stable: true,
            default_network: DEFAULT_NETWORK.to_string(),
            clusters_root,
            readiness_interval: Duration::from_secs(2),
            port_lookup: RetryPolicy::attempts(15, Duration::from_secs(1)),
            join_concurrency: 1,
        }
    }

    pub fn default_image(&self) -> String {
        format!(
            "{}:{}",
            self.image_repo,
            crate::models::version::normalize_version_tag(&self.default_version)
        )
    }
}
