use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::grouping::{group_clusters, ClusterSummary};
use super::join::{join_nodes, JoinContext};
use super::launch::{primary_options, volume_name};
use super::readiness::{resolve_api_port, wait_for_ready};
use crate::models::version::{fetch_stable_version, http_client, normalize_version_tag};
use crate::models::{ClusterConfig, LABEL_CLUSTER, LABEL_CLUSTER_NAME};
use crate::runtime::ContainerRuntime;
use crate::settings::Settings;
use crate::storage::{ClusterLayout, KubeconfigStore, ManifestStore};
use crate::{Error, Result};

const STABLE_LOOKUP_TIMEOUT: Duration = Duration::from_secs(3);
const APPLY_CONFIG: [&str; 5] = ["k0s", "kc", "apply", "-f", "/etc/k0s/k0s.yaml"];
const ARCHIVE_SUFFIXES: [&str; 3] = [".tar", ".tar.gz", ".tgz"];

#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    pub config: ClusterConfig,
    pub image: Option<String>,
    pub wait: bool,
    pub timeout: Duration,
}

// Drives cluster lifecycle against one container engine. Holds no state
// between calls beyond its collaborators.
pub struct ClusterController {
    runtime: Arc<dyn ContainerRuntime>,
    settings: Settings,
    kubeconfig: KubeconfigStore,
    cancel: CancellationToken,
}

impl ClusterController {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        settings: Settings,
        kubeconfig: KubeconfigStore,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            settings,
            kubeconfig,
            cancel,
        }
    }

    pub fn layout(&self, name: &str) -> ClusterLayout {
        ClusterLayout::new(&self.settings.clusters_root, name)
    }

    pub async fn resolve_image(&self, explicit: Option<&str>, config: &ClusterConfig) -> String {
        if let Some(image) = explicit.map(str::trim).filter(|i| !i.is_empty()) {
            return image.to_string();
        }
        if let Some(image) = config.pinned_image(&self.settings) {
            return image;
        }
        if self.settings.fetch_stable {
            match self.fetch_stable().await {
                Ok(version) if !version.is_empty() => {
                    return format!(
                        "{}:{}",
                        self.settings.image_repo,
                        normalize_version_tag(&version)
                    );
                }
                Ok(_) => debug!("Stable version lookup returned nothing"),
                Err(e) => debug!("Stable version lookup failed: {}", e),
            }
        }
        self.settings.default_image()
    }

    async fn fetch_stable(&self) -> Result<String> {
        let client = http_client(STABLE_LOOKUP_TIMEOUT)?;
        fetch_stable_version(&client, &self.settings.stable_version_url).await
    }

    pub async fn create(&self, opts: &CreateOptions) -> Result<()> {
        let name = opts.name.trim();
        if name.is_empty() {
            return Err(Error::invalid_config("cluster name is required"));
        }
        let config = &opts.config;
        let image = self.resolve_image(opts.image.as_deref(), config).await;
        let network = config.network(&self.settings).to_string();
        info!("Creating cluster {} with image {} on {}", name, image, self.runtime.name());

        let staging = ManifestStore::new(self.layout(name));
        tokio::fs::create_dir_all(staging.layout().dir()).await?;
        let config_file = staging.write_k0s_config(config).await?;
        staging.stage_manifests(config).await?;

        self.runtime.ensure_network(&network).await?;

        let primary = primary_options(
            name,
            config,
            &image,
            &network,
            &staging.layout().manifests_dir(),
            &config_file,
        );
        info!("Starting primary controller {} with image {}", name, primary.image);
        self.runtime.run_container(&primary).await?;

        // Tokens can only be minted once the primary's API is up, so joins
        // wait for it even when the caller asked not to.
        let has_joins = !config.joining_nodes().is_empty();
        if opts.wait || has_joins {
            self.wait_ready(name, opts.timeout).await?;
        }
        if opts.wait {
            self.export_kubeconfig(name).await?;
        }

        if has_joins {
            let ctx = JoinContext {
                runtime: self.runtime.as_ref(),
                cluster: name,
                config,
                image: &image,
                network: &network,
                staging: &staging,
                wait: opts.wait.then_some(opts.timeout),
                readiness_interval: self.settings.readiness_interval,
                concurrency: self.settings.join_concurrency,
                cancel: &self.cancel,
            };
            let joined = join_nodes(&ctx).await?;
            info!("Joined {} node(s) to {}", joined.len(), name);
        }

        info!("Cluster {} created", name);
        Ok(())
    }

    async fn wait_ready(&self, container: &str, timeout: Duration) -> Result<()> {
        wait_for_ready(
            self.runtime.as_ref(),
            container,
            timeout,
            self.settings.readiness_interval,
            &self.cancel,
        )
        .await
    }

    pub async fn export_kubeconfig(&self, name: &str) -> Result<()> {
        let admin = self
            .exec_checked(name, &["k0s", "kubeconfig", "admin"])
            .await?;
        let port = resolve_api_port(
            self.runtime.as_ref(),
            name,
            self.settings.port_lookup,
            &self.cancel,
        )
        .await?;
        let server = format!("https://localhost:{}", port);
        self.kubeconfig.add(name, &admin, &server).await
    }

    pub async fn update(&self, name: &str, config: &ClusterConfig) -> Result<()> {
        if !self.runtime.container_exists(name).await? {
            return Err(Error::ClusterNotFound {
                name: name.to_string(),
            });
        }

        let staging = ManifestStore::new(self.layout(name));
        tokio::fs::create_dir_all(staging.layout().dir()).await?;
        if !config.spec.k0s.manifests.is_empty() {
            staging.stage_manifests(config).await?;
        }
        staging.write_k0s_config(config).await?;

        info!("Applying k0s config on {}", name);
        self.exec_checked(name, &APPLY_CONFIG).await?;
        info!("Cluster {} updated", name);
        Ok(())
    }

    // Only failures on the primary container are fatal.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let volume = volume_name(name);
        let exists = self.runtime.container_exists(name).await?;
        let volume_exists = self.runtime.volume_exists(&volume).await?;
        if !exists && !volume_exists {
            return Err(Error::ClusterNotFound {
                name: name.to_string(),
            });
        }

        if exists {
            if self.runtime.container_is_running(name).await? {
                info!("Stopping {}", name);
                self.runtime.stop_container(name).await?;
            }
            info!("Removing {}", name);
            self.runtime.remove_container(name).await?;
        } else {
            info!("Container {} already removed, cleaning up volume", name);
        }

        if volume_exists {
            if let Err(e) = self.runtime.remove_volume(&volume).await {
                warn!("Failed to remove volume {}: {}", volume, e);
            }
        }

        self.delete_secondary_nodes(name).await;

        if let Err(e) = self.kubeconfig.remove(name).await {
            warn!("Failed to remove {} from kubeconfig: {}", name, e);
        }

        let layout = self.layout(name);
        if tokio::fs::metadata(layout.dir()).await.is_ok() {
            if let Err(e) = tokio::fs::remove_dir_all(layout.dir()).await {
                warn!("Failed to remove {}: {}", layout.dir().display(), e);
            }
        }

        info!("Cluster {} deleted", name);
        Ok(())
    }

    async fn delete_secondary_nodes(&self, name: &str) {
        let selector = BTreeMap::from([(LABEL_CLUSTER_NAME.to_string(), name.to_string())]);
        let nodes = match self.runtime.list_containers_by_label(&selector, true).await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!("Failed to list nodes of {}: {}", name, e);
                return;
            }
        };

        for node in nodes.into_iter().filter(|n| n.name != name) {
            info!("Removing node {}", node.name);
            if let Err(e) = self.runtime.remove_container(&node.name).await {
                warn!("Failed to remove node {}: {}", node.name, e);
                continue;
            }
            let volume = volume_name(&node.name);
            match self.runtime.volume_exists(&volume).await {
                Ok(true) => {
                    if let Err(e) = self.runtime.remove_volume(&volume).await {
                        warn!("Failed to remove volume {}: {}", volume, e);
                    }
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to inspect volume {}: {}", volume, e),
            }
        }
    }

    pub async fn list(&self, include_stopped: bool) -> Result<Vec<ClusterSummary>> {
        let selector = BTreeMap::from([(LABEL_CLUSTER.to_string(), "true".to_string())]);
        let records = self
            .runtime
            .list_containers_by_label(&selector, include_stopped)
            .await?;
        Ok(group_clusters(records))
    }

    pub async fn load_archive(&self, name: &str, archive: &Path) -> Result<()> {
        let archive = tokio::fs::canonicalize(archive).await.map_err(|e| {
            Error::staging("archive", format!("source not found: {}: {}", archive.display(), e))
        })?;
        let base = archive
            .file_name()
            .map(|b| b.to_string_lossy().into_owned())
            .ok_or_else(|| Error::staging("archive", "archive path has no file name"))?;
        let in_container = format!("/tmp/{}", base);

        info!("Copying {} into {}", archive.display(), name);
        self.runtime
            .copy_to_container(name, &archive, &in_container)
            .await?;
        self.exec_checked(
            name,
            &["k0s", "ctr", "-n", "k8s.io", "images", "import", in_container.as_str()],
        )
        .await?;
        info!("Loaded {} into {}", base, name);
        Ok(())
    }

    pub async fn load_image(&self, name: &str, image: &str) -> Result<()> {
        if is_archive_ref(image) {
            return self.load_archive(name, Path::new(image)).await;
        }

        let tmp_dir = std::env::temp_dir().join(format!("k0da-img-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&tmp_dir).await?;
        let result = self.load_saved_image(name, image, &tmp_dir).await;
        if let Err(e) = tokio::fs::remove_dir_all(&tmp_dir).await {
            warn!("Failed to clean up {}: {}", tmp_dir.display(), e);
        }
        result
    }

    async fn load_saved_image(&self, name: &str, image: &str, tmp_dir: &Path) -> Result<()> {
        let tar_path: PathBuf = tmp_dir.join("image.tar");
        info!("Saving {} from {}", image, self.runtime.name());
        self.runtime.save_image_to_tar(image, &tar_path).await?;
        self.load_archive(name, &tar_path).await
    }

    async fn exec_checked(&self, container: &str, command: &[&str]) -> Result<String> {
        let command: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        let out = self.runtime.exec_in_container(container, &command).await?;
        if !out.success() {
            return Err(Error::ExecFailed {
                container: container.to_string(),
                command: command.join(" "),
                exit_code: out.exit_code,
                output: out.stdout,
            });
        }
        Ok(out.stdout)
    }
}

pub fn is_archive_ref(reference: &str) -> bool {
    ARCHIVE_SUFFIXES.iter().any(|s| reference.ends_with(s))
}
