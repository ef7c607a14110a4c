use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use bollard::{
    container::{
        Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
        RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    },
    image::CreateImageOptions,
    models::{ContainerSummary, HostConfig, Network, PortBinding, ResourcesUlimits},
    network::{CreateNetworkOptions, ListNetworksOptions},
    volume::{ListVolumesOptions, RemoveVolumeOptions},
    Docker, API_DEFAULT_VERSION,
};
use futures::TryStreamExt;
use tracing::{debug, info};

use super::cli::{self, args};
use super::ports::{format_port, parse_port_output};
use super::{ContainerRecord, ContainerRuntime, ExecOutput, PortSpec, RunContainerOptions};
use crate::{Error, Result};

const CONNECT_TIMEOUT_SECS: u64 = 120;
const STOP_TIMEOUT_SECS: i64 = 10;

// Docker backend: API client for structured calls, the `docker` CLI for
// exec, cp, save and as a port lookup fallback.
pub struct DockerRuntime {
    docker: Docker,
    socket: String,
}

impl DockerRuntime {
    pub async fn connect(socket: &str) -> Result<Self> {
        if socket.is_empty() {
            return Err(Error::detection("docker socket not specified"));
        }

        let docker = if socket.starts_with("unix://") {
            Docker::connect_with_unix(socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else if socket.starts_with("tcp://") || socket.starts_with("http://") {
            Docker::connect_with_http(socket, CONNECT_TIMEOUT_SECS, API_DEFAULT_VERSION)?
        } else {
            return Err(Error::detection(format!(
                "unsupported docker host {}; use a unix:// or tcp:// address",
                socket
            )));
        };

        // Test Docker connection
        docker.ping().await?;
        info!("Connected to Docker daemon at {}", socket);

        Ok(Self {
            docker,
            socket: socket.to_string(),
        })
    }

    fn cli_env(&self) -> Vec<(String, String)> {
        vec![("DOCKER_HOST".to_string(), self.socket.clone())]
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        debug!("Pulling image {}", image);
        let (from_image, tag) = split_image_ref(image);
        let options = CreateImageOptions {
            from_image,
            tag,
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn find_containers(&self, name: &str, all: bool) -> Result<Vec<ContainerSummary>> {
        let filters = HashMap::from([("name".to_string(), vec![format!("^{}$", name)])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn name(&self) -> &str {
        "docker"
    }

    async fn run_container(&self, opts: &RunContainerOptions) -> Result<String> {
        if !opts.image.is_empty() {
            self.pull_image(&opts.image).await?;
        }

        let mut exposed_ports = HashMap::new();
        let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
        for port in &opts.publish {
            exposed_ports.insert(port.key(), HashMap::new());
            let host_ip = if port.host_ip.is_empty() {
                "0.0.0.0".to_string()
            } else {
                port.host_ip.clone()
            };
            let binding = PortBinding {
                host_ip: Some(host_ip),
                host_port: (port.host_port != 0).then(|| port.host_port.to_string()),
            };
            if let Some(bindings) = port_bindings.entry(port.key()).or_insert_with(|| Some(Vec::new())) {
                bindings.push(binding);
            }
        }

        let host_config = HostConfig {
            privileged: Some(opts.privileged),
            security_opt: (!opts.security_opt.is_empty()).then(|| opts.security_opt.clone()),
            tmpfs: (!opts.tmpfs.is_empty())
                .then(|| opts.tmpfs.clone().into_iter().collect::<HashMap<_, _>>()),
            binds: Some(opts.binds()),
            port_bindings: (!port_bindings.is_empty()).then_some(port_bindings),
            network_mode: (!opts.network.is_empty()).then(|| opts.network.clone()),
            // k0s needs unlimited memlock for eBPF
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("memlock".to_string()),
                soft: Some(-1),
                hard: Some(-1),
            }]),
            ..Default::default()
        };

        let config = Config {
            image: Some(opts.image.clone()),
            cmd: Some(opts.args.clone()),
            env: Some(opts.env_strings()),
            labels: Some(opts.labels.clone().into_iter().collect()),
            hostname: (!opts.hostname.is_empty()).then(|| opts.hostname.clone()),
            tty: Some(true),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: opts.name.clone(),
            ..Default::default()
        };

        info!("Creating container {} with image {}", opts.name, opts.image);
        let created = self.docker.create_container(Some(options), config).await?;

        info!("Starting container {}", opts.name);
        self.docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await?;

        Ok(created.id)
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(!self.find_containers(name, true).await?.is_empty())
    }

    async fn container_is_running(&self, name: &str) -> Result<bool> {
        Ok(!self.find_containers(name, false).await?.is_empty())
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.docker
            .stop_container(name, Some(StopContainerOptions { t: STOP_TIMEOUT_SECS }))
            .await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    async fn exec_in_container(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut argv = args(["exec", name]);
        argv.extend(command.iter().cloned());
        cli::run("docker", &argv, &self.cli_env()).await
    }

    async fn get_port_mapping(
        &self,
        name: &str,
        container_port: u16,
        protocol: &str,
    ) -> Result<(String, u16)> {
        let key = PortSpec {
            protocol: protocol.to_string(),
            ..PortSpec::tcp(container_port)
        }
        .key();

        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;
        let binding = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| bindings.into_iter().next());
        if let Some(binding) = binding {
            let port = binding
                .host_port
                .as_deref()
                .and_then(|p| p.parse::<u16>().ok())
                .unwrap_or(0);
            if port != 0 {
                return Ok((binding.host_ip.unwrap_or_default(), port));
            }
        }

        debug!("Inspect has no binding for {} on {}, asking the CLI", key, name);
        let out = cli::run("docker", &args(["port", name, key.as_str()]), &self.cli_env()).await?;
        if out.success() {
            if let Some(mapping) = parse_port_output(&out.stdout) {
                return Ok(mapping);
            }
        }
        Err(Error::PortMappingNotFound {
            container: name.to_string(),
            port: container_port,
        })
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let volumes = self
            .docker
            .list_volumes(Some(ListVolumesOptions { filters }))
            .await?;
        // The name filter matches substrings.
        Ok(volumes
            .volumes
            .unwrap_or_default()
            .iter()
            .any(|v| v.name == name))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force: true }))
            .await?;
        Ok(())
    }

    async fn list_containers_by_label(
        &self,
        selector: &BTreeMap<String, String>,
        include_stopped: bool,
    ) -> Result<Vec<ContainerRecord>> {
        let labels = selector.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let filters = HashMap::from([("label".to_string(), labels)]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: include_stopped,
                filters,
                ..Default::default()
            }))
            .await?;
        Ok(containers.into_iter().map(record_from_summary).collect())
    }

    async fn copy_to_container(&self, name: &str, src: &Path, dst: &str) -> Result<()> {
        let target = format!("{}:{}", name, dst);
        let argv = args(["cp".to_string(), src.to_string_lossy().into_owned(), target]);
        cli::run_checked("docker", &argv, &self.cli_env(), "docker cp").await?;
        Ok(())
    }

    async fn save_image_to_tar(&self, image: &str, tar_path: &Path) -> Result<()> {
        let argv = args([
            "save".to_string(),
            "-o".to_string(),
            tar_path.to_string_lossy().into_owned(),
            image.to_string(),
        ]);
        cli::run_checked("docker", &argv, &self.cli_env(), "docker save").await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Ok(());
        }
        let filters = HashMap::from([("name".to_string(), vec![name.to_string()])]);
        let networks = self
            .docker
            .list_networks(Some(ListNetworksOptions { filters }))
            .await?;
        if has_network(&networks, name) {
            debug!("Network {} already exists", name);
            return Ok(());
        }

        info!("Creating network {}", name);
        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                check_duplicate: true,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

fn record_from_summary(c: ContainerSummary) -> ContainerRecord {
    let name = c
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_default();
    let ports = c
        .ports
        .unwrap_or_default()
        .iter()
        .map(|p| {
            let proto = p.typ.as_ref().map(|t| t.to_string()).unwrap_or_default();
            format_port(
                p.ip.as_deref().unwrap_or_default(),
                p.public_port.unwrap_or(0),
                p.private_port,
                &proto,
            )
        })
        .collect::<Vec<_>>()
        .join(", ");

    ContainerRecord {
        id: c.id.unwrap_or_default(),
        name,
        image: c.image.unwrap_or_default(),
        status: c.status.unwrap_or_default(),
        ports,
        created: c.created.unwrap_or(0),
        labels: c.labels.unwrap_or_default(),
    }
}

// The engine's name filter matches substrings, so only an exact name counts.
pub fn has_network(networks: &[Network], name: &str) -> bool {
    networks.iter().any(|n| n.name.as_deref() == Some(name))
}

// Splits an image reference into the repository and tag the create-image
// call expects. A missing tag means `latest`; digests are passed whole.
pub fn split_image_ref(image: &str) -> (String, String) {
    if image.contains('@') {
        return (image.to_string(), String::new());
    }
    let slash = image.rfind('/').map(|i| i + 1).unwrap_or(0);
    match image[slash..].rfind(':') {
        Some(colon) => {
            let colon = slash + colon;
            (image[..colon].to_string(), image[colon + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}
