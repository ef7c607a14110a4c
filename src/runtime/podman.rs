use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::cli::{self, args};
use super::ports::{format_port, parse_port_output};
use super::{ContainerRecord, ContainerRuntime, ExecOutput, PortSpec, RunContainerOptions};
use crate::{Error, Result};

const PODMAN: &str = "podman";
pub const CONNECTION_ENV: &str = "K0DA_PODMAN_CONNECTION";

// Podman backend. Every operation shells out to the `podman` CLI, either
// through a named `--connection` or with `CONTAINER_HOST` pointing at the
// resolved socket.
pub struct PodmanRuntime {
    socket: String,
    identity: String,
    connection: String,
}

impl PodmanRuntime {
    pub async fn connect(socket: &str, identity: &str) -> Result<Self> {
        let connection = match std::env::var(CONNECTION_ENV) {
            Ok(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => list_connections()
                .await
                .ok()
                .and_then(|conns| preferred_connection(&conns).map(|c| c.name.clone()))
                .unwrap_or_default(),
        };

        let runtime = Self {
            socket: socket.to_string(),
            identity: identity.to_string(),
            connection,
        };

        let out = runtime
            .podman(args(["version", "--format", "{{.Version}}"]))
            .await?;
        if !out.success() || out.stdout.trim().is_empty() {
            return Err(Error::engine(
                PODMAN,
                format!("podman CLI not available or unreachable: {}", out.stdout.trim()),
            ));
        }

        info!(
            "Using podman {} via {}",
            out.stdout.trim(),
            if runtime.connection.is_empty() { &runtime.socket } else { &runtime.connection }
        );
        Ok(runtime)
    }

    fn env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if self.connection.is_empty() && !self.socket.is_empty() {
            env.push(("CONTAINER_HOST".to_string(), self.socket.clone()));
            if self.socket.starts_with("ssh://")
                && !self.identity.trim().is_empty()
                && std::env::var_os("CONTAINER_SSHKEY").is_none()
            {
                env.push(("CONTAINER_SSHKEY".to_string(), self.identity.clone()));
            }
        }
        env
    }

    fn with_connection(&self, argv: Vec<String>) -> Vec<String> {
        if self.connection.trim().is_empty() {
            return argv;
        }
        let mut full = args(["--connection", self.connection.as_str()]);
        full.extend(argv);
        full
    }

    async fn podman(&self, argv: Vec<String>) -> Result<ExecOutput> {
        cli::run(PODMAN, &self.with_connection(argv), &self.env()).await
    }

    async fn podman_checked(&self, argv: Vec<String>, what: &str) -> Result<String> {
        cli::run_checked(PODMAN, &self.with_connection(argv), &self.env(), what).await
    }
}

#[async_trait]
impl ContainerRuntime for PodmanRuntime {
    fn name(&self) -> &str {
        PODMAN
    }

    async fn run_container(&self, opts: &RunContainerOptions) -> Result<String> {
        let argv = run_args(opts)?;
        info!("Starting container {} with image {}", opts.name, opts.image);
        let out = self.podman_checked(argv, "podman run").await?;
        Ok(out.trim().to_string())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        let out = self.podman(args(["inspect", "-t", "container", name])).await?;
        Ok(out.success())
    }

    async fn container_is_running(&self, name: &str) -> Result<bool> {
        let out = self
            .podman(args([
                "inspect",
                "-t",
                "container",
                name,
                "--format",
                "{{.State.Running}}",
            ]))
            .await?;
        Ok(out.success() && out.stdout.trim() == "true")
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        self.podman_checked(args(["stop", name]), "podman stop").await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.podman_checked(args(["rm", "-f", name]), "podman rm").await?;
        Ok(())
    }

    async fn exec_in_container(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        let mut argv = args(["exec", name]);
        argv.extend(command.iter().cloned());
        self.podman(argv).await
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
        let out = self.podman(args(["port", name, key.as_str()])).await?;
        if !out.success() {
            debug!("podman port {} {}: {}", name, key, out.stdout.trim());
        }
        out.success()
            .then(|| parse_port_output(&out.stdout))
            .flatten()
            .filter(|(_, port)| *port != 0)
            .ok_or_else(|| Error::PortMappingNotFound {
                container: name.to_string(),
                port: container_port,
            })
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        let out = self.podman(args(["volume", "inspect", name])).await?;
        Ok(out.success())
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.podman_checked(args(["volume", "rm", "-f", name]), "podman volume rm")
            .await?;
        Ok(())
    }

    async fn list_containers_by_label(
        &self,
        selector: &BTreeMap<String, String>,
        include_stopped: bool,
    ) -> Result<Vec<ContainerRecord>> {
        let mut argv = args(["ps", "--format", "json"]);
        if include_stopped {
            argv.push("-a".to_string());
        }
        for (k, v) in selector {
            argv.push("--filter".to_string());
            argv.push(format!("label={}={}", k, v));
        }
        let out = self.podman_checked(argv, "podman ps").await?;
        parse_ps_output(&out)
    }

    async fn copy_to_container(&self, name: &str, src: &Path, dst: &str) -> Result<()> {
        let argv = args([
            "cp".to_string(),
            src.to_string_lossy().into_owned(),
            format!("{}:{}", name, dst),
        ]);
        self.podman_checked(argv, "podman cp").await?;
        Ok(())
    }

    async fn save_image_to_tar(&self, image: &str, tar_path: &Path) -> Result<()> {
        let argv = args([
            "save".to_string(),
            "-o".to_string(),
            tar_path.to_string_lossy().into_owned(),
            image.to_string(),
        ]);
        self.podman_checked(argv, "podman save").await?;
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Ok(());
        }
        if self.podman(args(["network", "inspect", name])).await?.success() {
            debug!("Network {} already exists", name);
            return Ok(());
        }
        info!("Creating network {}", name);
        self.podman_checked(args(["network", "create", name]), "podman network create")
            .await?;
        Ok(())
    }
}

// Builds the `podman run` argument list for `opts`.
pub fn run_args(opts: &RunContainerOptions) -> Result<Vec<String>> {
    if opts.image.trim().is_empty() {
        return Err(Error::engine(PODMAN, "image is required"));
    }

    let mut argv = args(["run", "-d", "--restart", "unless-stopped"]);
    if !opts.name.trim().is_empty() {
        argv.extend(args(["--name", opts.name.as_str()]));
    }
    if !opts.hostname.trim().is_empty() {
        argv.extend(args(["--hostname", opts.hostname.as_str()]));
    }
    if opts.privileged {
        argv.push("--privileged".to_string());
    }
    for env in opts.env_strings() {
        argv.push("-e".to_string());
        argv.push(env);
    }
    for (k, v) in &opts.labels {
        argv.push("--label".to_string());
        argv.push(format!("{}={}", k, v));
    }
    for bind in opts.binds() {
        argv.push("-v".to_string());
        argv.push(bind);
    }
    for (path, options) in &opts.tmpfs {
        if path.trim().is_empty() {
            continue;
        }
        argv.push("--tmpfs".to_string());
        if options.trim().is_empty() {
            argv.push(path.clone());
        } else {
            argv.push(format!("{}:{}", path, options));
        }
    }
    for opt in &opts.security_opt {
        argv.extend(args(["--security-opt", opt.as_str()]));
    }
    if !opts.network.trim().is_empty() {
        argv.extend(args(["--network", opts.network.as_str()]));
    }
    for port in &opts.publish {
        argv.push("-p".to_string());
        if port.host_port == 0 {
            argv.push(port.key());
        } else if port.host_ip.trim().is_empty() {
            argv.push(format!("{}:{}", port.host_port, port.key()));
        } else {
            argv.push(format!("{}:{}:{}", port.host_ip, port.host_port, port.key()));
        }
    }
    argv.push(opts.image.clone());
    argv.extend(opts.args.iter().cloned());
    Ok(argv)
}

#[derive(Debug, Default, Deserialize)]
struct PsEntry {
    #[serde(default, rename = "Id", alias = "ID")]
    id: String,
    #[serde(default, rename = "Names")]
    names: Option<Value>,
    #[serde(default, rename = "Image")]
    image: String,
    #[serde(default, rename = "Status")]
    status: String,
    #[serde(default, rename = "Labels")]
    labels: Option<HashMap<String, String>>,
    #[serde(default, rename = "Ports")]
    ports: Option<Vec<PsPort>>,
    #[serde(default, rename = "Created")]
    created: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct PsPort {
    #[serde(default, alias = "HostIp", alias = "hostIP")]
    host_ip: String,
    #[serde(default, alias = "HostPort", alias = "hostPort")]
    host_port: u16,
    #[serde(default, alias = "ContainerPort", alias = "containerPort")]
    container_port: u16,
    #[serde(default, alias = "Protocol")]
    protocol: String,
}

// Parses `podman ps --format json`.
pub fn parse_ps_output(output: &str) -> Result<Vec<ContainerRecord>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<PsEntry> = serde_json::from_str(output)?;
    Ok(entries
        .into_iter()
        .map(|e| {
            // Names is a list on current podman, a plain string on older ones.
            let name = match e.names {
                Some(Value::Array(names)) => names
                    .first()
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                Some(Value::String(name)) => name,
                _ => String::new(),
            };
            let ports = e
                .ports
                .unwrap_or_default()
                .iter()
                .map(|p| {
                    format_port(
                        &p.host_ip,
                        p.host_port,
                        p.container_port,
                        &p.protocol.to_ascii_lowercase(),
                    )
                })
                .collect::<Vec<_>>()
                .join(", ");
            ContainerRecord {
                id: e.id,
                name: name.trim().trim_start_matches('/').to_string(),
                image: e.image,
                status: e.status,
                ports,
                created: e.created.as_ref().and_then(Value::as_i64).unwrap_or(0),
                labels: e.labels.unwrap_or_default(),
            }
        })
        .collect())
}

// One entry of `podman system connection list --format json`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodmanConnection {
    #[serde(default, rename = "Name")]
    pub name: String,
    #[serde(default, rename = "URI")]
    pub uri: String,
    #[serde(default, rename = "Identity")]
    pub identity: String,
    #[serde(default, rename = "Default")]
    default: Option<Value>,
    #[serde(default, rename = "Active")]
    active: Option<Value>,
    #[serde(default, rename = "Current")]
    current: Option<Value>,
}

impl PodmanConnection {
    pub fn is_root(&self) -> bool {
        self.uri.to_ascii_lowercase().starts_with("ssh://root@")
            || self.name.to_ascii_lowercase().contains("root")
    }

    pub fn is_selected(&self) -> bool {
        [&self.default, &self.active, &self.current]
            .into_iter()
            .flatten()
            .any(|v| match v {
                Value::Bool(b) => *b,
                Value::String(s) => s.trim() == "*",
                _ => false,
            })
    }
}

pub fn parse_connections(output: &str) -> Result<Vec<PodmanConnection>> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(output)?)
}

pub async fn list_connections() -> Result<Vec<PodmanConnection>> {
    let out = cli::run_checked(
        PODMAN,
        &args(["system", "connection", "list", "--format", "json"]),
        &[],
        "podman system connection list",
    )
    .await?;
    parse_connections(&out)
}

// Root entry first, then the selected one, then whatever comes first.
pub fn preferred_connection(conns: &[PodmanConnection]) -> Option<&PodmanConnection> {
    conns
        .iter()
        .find(|c| c.is_root())
        .or_else(|| conns.iter().find(|c| c.is_selected()))
        .or_else(|| conns.first())
        .filter(|c| !c.name.is_empty())
}
