pub mod cli;
pub mod detect;
pub mod docker;
pub mod podman;
pub mod ports;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;

use crate::Result;

pub use detect::{detect, normalize_socket, DetectOptions};
pub use docker::DockerRuntime;
pub use podman::PodmanRuntime;

// A port to publish from the container to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    pub container_port: u16,
    pub protocol: String,
    pub host_ip: String,
    pub host_port: u16,
}

impl PortSpec {
    pub fn tcp(container_port: u16) -> Self {
        Self {
            container_port,
            protocol: "tcp".to_string(),
            host_ip: String::new(),
            host_port: 0,
        }
    }

    pub fn protocol(&self) -> String {
        let proto = self.protocol.trim().to_ascii_lowercase();
        if proto.is_empty() {
            "tcp".to_string()
        } else {
            proto
        }
    }

    pub fn key(&self) -> String {
        format!("{}/{}", self.container_port, self.protocol())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
    Volume,
    Tmpfs,
}

impl MountKind {
    pub fn parse(kind: &str) -> Self {
        match kind.trim().to_ascii_lowercase().as_str() {
            "volume" => MountKind::Volume,
            "tmpfs" => MountKind::Tmpfs,
            _ => MountKind::Bind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
    pub options: Vec<String>,
}

impl Mount {
    pub fn bind(source: impl AsRef<Path>, target: &str) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.as_ref().to_string_lossy().into_owned(),
            target: target.to_string(),
            options: Vec::new(),
        }
    }

    pub fn bind_ro(source: impl AsRef<Path>, target: &str) -> Self {
        Self {
            options: vec!["ro".to_string()],
            ..Self::bind(source, target)
        }
    }

    pub fn volume(name: &str, target: &str) -> Self {
        Self {
            kind: MountKind::Volume,
            source: name.to_string(),
            target: target.to_string(),
            options: Vec::new(),
        }
    }

    pub fn to_bind(&self) -> Option<String> {
        if self.kind == MountKind::Tmpfs {
            return None;
        }
        let mut entry = format!("{}:{}", self.source, self.target);
        if !self.options.is_empty() {
            entry.push(':');
            entry.push_str(&self.options.join(","));
        }
        Some(entry)
    }
}

// Everything needed to create and start one node container.
#[derive(Debug, Clone, Default)]
pub struct RunContainerOptions {
    pub name: String,
    pub hostname: String,
    pub image: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    pub tmpfs: BTreeMap<String, String>,
    pub security_opt: Vec<String>,
    pub privileged: bool,
    pub publish: Vec<PortSpec>,
    pub network: String,
}

impl RunContainerOptions {
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn binds(&self) -> Vec<String> {
        self.mounts.iter().filter_map(Mount::to_bind).collect()
    }
}

// Read-only view of a container as reported by the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub ports: String,
    pub created: i64,
    pub labels: HashMap<String, String>,
}

// Result of a command run inside a container. A nonzero `exit_code` is
// not an error at this layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// Capabilities the orchestrator needs from a container engine.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    async fn run_container(&self, opts: &RunContainerOptions) -> Result<String>;
    async fn container_exists(&self, name: &str) -> Result<bool>;
    async fn container_is_running(&self, name: &str) -> Result<bool>;
    async fn stop_container(&self, name: &str) -> Result<()>;
    async fn remove_container(&self, name: &str) -> Result<()>;

    async fn exec_in_container(&self, name: &str, command: &[String]) -> Result<ExecOutput>;

    async fn get_port_mapping(
        &self,
        name: &str,
        container_port: u16,
        protocol: &str,
    ) -> Result<(String, u16)>;

    async fn volume_exists(&self, name: &str) -> Result<bool>;
    async fn remove_volume(&self, name: &str) -> Result<()>;

    async fn list_containers_by_label(
        &self,
        selector: &BTreeMap<String, String>,
        include_stopped: bool,
    ) -> Result<Vec<ContainerRecord>>;

    async fn copy_to_container(&self, name: &str, src: &Path, dst: &str) -> Result<()>;
    async fn save_image_to_tar(&self, image: &str, tar_path: &Path) -> Result<()>;

    async fn ensure_network(&self, name: &str) -> Result<()>;
}
