// Engine detection: flags, then environment, then well-known sockets.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use super::cli::{self, args};
use super::podman::{list_connections, PodmanConnection};
use super::{ContainerRuntime, DockerRuntime, PodmanRuntime};
use crate::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const DEFAULT_DOCKER_SOCKET: &str = "unix:///var/run/docker.sock";

// Flags that take precedence over the environment.
#[derive(Debug, Clone, Default)]
pub struct DetectOptions {
    pub runtime: String,
    pub socket: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Docker,
    Podman,
    Auto,
}

// Engine choice and socket hint after flags and environment are applied,
// before any candidate probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub engine: Engine,
    pub socket: String,
}

// `unix://` prefix for bare paths, `unix:/p` becomes `unix:///p`, anything
// else is left alone.
pub fn normalize_socket(socket: &str) -> String {
    if socket.is_empty() {
        return String::new();
    }
    if socket.starts_with('/') {
        return format!("unix://{}", socket);
    }
    if socket.starts_with("unix:/") && !socket.starts_with("unix:///") {
        return format!("unix://{}", &socket["unix:".len()..]);
    }
    socket.to_string()
}

fn first_env<F>(env: &F, keys: &[&str]) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    keys.iter()
        .filter_map(|k| env(*k))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

pub fn resolve<F>(opts: &DetectOptions, env: F) -> Result<Resolved>
where
    F: Fn(&str) -> Option<String>,
{
    let mut runtime = opts.runtime.trim().to_ascii_lowercase();
    if runtime.is_empty() {
        runtime = first_env(&env, &["K0DA_RUNTIME", "K0DA_BACKEND"])
            .unwrap_or_default()
            .to_ascii_lowercase();
    }

    let engine = match runtime.as_str() {
        "" => Engine::Auto,
        "docker" => Engine::Docker,
        "podman" => Engine::Podman,
        "containerd" => {
            return Err(Error::detection("containerd backend not implemented yet"));
        }
        other => return Err(Error::detection(format!("unknown runtime: {}", other))),
    };

    let mut socket = opts.socket.trim().to_string();
    if socket.is_empty() {
        socket = first_env(&env, &["K0DA_SOCKET"]).unwrap_or_default();
    }
    if socket.is_empty() && engine != Engine::Podman {
        socket = first_env(&env, &["DOCKER_HOST"]).unwrap_or_default();
    }

    Ok(Resolved {
        engine,
        socket: normalize_socket(&socket),
    })
}

pub fn docker_socket_candidates(home: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/var/run/docker.sock")];
    if let Some(home) = home {
        candidates.extend(
            [
                ".colima/docker.sock",
                ".colima/default/docker.sock",
                ".orbstack/run/docker.sock",
                ".lima/default/sock/docker.sock",
                "Library/Containers/com.docker.docker/Data/vms/0/docker.sock",
                ".rd/docker.sock",
                ".local/share/containers/podman/machine/podman-machine-default/podman.sock",
            ]
            .iter()
            .map(|rel| home.join(rel)),
        );
    }
    candidates
}

pub fn podman_socket_candidates<F>(env: F) -> Vec<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    let mut candidates = Vec::new();
    if let Some(dir) = first_env(&env, &["XDG_RUNTIME_DIR"]) {
        candidates.push(Path::new(&dir).join("podman").join("podman.sock"));
    }
    candidates.push(PathBuf::from("/run/podman/podman.sock"));
    candidates.push(PathBuf::from("/var/run/podman/podman.sock"));
    if let Some(tmp) = first_env(&env, &["TMPDIR"]) {
        candidates.push(
            Path::new(&tmp)
                .join("podman")
                .join("podman-machine-default.sock"),
        );
    }
    candidates
}

// True when a unix socket at `path` accepts a connection within 500ms.
#[cfg(unix)]
pub async fn probe(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    matches!(
        tokio::time::timeout(PROBE_TIMEOUT, tokio::net::UnixStream::connect(path)).await,
        Ok(Ok(_))
    )
}

#[cfg(not(unix))]
pub async fn probe(_path: &Path) -> bool {
    false
}

async fn first_reachable(candidates: &[PathBuf]) -> Option<String> {
    for path in candidates {
        if probe(path).await {
            debug!("Found reachable socket {}", path.display());
            return Some(format!("unix://{}", path.display()));
        }
    }
    None
}

async fn docker_socket() -> String {
    let home = dirs::home_dir();
    first_reachable(&docker_socket_candidates(home.as_deref()))
        .await
        .unwrap_or_else(|| DEFAULT_DOCKER_SOCKET.to_string())
}

// Socket and SSH identity for podman: connection list first, then the
// well-known socket paths.
async fn podman_socket() -> (String, String) {
    if let Ok(conns) = list_connections().await {
        if let Some(conn) = preferred_socket_connection(&conns) {
            return (conn.uri.clone(), conn.identity.clone());
        }
    }
    let socket = first_reachable(&podman_socket_candidates(|k| std::env::var(k).ok()))
        .await
        .unwrap_or_default();
    (socket, String::new())
}

// Like the backend's connection choice, but only the URI matters here so
// name hints are ignored.
fn preferred_socket_connection(conns: &[PodmanConnection]) -> Option<&PodmanConnection> {
    conns
        .iter()
        .find(|c| c.uri.starts_with("ssh://root@"))
        .or_else(|| conns.iter().find(|c| c.is_selected()))
        .or_else(|| conns.first())
        .filter(|c| !c.uri.is_empty())
}

#[derive(Debug, Deserialize)]
struct MachineInfo {
    #[serde(default, rename = "Rootful")]
    rootful: Option<bool>,
}

// `Some(false)` only when a podman machine exists and is rootless.
async fn podman_machine_rootful() -> Option<bool> {
    let out = cli::run("podman", &args(["machine", "inspect"]), &[])
        .await
        .ok()?;
    if !out.success() {
        return None;
    }
    let machines: Vec<MachineInfo> = serde_json::from_str(out.stdout.trim()).ok()?;
    machines.first()?.rootful
}

// Rootless podman machines cannot run privileged k0s nodes. Switch to a
// root connection when one exists.
async fn guard_rootless(socket: String, identity: String) -> Result<(String, String)> {
    if podman_machine_rootful().await != Some(false) {
        return Ok((socket, identity));
    }
    let conns = list_connections().await.unwrap_or_default();
    match conns.iter().find(|c| c.uri.starts_with("ssh://root@")) {
        Some(conn) => {
            warn!("Podman machine is rootless, using root connection {}", conn.name);
            Ok((conn.uri.clone(), conn.identity.clone()))
        }
        None => Err(Error::detection(
            "podman machine is rootless; run 'podman machine set --rootful' and restart it, \
             or set K0DA_RUNTIME=docker",
        )),
    }
}

async fn connect_podman(socket: String) -> Result<PodmanRuntime> {
    let (socket, identity) = if socket.is_empty() {
        podman_socket().await
    } else {
        (socket, String::new())
    };
    let (socket, identity) = guard_rootless(normalize_socket(&socket), identity).await?;
    PodmanRuntime::connect(&socket, &identity).await
}

async fn connect_docker(socket: String) -> Result<DockerRuntime> {
    let socket = if socket.is_empty() {
        docker_socket().await
    } else {
        socket
    };
    DockerRuntime::connect(&socket).await
}

// Resolves and connects to a container engine.
pub async fn detect(opts: &DetectOptions) -> Result<Arc<dyn ContainerRuntime>> {
    let resolved = resolve(opts, |k| std::env::var(k).ok())?;
    debug!("Resolved engine {:?} with socket {:?}", resolved.engine, resolved.socket);

    let runtime: Arc<dyn ContainerRuntime> = match resolved.engine {
        Engine::Docker => Arc::new(connect_docker(resolved.socket).await?),
        Engine::Podman => Arc::new(connect_podman(resolved.socket).await?),
        Engine::Auto => match connect_docker(resolved.socket.clone()).await {
            Ok(docker) => Arc::new(docker),
            Err(docker_err) => {
                debug!("Docker unavailable: {}", docker_err);
                match connect_podman(resolved.socket).await {
                    Ok(podman) => Arc::new(podman),
                    Err(podman_err) => {
                        debug!("Podman unavailable: {}", podman_err);
                        return Err(Error::detection(
                            "no supported container runtime detected; \
                             set K0DA_RUNTIME=docker|podman or configure a socket",
                        ));
                    }
                }
            }
        },
    };

    info!("Using {} runtime", runtime.name());
    Ok(runtime)
}
