// Error types shared by the runtime backends, the orchestrator and the
// kubeconfig store.

use std::time::Duration;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("docker api error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// No engine could be reached, or the one found cannot run clusters.
    #[error("container runtime detection failed: {message}")]
    Detection { message: String },

    #[error("failed to stage {what}: {message}")]
    Staging { what: String, message: String },

    /// The engine call itself could not be carried out.
    #[error("{engine} call failed: {message}")]
    Engine { engine: String, message: String },

    /// The command ran inside the container but exited nonzero.
    #[error("`{command}` in {container} exited with code {exit_code}: {output}")]
    ExecFailed {
        container: String,
        command: String,
        exit_code: i32,
        output: String,
    },

    #[error("timed out after {timeout:?} waiting for {what}; retry with a larger --timeout")]
    ReadinessTimeout { what: String, timeout: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("port mapping for {port}/tcp not found on container {container}")]
    PortMappingNotFound { container: String, port: u16 },

    #[error("kubeconfig error: {message}")]
    Kubeconfig { message: String },

    #[error("invalid cluster config: {message}")]
    InvalidConfig { message: String },

    #[error("cluster '{name}' not found")]
    ClusterNotFound { name: String },

    #[error("failed to join {} node(s): {}", .failures.len(), .failures.join("; "))]
    JoinFailed { failures: Vec<String> },
}

impl Error {
    pub fn detection(message: impl Into<String>) -> Self {
        Error::Detection {
            message: message.into(),
        }
    }

    pub fn staging(what: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Staging {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn engine(engine: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Engine {
            engine: engine.into(),
            message: message.into(),
        }
    }

    pub fn kubeconfig(message: impl Into<String>) -> Self {
        Error::Kubeconfig {
            message: message.into(),
        }
    }

    pub fn invalid_config(message: impl Into<String>) -> Self {
        Error::InvalidConfig {
            message: message.into(),
        }
    }
}
