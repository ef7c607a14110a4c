use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::launch::API_PORT;
use super::{poll_until, RetryPolicy};
use crate::runtime::ContainerRuntime;
use crate::{Error, Result};

const READY_MARKER: &str = "Kube-api probing successful: true";

pub fn status_command() -> Vec<String> {
    vec!["k0s".to_string(), "status".to_string()]
}

pub fn is_ready_output(output: &str) -> bool {
    output.contains(READY_MARKER)
}

// Polls `k0s status` in `container` until the API server reports healthy.
pub async fn wait_for_ready(
    runtime: &dyn ContainerRuntime,
    container: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    info!("Waiting for {} to be ready (timeout: {:?})", container, timeout);
    let command = status_command();

    let ready = poll_until(RetryPolicy::deadline(timeout, interval), cancel, || {
        let command = &command;
        async move {
            // Exec failures are expected while k0s is still starting.
            match runtime.exec_in_container(container, command).await {
                Ok(out) if out.success() && is_ready_output(&out.stdout) => Ok(Some(())),
                Ok(out) => {
                    debug!("{} not ready yet (exit {})", container, out.exit_code);
                    Ok(None)
                }
                Err(e) => {
                    debug!("k0s status in {} failed: {}", container, e);
                    Ok(None)
                }
            }
        }
    })
    .await?;

    match ready {
        Some(()) => {
            info!("{} is ready", container);
            Ok(())
        }
        None => Err(Error::ReadinessTimeout {
            what: container.to_string(),
            timeout,
        }),
    }
}

// Host port bound to the API server of `container`, retried while the
// engine registers dynamic mappings.
pub async fn resolve_api_port(
    runtime: &dyn ContainerRuntime,
    container: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<u16> {
    let port = poll_until(policy, cancel, || async move {
        match runtime.get_port_mapping(container, API_PORT, "tcp").await {
            Ok((_, port)) if port != 0 => Ok(Some(port)),
            Ok(_) => Ok(None),
            Err(e) => {
                debug!("Port lookup on {} failed: {}", container, e);
                Ok(None)
            }
        }
    })
    .await?;

    port.ok_or_else(|| Error::PortMappingNotFound {
        container: container.to_string(),
        port: API_PORT,
    })
}
