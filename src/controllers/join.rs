use std::path::PathBuf;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::launch::joining_options;
use super::readiness::wait_for_ready;
use crate::models::{ClusterConfig, NodeRole, NodeSpec};
use crate::runtime::ContainerRuntime;
use crate::storage::ManifestStore;
use crate::{Error, Result};

// A non-primary node with its resolved container name.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinPlan {
    pub name: String,
    pub role: NodeRole,
    pub node: NodeSpec,
}

// Non-primary nodes in declared order. Unnamed nodes become
// `{cluster}-{role}-{i}`, `i` counting unnamed nodes only.
pub fn plan_joins(cluster: &str, config: &ClusterConfig) -> Vec<JoinPlan> {
    let mut unnamed = 0;
    config
        .joining_nodes()
        .into_iter()
        .map(|node| {
            let role = node.node_role();
            let name = if node.name.trim().is_empty() {
                let name = format!("{}-{}-{}", cluster, role, unnamed);
                unnamed += 1;
                name
            } else {
                node.name.trim().to_string()
            };
            JoinPlan {
                name,
                role,
                node: node.clone(),
            }
        })
        .collect()
}

pub fn token_command(role: NodeRole) -> Vec<String> {
    vec![
        "k0s".to_string(),
        "token".to_string(),
        "create".to_string(),
        format!("--role={}", role),
    ]
}

// Mints a join token for `role` on the primary controller.
pub async fn mint_token(runtime: &dyn ContainerRuntime, primary: &str, role: NodeRole) -> Result<String> {
    let command = token_command(role);
    let out = runtime.exec_in_container(primary, &command).await?;
    if !out.success() {
        return Err(Error::ExecFailed {
            container: primary.to_string(),
            command: command.join(" "),
            exit_code: out.exit_code,
            output: out.stdout,
        });
    }
    let token = out.stdout.trim().to_string();
    if token.is_empty() {
        return Err(Error::engine(
            runtime.name(),
            format!("empty {} token from {}", role, primary),
        ));
    }
    Ok(token)
}

// Everything a join needs from the surrounding create call.
pub struct JoinContext<'a> {
    pub runtime: &'a dyn ContainerRuntime,
    pub cluster: &'a str,
    pub config: &'a ClusterConfig,
    pub image: &'a str,
    pub network: &'a str,
    pub staging: &'a ManifestStore,
    pub wait: Option<Duration>,
    pub readiness_interval: Duration,
    pub concurrency: usize,
    pub cancel: &'a CancellationToken,
}

// Mints tokens one by one in declared order, then launches the node
// containers at most `concurrency` at a time. Failures are collected and
// reported together.
pub async fn join_nodes(ctx: &JoinContext<'_>) -> Result<Vec<String>> {
    let plans = plan_joins(ctx.cluster, ctx.config);
    if plans.is_empty() {
        return Ok(Vec::new());
    }

    let mut failures = Vec::new();
    let mut ready: Vec<(JoinPlan, PathBuf)> = Vec::with_capacity(plans.len());
    for plan in plans {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let token = match mint_token(ctx.runtime, ctx.cluster, plan.role).await {
            Ok(token) => token,
            Err(e) => {
                error!("Failed to create {} token for {}: {}", plan.role, plan.name, e);
                failures.push(format!("{}: {}", plan.name, e));
                continue;
            }
        };
        match ctx.staging.write_token(&plan.name, &token).await {
            Ok(path) => ready.push((plan, path)),
            Err(e) => failures.push(format!("{}: {}", plan.name, e)),
        }
    }

    let config_file = ctx.staging.layout().config_file();
    let results: Vec<(String, Result<()>)> = stream::iter(ready)
        .map(|(plan, token_file)| {
            let config_file = &config_file;
            async move {
                let result = launch_node(ctx, &plan, &token_file, config_file).await;
                (plan.name, result)
            }
        })
        .buffer_unordered(ctx.concurrency.max(1))
        .collect()
        .await;

    let mut joined = Vec::new();
    for (name, result) in results {
        match result {
            Ok(()) => joined.push(name),
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                error!("Node {} failed to join: {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }
    }

    if !failures.is_empty() {
        return Err(Error::JoinFailed { failures });
    }
    Ok(joined)
}

async fn launch_node(
    ctx: &JoinContext<'_>,
    plan: &JoinPlan,
    token_file: &std::path::Path,
    config_file: &std::path::Path,
) -> Result<()> {
    let opts = joining_options(
        ctx.cluster,
        ctx.config,
        &plan.node,
        &plan.name,
        ctx.image,
        ctx.network,
        token_file,
        config_file,
    );
    info!("Starting {} node {} with image {}", plan.role, plan.name, opts.image);
    ctx.runtime.run_container(&opts).await?;

    // Workers do not serve the status endpoint the readiness check relies on.
    if let (Some(timeout), NodeRole::Controller) = (ctx.wait, plan.role) {
        wait_for_ready(ctx.runtime, &plan.name, timeout, ctx.readiness_interval, ctx.cancel).await?;
    }
    Ok(())
}
