// Pure builders for node container launch options.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::warn;

use crate::models::{
    ClusterConfig, NodeRole, NodeSpec, CLUSTER_TYPE, LABEL_CLUSTER, LABEL_CLUSTER_NAME,
    LABEL_CLUSTER_TYPE, LABEL_NODE_NAME, LABEL_NODE_ROLE,
};
use crate::runtime::ports::allocate_host_port;
use crate::runtime::{Mount, MountKind, PortSpec, RunContainerOptions};

pub const API_PORT: u16 = 6443;
pub const CONFIG_MOUNT: &str = "/etc/k0s/k0s.yaml";
pub const TOKEN_MOUNT: &str = "/etc/k0s/join.token";
pub const MANIFESTS_MOUNT: &str = "/var/lib/k0s/manifests/k0da";

const SECURITY_OPTS: [&str; 3] = ["seccomp=unconfined", "apparmor=unconfined", "label=disable"];

pub fn controller_args(config: &ClusterConfig, node: Option<&NodeSpec>, primary: bool) -> Vec<String> {
    let mut args: Vec<String> = [
        "k0s",
        "controller",
        "--enable-dynamic-config",
        "--disable-components=metrics-server",
        "--ignore-pre-flight-checks",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if config.is_single_node() {
        args.push("--single".to_string());
    } else {
        args.push("--enable-worker".to_string());
        args.push("--no-taints".to_string());
    }

    if !primary {
        args.push("--token-file".to_string());
        args.push(TOKEN_MOUNT.to_string());
    }
    args.push("--config".to_string());
    args.push(CONFIG_MOUNT.to_string());

    args.extend(config.spec.k0s.args.iter().cloned());
    if let Some(node) = node {
        args.extend(node.args.iter().cloned());
    }
    args
}

pub fn worker_args(node: &NodeSpec) -> Vec<String> {
    let mut args = vec![
        "k0s".to_string(),
        "worker".to_string(),
        "--token-file".to_string(),
        TOKEN_MOUNT.to_string(),
    ];
    args.extend(node.args.iter().cloned());
    args
}

pub fn publish_ports(node: Option<&NodeSpec>) -> Vec<PortSpec> {
    node.map(|n| {
        n.ports
            .iter()
            .map(|p| PortSpec {
                container_port: p.container_port,
                protocol: if p.protocol.trim().is_empty() {
                    "tcp".to_string()
                } else {
                    p.protocol.trim().to_ascii_lowercase()
                },
                host_ip: p.host_ip.trim().to_string(),
                host_port: p.host_port,
            })
            .collect()
    })
    .unwrap_or_default()
}

fn is_api_port(port: &PortSpec) -> bool {
    port.container_port == API_PORT && port.protocol() == "tcp"
}

// Adds `6443/tcp` when missing and pins its host port up front so the
// kubeconfig can be written without waiting on the engine.
pub fn ensure_api_port(mut publish: Vec<PortSpec>) -> Vec<PortSpec> {
    if !publish.iter().any(is_api_port) {
        publish.push(PortSpec::tcp(API_PORT));
    }
    if let Some(api) = publish.iter_mut().find(|p| is_api_port(p)) {
        if api.host_port == 0 {
            match allocate_host_port(&api.host_ip) {
                Ok(port) => api.host_port = port,
                Err(e) => warn!("Could not pre-allocate API host port, engine will pick one: {}", e),
            }
        }
    }
    publish
}

pub fn env_for(node: Option<&NodeSpec>) -> Vec<(String, String)> {
    node.map(|n| n.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default()
}

// Ownership labels; node labels override them.
pub fn labels_for(
    cluster: &str,
    node_name: &str,
    role: NodeRole,
    node: Option<&NodeSpec>,
) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (LABEL_CLUSTER.to_string(), "true".to_string()),
        (LABEL_CLUSTER_NAME.to_string(), cluster.to_string()),
        (LABEL_CLUSTER_TYPE.to_string(), CLUSTER_TYPE.to_string()),
        (LABEL_NODE_NAME.to_string(), node_name.to_string()),
        (LABEL_NODE_ROLE.to_string(), role.as_str().to_string()),
    ]);
    if let Some(node) = node {
        labels.extend(node.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    labels
}

pub fn volume_name(node_name: &str) -> String {
    format!("{}-var", node_name)
}

pub fn node_mounts(node: Option<&NodeSpec>) -> Vec<Mount> {
    node.map(|n| {
        n.mounts
            .iter()
            .map(|m| Mount {
                kind: MountKind::parse(&m.kind),
                source: m.source.clone(),
                target: m.target.clone(),
                options: m.options.clone(),
            })
            .collect()
    })
    .unwrap_or_default()
}

// Options shared by every node container: privileged, tmpfs `/run` and
// `/var/run`, relaxed security profiles, its own `/var` volume and the
// host kernel modules.
pub fn base_options(name: &str, image: &str, network: &str) -> RunContainerOptions {
    RunContainerOptions {
        name: name.to_string(),
        hostname: name.to_string(),
        image: image.to_string(),
        mounts: vec![
            Mount::volume(&volume_name(name), "/var"),
            Mount::bind_ro("/lib/modules", "/lib/modules"),
        ],
        tmpfs: BTreeMap::from([
            ("/run".to_string(), String::new()),
            ("/var/run".to_string(), String::new()),
        ]),
        security_opt: SECURITY_OPTS.iter().map(|s| s.to_string()).collect(),
        privileged: true,
        network: network.to_string(),
        ..Default::default()
    }
}

pub fn primary_options(
    cluster: &str,
    config: &ClusterConfig,
    image: &str,
    network: &str,
    manifests_dir: &Path,
    config_file: &Path,
) -> RunContainerOptions {
    let node = config.primary_node();
    let mut opts = base_options(cluster, image, network);
    opts.mounts.push(Mount::bind(manifests_dir, MANIFESTS_MOUNT));
    opts.mounts.push(Mount::bind_ro(config_file, CONFIG_MOUNT));
    opts.mounts.extend(node_mounts(node));
    opts.args = controller_args(config, node, true);
    opts.publish = ensure_api_port(publish_ports(node));
    opts.env = env_for(node);
    opts.labels = labels_for(cluster, cluster, NodeRole::Controller, node);
    if let Some(image) = node.and_then(NodeSpec::image_override) {
        opts.image = image.to_string();
    }
    opts
}

pub fn joining_options(
    cluster: &str,
    config: &ClusterConfig,
    node: &NodeSpec,
    node_name: &str,
    image: &str,
    network: &str,
    token_file: &Path,
    config_file: &Path,
) -> RunContainerOptions {
    let role = node.node_role();
    let mut opts = base_options(node_name, image, network);
    opts.mounts.push(Mount::bind_ro(token_file, TOKEN_MOUNT));
    if role == NodeRole::Controller {
        opts.mounts.push(Mount::bind_ro(config_file, CONFIG_MOUNT));
    }
    opts.mounts.extend(node_mounts(Some(node)));
    opts.args = match role {
        NodeRole::Controller => controller_args(config, Some(node), false),
        NodeRole::Worker => worker_args(node),
    };
    opts.publish = publish_ports(Some(node));
    opts.env = env_for(Some(node));
    opts.labels = labels_for(cluster, node_name, role, Some(node));
    if let Some(image) = node.image_override() {
        opts.image = image.to_string();
    }
    opts
}
