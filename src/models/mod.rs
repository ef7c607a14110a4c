pub mod cluster;
pub mod node;
pub mod version;

pub use cluster::{ClusterConfig, K0sSpec, OptionsSpec, Spec};
pub use node::{MountSpec, NodeRole, NodeSpec, PortConfig};

pub const LABEL_CLUSTER: &str = "k0da.cluster";
pub const LABEL_CLUSTER_NAME: &str = "k0da.cluster.name";
pub const LABEL_CLUSTER_TYPE: &str = "k0da.cluster.type";
pub const LABEL_NODE_NAME: &str = "k0da.node.name";
pub const LABEL_NODE_ROLE: &str = "k0da.node.role";

pub const CLUSTER_TYPE: &str = "k0s";
