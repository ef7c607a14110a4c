use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use super::node::{NodeRole, NodeSpec};
use super::version::{normalize_image_tag, normalize_version_tag};
use crate::settings::Settings;
use crate::{Error, Result};

pub const API_VERSION: &str = "k0da.k0sproject.io/v1alpha1";
pub const KIND: &str = "Cluster";

/// Declarative cluster topology, loaded from the `-c` YAML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConfig {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub spec: Spec,
    /// File the config was read from; relative manifest paths resolve against it.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Spec {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub k0s: K0sSpec,
    #[serde(default)]
    pub options: OptionsSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct K0sSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// Inline k0s ClusterConfig, merged over the built-in defaults.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_yaml::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifests: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OptionsSpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
}

impl ClusterConfig {
    /// Loads and validates the config at `path`. `None` yields the defaults
    /// for a single-node cluster.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let data = std::fs::read_to_string(path).map_err(|e| {
                    Error::invalid_config(format!("read {}: {}", path.display(), e))
                })?;
                let mut config = Self::from_yaml(&data)?;
                config.source_path = Some(path.to_path_buf());
                config
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(data).map_err(|e| Error::invalid_config(format!("parse: {}", e)))
    }

    /// Fills in `kind`/`apiVersion` and rejects nodes without a role.
    pub fn validate(&mut self) -> Result<()> {
        if self.kind.is_empty() {
            self.kind = KIND.to_string();
        }
        if self.api_version.is_empty() {
            self.api_version = API_VERSION.to_string();
        }
        if self.kind != KIND {
            return Err(Error::invalid_config(format!(
                "unsupported kind: {:?} (expected {})",
                self.kind, KIND
            )));
        }
        if self.api_version != API_VERSION {
            return Err(Error::invalid_config(format!(
                "unsupported apiVersion: {:?}",
                self.api_version
            )));
        }
        if !self.spec.k0s.image.is_empty() && self.spec.k0s.image.len() < 3 {
            return Err(Error::invalid_config("invalid k0s.image"));
        }
        if self.spec.nodes.iter().any(|n| n.role.trim().is_empty()) {
            return Err(Error::invalid_config("node role is required"));
        }
        Ok(())
    }

    /// The first controller, or the first node when there is no controller.
    pub fn primary_index(&self) -> Option<usize> {
        self.spec
            .nodes
            .iter()
            .position(|n| n.node_role() == NodeRole::Controller)
            .or_else(|| (!self.spec.nodes.is_empty()).then_some(0))
    }

    pub fn primary_node(&self) -> Option<&NodeSpec> {
        self.primary_index().map(|i| &self.spec.nodes[i])
    }

    /// Nodes that join the primary, in declared order.
    pub fn joining_nodes(&self) -> Vec<&NodeSpec> {
        let primary = self.primary_index();
        self.spec
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| Some(*i) != primary)
            .map(|(_, n)| n)
            .collect()
    }

    pub fn is_single_node(&self) -> bool {
        self.spec.nodes.len() <= 1
    }

    pub fn network<'a>(&'a self, settings: &'a Settings) -> &'a str {
        if self.spec.options.network.trim().is_empty() {
            &settings.default_network
        } else {
            self.spec.options.network.trim()
        }
    }

    /// Image pinned by the config, if any: explicit image, then version.
    pub fn pinned_image(&self, settings: &Settings) -> Option<String> {
        let k0s = &self.spec.k0s;
        if !k0s.image.trim().is_empty() {
            Some(normalize_image_tag(&k0s.image))
        } else if !k0s.version.trim().is_empty() {
            Some(format!(
                "{}:{}",
                settings.image_repo,
                normalize_version_tag(&k0s.version)
            ))
        } else {
            None
        }
    }

    /// Directory relative manifest sources are resolved against.
    pub fn base_dir(&self) -> Option<&Path> {
        self.source_path.as_deref().and_then(Path::parent)
    }

    /// Built-in defaults with the inline user config merged on top.
    pub fn effective_k0s_config(&self) -> Result<Value> {
        let mut base = default_k0s_config();
        if let Some(user) = &self.spec.k0s.config {
            let user = serde_json::to_value(user)?;
            if !user.is_object() {
                return Err(Error::invalid_config("k0s.config must be a mapping"));
            }
            debug!("Merging inline k0s config over defaults");
            json_patch::merge(&mut base, &user);
        }
        Ok(base)
    }
}

pub fn default_k0s_config() -> Value {
    json!({
        "apiVersion": "k0s.k0sproject.io/v1beta1",
        "kind": "ClusterConfig",
        "metadata": {"name": "k0s", "namespace": "kube-system"},
        "spec": {}
    })
}
