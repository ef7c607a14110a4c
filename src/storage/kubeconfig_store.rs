use std::path::{Path, PathBuf};

use kube::config::{Context, NamedAuthInfo, NamedCluster, NamedContext};
use tokio::fs;
use tracing::{debug, info};

use super::write_private;
use crate::{Error, Result};

pub use kube::config::Kubeconfig;

pub const ENTRY_PREFIX: &str = "k0da-";

/// Name used for the cluster, context and user entries of `cluster`.
pub fn entry_name(cluster: &str) -> String {
    format!("{}{}", ENTRY_PREFIX, cluster)
}

pub fn parse(data: &str) -> Result<Kubeconfig> {
    if data.trim().is_empty() {
        return Ok(Kubeconfig::default());
    }
    serde_yaml::from_str(data).map_err(|e| Error::kubeconfig(format!("parse: {}", e)))
}

pub fn to_yaml(config: &Kubeconfig) -> Result<String> {
    let mut config = config.clone();
    config.api_version.get_or_insert_with(|| "v1".to_string());
    config.kind.get_or_insert_with(|| "Config".to_string());
    Ok(serde_yaml::to_string(&config)?)
}

pub fn has_context(config: &Kubeconfig, name: &str) -> bool {
    config.contexts.iter().any(|c| c.name == name)
}

fn remove_entries(config: &mut Kubeconfig, name: &str) {
    config.clusters.retain(|c| c.name != name);
    config.contexts.retain(|c| c.name != name);
    config.auth_infos.retain(|u| u.name != name);
}

/// Replaces the entries for `cluster` with those from the admin kubeconfig,
/// pointing at `server`, and makes it the current context.
pub fn add_cluster(config: &mut Kubeconfig, cluster: &str, admin: &Kubeconfig, server: &str) -> Result<()> {
    let mut source_cluster = admin
        .clusters
        .first()
        .and_then(|c| c.cluster.clone())
        .ok_or_else(|| Error::kubeconfig("admin kubeconfig has no cluster entry"))?;
    let source_user = admin
        .auth_infos
        .first()
        .and_then(|u| u.auth_info.clone())
        .ok_or_else(|| Error::kubeconfig("admin kubeconfig has no user entry"))?;

    let name = entry_name(cluster);
    remove_entries(config, &name);

    source_cluster.server = Some(server.to_string());
    config.clusters.push(NamedCluster {
        name: name.clone(),
        cluster: Some(source_cluster),
    });
    config.contexts.push(NamedContext {
        name: name.clone(),
        context: Some(Context {
            cluster: name.clone(),
            user: name.clone(),
            namespace: None,
            extensions: None,
        }),
    });
    config.auth_infos.push(NamedAuthInfo {
        name: name.clone(),
        auth_info: Some(source_user),
    });
    config.current_context = Some(name);
    Ok(())
}

/// Removes the entries for `cluster`. If it was current, the first remaining
/// context (or none) becomes current.
pub fn remove_cluster(config: &mut Kubeconfig, cluster: &str) {
    let name = entry_name(cluster);
    remove_entries(config, &name);
    if config.current_context.as_deref() == Some(name.as_str()) {
        config.current_context = config.contexts.first().map(|c| c.name.clone());
    }
}

/// Self-contained kubeconfig holding only `cluster`.
pub fn extract_cluster(config: &Kubeconfig, cluster: &str) -> Result<Kubeconfig> {
    let name = entry_name(cluster);
    let context = config
        .contexts
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::kubeconfig(format!("context {} not found", name)))?;
    let (cluster_name, user_name) = match &context.context {
        Some(ctx) => (ctx.cluster.as_str(), ctx.user.as_str()),
        None => return Err(Error::kubeconfig(format!("context {} is empty", name))),
    };
    let cluster_entry = config
        .clusters
        .iter()
        .find(|c| c.name == cluster_name)
        .ok_or_else(|| Error::kubeconfig(format!("cluster {} not found", cluster_name)))?;
    let user = config
        .auth_infos
        .iter()
        .find(|u| u.name == user_name)
        .ok_or_else(|| Error::kubeconfig(format!("user {} not found", user_name)))?;

    Ok(Kubeconfig {
        clusters: vec![cluster_entry.clone()],
        contexts: vec![context.clone()],
        auth_infos: vec![user.clone()],
        current_context: Some(name),
        ..Kubeconfig::default()
    })
}

/// Whole-file read-modify-write access to the user's kubeconfig.
#[derive(Debug, Clone)]
pub struct KubeconfigStore {
    path: PathBuf,
}

impl KubeconfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at the first `KUBECONFIG` entry, else `~/.kube/config`.
    pub fn from_env() -> Result<Self> {
        default_path(std::env::var("KUBECONFIG").ok(), dirs::home_dir()).map(Self::new)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<Kubeconfig> {
        match fs::read_to_string(&self.path).await {
            Ok(data) => parse(&data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Kubeconfig::default()),
            Err(e) => Err(Error::kubeconfig(format!(
                "read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    pub async fn save(&self, config: &Kubeconfig) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }
        write_private(&self.path, to_yaml(config)?.as_bytes()).await?;
        debug!("Wrote kubeconfig {}", self.path.display());
        Ok(())
    }

    /// Merges the admin kubeconfig printed by `k0s kubeconfig admin`.
    pub async fn add(&self, cluster: &str, admin_yaml: &str, server: &str) -> Result<()> {
        let admin = parse(admin_yaml)?;
        let mut config = self.load().await?;
        add_cluster(&mut config, cluster, &admin, server)?;
        self.save(&config).await?;
        info!(
            "Added context {} to {}",
            entry_name(cluster),
            self.path.display()
        );
        Ok(())
    }

    /// No-op when the file does not exist.
    pub async fn remove(&self, cluster: &str) -> Result<()> {
        if fs::metadata(&self.path).await.is_err() {
            return Ok(());
        }
        let mut config = self.load().await?;
        remove_cluster(&mut config, cluster);
        self.save(&config).await
    }

    /// Switches the current context. Accepts a context name or a cluster
    /// name managed by this tool.
    pub async fn use_context(&self, name: &str) -> Result<String> {
        let mut config = self.load().await?;
        let context = if has_context(&config, name) {
            name.to_string()
        } else if has_context(&config, &entry_name(name)) {
            entry_name(name)
        } else {
            return Err(Error::kubeconfig(format!("context {} not found", name)));
        };
        config.current_context = Some(context.clone());
        self.save(&config).await?;
        Ok(context)
    }

    pub async fn extract(&self, cluster: &str) -> Result<String> {
        to_yaml(&extract_cluster(&self.load().await?, cluster)?)
    }

    /// All context names and the current one.
    pub async fn contexts(&self) -> Result<(Vec<String>, String)> {
        let config = self.load().await?;
        let names = config.contexts.iter().map(|c| c.name.clone()).collect();
        Ok((names, config.current_context.unwrap_or_default()))
    }
}

pub fn default_path(kubeconfig_env: Option<String>, home: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(value) = kubeconfig_env {
        if let Some(first) = std::env::split_paths(&value).next() {
            if !first.as_os_str().is_empty() {
                return Ok(first);
            }
        }
    }
    let home = home.ok_or_else(|| Error::kubeconfig("could not determine home directory"))?;
    Ok(home.join(".kube").join("config"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: https://172.18.0.2:6443
    certificate-authority-data: Q0E=
contexts:
- name: Default
  context:
    cluster: local
    user: user
current-context: Default
users:
- name: user
  user:
    client-certificate-data: Q0VSVA==
    client-key-data: S0VZ
"#;

    fn server(config: &Kubeconfig, index: usize) -> Option<&str> {
        config.clusters[index].cluster.as_ref()?.server.as_deref()
    }

    #[test]
    fn test_add_rewrites_server_and_names() {
        let admin = parse(ADMIN).unwrap();
        let mut config = Kubeconfig::default();
        add_cluster(&mut config, "dev", &admin, "https://localhost:55131").unwrap();

        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.clusters[0].name, "k0da-dev");
        assert_eq!(server(&config, 0), Some("https://localhost:55131"));
        let cluster = config.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.certificate_authority_data.as_deref(), Some("Q0E="));
        assert_eq!(config.contexts[0].context.as_ref().unwrap().user, "k0da-dev");
        assert_eq!(config.auth_infos[0].name, "k0da-dev");
        let user = config.auth_infos[0].auth_info.as_ref().unwrap();
        assert_eq!(user.client_certificate_data.as_deref(), Some("Q0VSVA=="));
        assert_eq!(config.current_context.as_deref(), Some("k0da-dev"));
    }

    #[test]
    fn test_add_twice_replaces() {
        let admin = parse(ADMIN).unwrap();
        let mut config = Kubeconfig::default();
        add_cluster(&mut config, "dev", &admin, "https://localhost:1").unwrap();
        add_cluster(&mut config, "dev", &admin, "https://localhost:2").unwrap();
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.contexts.len(), 1);
        assert_eq!(config.auth_infos.len(), 1);
        assert_eq!(server(&config, 0), Some("https://localhost:2"));
    }

    #[test]
    fn test_add_requires_cluster_and_user() {
        let admin = parse("apiVersion: v1\nkind: Config\nclusters: null\n").unwrap();
        let mut config = Kubeconfig::default();
        assert!(add_cluster(&mut config, "dev", &admin, "https://localhost:1").is_err());
    }

    #[test]
    fn test_remove_falls_back_to_first_context() {
        let admin = parse(ADMIN).unwrap();
        let mut config = Kubeconfig::default();
        add_cluster(&mut config, "a", &admin, "https://localhost:1").unwrap();
        add_cluster(&mut config, "b", &admin, "https://localhost:2").unwrap();
        assert_eq!(config.current_context.as_deref(), Some("k0da-b"));

        remove_cluster(&mut config, "b");
        assert_eq!(config.current_context.as_deref(), Some("k0da-a"));
        remove_cluster(&mut config, "a");
        assert_eq!(config.current_context, None);
        assert!(config.clusters.is_empty());

        // Removing again changes nothing.
        remove_cluster(&mut config, "a");
        assert!(config.contexts.is_empty());
    }

    #[test]
    fn test_foreign_fields_survive() {
        let data = r#"
apiVersion: v1
kind: Config
clusters:
- name: other
  cluster:
    server: https://other:6443
    insecure-skip-tls-verify: true
contexts:
- name: other
  context:
    cluster: other
    user: other
    namespace: team
current-context: other
users:
- name: other
  user:
    token: abc
preferences:
  colors: true
"#;
        let config = parse(data).unwrap();
        let round = parse(&to_yaml(&config).unwrap()).unwrap();
        let cluster = round.clusters[0].cluster.as_ref().unwrap();
        assert_eq!(cluster.insecure_skip_tls_verify, Some(true));
        let context = round.contexts[0].context.as_ref().unwrap();
        assert_eq!(context.namespace.as_deref(), Some("team"));
        assert_eq!(round.preferences.as_ref().and_then(|p| p.colors), Some(true));
        assert!(round.auth_infos[0].auth_info.as_ref().unwrap().token.is_some());
        assert_eq!(round.current_context.as_deref(), Some("other"));
    }

    #[test]
    fn test_empty_file_is_default() {
        let config = parse("  \n").unwrap();
        assert!(config.clusters.is_empty());
        let yaml = to_yaml(&config).unwrap();
        assert!(yaml.contains("apiVersion: v1"));
        assert!(yaml.contains("kind: Config"));
    }

    #[test]
    fn test_extract_cluster() {
        let admin = parse(ADMIN).unwrap();
        let mut config = Kubeconfig::default();
        add_cluster(&mut config, "a", &admin, "https://localhost:1").unwrap();
        add_cluster(&mut config, "b", &admin, "https://localhost:2").unwrap();
        let single = extract_cluster(&config, "a").unwrap();
        assert_eq!(single.clusters.len(), 1);
        assert_eq!(single.current_context.as_deref(), Some("k0da-a"));
        assert_eq!(server(&single, 0), Some("https://localhost:1"));
        assert!(extract_cluster(&config, "missing").is_err());
    }

    #[test]
    fn test_default_path() {
        let home = Some(PathBuf::from("/home/u"));
        assert_eq!(
            default_path(None, home.clone()).unwrap(),
            PathBuf::from("/home/u/.kube/config")
        );
        #[cfg(unix)]
        assert_eq!(
            default_path(Some("/a/one:/b/two".to_string()), home.clone()).unwrap(),
            PathBuf::from("/a/one")
        );
        assert_eq!(
            default_path(Some(String::new()), home).unwrap(),
            PathBuf::from("/home/u/.kube/config")
        );
        assert!(default_path(None, None).is_err());
    }
}
