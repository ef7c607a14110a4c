// Shared fixtures: an in-memory container engine and helpers.
#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k0da::runtime::{ContainerRecord, ContainerRuntime, ExecOutput, RunContainerOptions};
use k0da::{Error, Result, Settings};

pub const READY_OUTPUT: &str = "Version: v1.33.3+k0s.0\nProcess ID: 42\nRole: controller\nKube-api probing successful: true\n";

pub const ADMIN_KUBECONFIG: &str = r#"apiVersion: v1
kind: Config
clusters:
- name: local
  cluster:
    server: https://172.18.0.2:6443
    certificate-authority-data: Q0EK
contexts:
- name: Default
  context:
    cluster: local
    user: admin
current-context: Default
users:
- name: admin
  user:
    client-certificate-data: Q0VSVAo=
    client-key-data: S0VZCg==
"#;

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub opts: RunContainerOptions,
    pub running: bool,
    pub created: i64,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, FakeContainer>,
    volumes: HashSet<String>,
    networks: HashSet<String>,
    runs: Vec<RunContainerOptions>,
    execs: Vec<(String, Vec<String>)>,
    copies: Vec<(String, PathBuf, String)>,
    saved: Vec<String>,
    removed: Vec<String>,
    stopped: Vec<String>,
    fail_run: HashSet<String>,
    failing_tokens: usize,
}

/// In-memory engine. Tokens are unique per `k0s token create` call, `k0s
/// status` reports ready unless configured otherwise, and the API port
/// becomes visible after a configurable number of lookups.
pub struct FakeRuntime {
    state: Mutex<State>,
    token_seq: AtomicUsize,
    port_lookups: AtomicUsize,
    pub network_creates: AtomicUsize,
    status_output: Mutex<String>,
    port_ready_after: usize,
    host_port: u16,
    status_delay: Duration,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            token_seq: AtomicUsize::new(0),
            port_lookups: AtomicUsize::new(0),
            network_creates: AtomicUsize::new(0),
            status_output: Mutex::new(READY_OUTPUT.to_string()),
            port_ready_after: 1,
            host_port: 55131,
            status_delay: Duration::ZERO,
        }
    }

    /// The port lookup fails until the `n`th call.
    pub fn with_port_ready_after(mut self, n: usize) -> Self {
        self.port_ready_after = n;
        self
    }

    pub fn never_ready(self) -> Self {
        *self.status_output.lock().unwrap() = "Kube-api probing successful: false\n".to_string();
        self
    }

    /// Every `k0s status` exec hangs for `delay` before answering.
    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    pub fn fail_run_of(&self, name: &str) {
        self.state.lock().unwrap().fail_run.insert(name.to_string());
    }

    /// The next `n` token requests exit nonzero.
    pub fn fail_tokens(&self, n: usize) {
        self.state.lock().unwrap().failing_tokens = n;
    }

    /// Adds a container that was not started through `run_container`.
    pub fn seed_container(&self, name: &str, labels: &[(&str, &str)], running: bool) {
        let opts = RunContainerOptions {
            name: name.to_string(),
            image: "quay.io/k0sproject/k0s:v1.33.3-k0s.0".to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        };
        let mut state = self.state.lock().unwrap();
        state.volumes.insert(format!("{}-var", name));
        state.containers.insert(
            name.to_string(),
            FakeContainer {
                opts,
                running,
                created: 1_700_000_000,
            },
        );
    }

    pub fn seed_volume(&self, name: &str) {
        self.state.lock().unwrap().volumes.insert(name.to_string());
    }

    pub fn runs(&self) -> Vec<RunContainerOptions> {
        self.state.lock().unwrap().runs.clone()
    }

    pub fn run_of(&self, name: &str) -> Option<RunContainerOptions> {
        self.runs().into_iter().find(|o| o.name == name)
    }

    pub fn execs(&self) -> Vec<(String, Vec<String>)> {
        self.state.lock().unwrap().execs.clone()
    }

    pub fn execs_matching(&self, prefix: &[&str]) -> Vec<(String, Vec<String>)> {
        self.execs()
            .into_iter()
            .filter(|(_, cmd)| cmd.len() >= prefix.len() && cmd.iter().zip(prefix).all(|(a, b)| a == b))
            .collect()
    }

    pub fn copies(&self) -> Vec<(String, PathBuf, String)> {
        self.state.lock().unwrap().copies.clone()
    }

    pub fn saved(&self) -> Vec<String> {
        self.state.lock().unwrap().saved.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.state.lock().unwrap().removed.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.state.lock().unwrap().stopped.clone()
    }

    pub fn container_names(&self) -> Vec<String> {
        self.state.lock().unwrap().containers.keys().cloned().collect()
    }

    pub fn has_volume(&self, name: &str) -> bool {
        self.state.lock().unwrap().volumes.contains(name)
    }

    pub fn has_network(&self, name: &str) -> bool {
        self.state.lock().unwrap().networks.contains(name)
    }

    pub fn port_lookups(&self) -> usize {
        self.port_lookups.load(Ordering::SeqCst)
    }

    fn exec_output(&self, command: &[String]) -> ExecOutput {
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["k0s", "status"] => ExecOutput {
                stdout: self.status_output.lock().unwrap().clone(),
                exit_code: 0,
            },
            ["k0s", "token", "create", role] => {
                let mut state = self.state.lock().unwrap();
                if state.failing_tokens > 0 {
                    state.failing_tokens -= 1;
                    return ExecOutput {
                        stdout: "token create failed".to_string(),
                        exit_code: 1,
                    };
                }
                let n = self.token_seq.fetch_add(1, Ordering::SeqCst);
                let role = role.trim_start_matches("--role=");
                ExecOutput {
                    stdout: format!("{}-token-{}\n", role, n),
                    exit_code: 0,
                }
            }
            ["k0s", "kubeconfig", "admin"] => ExecOutput {
                stdout: ADMIN_KUBECONFIG.to_string(),
                exit_code: 0,
            },
            _ => ExecOutput {
                stdout: String::new(),
                exit_code: 0,
            },
        }
    }

    fn not_found(name: &str) -> Error {
        Error::engine("fake", format!("no such container: {}", name))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn run_container(&self, opts: &RunContainerOptions) -> Result<String> {
        let mut state = self.state.lock().unwrap();
        state.runs.push(opts.clone());
        if state.fail_run.contains(&opts.name) {
            return Err(Error::engine("fake", format!("cannot start {}", opts.name)));
        }
        if state.containers.contains_key(&opts.name) {
            return Err(Error::engine("fake", format!("name {} already in use", opts.name)));
        }
        state.volumes.insert(format!("{}-var", opts.name));
        state.containers.insert(
            opts.name.clone(),
            FakeContainer {
                opts: opts.clone(),
                running: true,
                created: 1_700_000_000,
            },
        );
        Ok(format!("{:0>64}", opts.name.len()))
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().containers.contains_key(name))
    }

    async fn container_is_running(&self, name: &str) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .containers
            .get(name)
            .map(|c| c.running)
            .unwrap_or(false))
    }

    async fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.stopped.push(name.to_string());
        match state.containers.get_mut(name) {
            Some(c) => {
                c.running = false;
                Ok(())
            }
            None => Err(Self::not_found(name)),
        }
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.removed.push(name.to_string());
        state
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name))
    }

    async fn exec_in_container(&self, name: &str, command: &[String]) -> Result<ExecOutput> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.containers.contains_key(name) {
                return Err(Self::not_found(name));
            }
            state.execs.push((name.to_string(), command.to_vec()));
        }
        if command.first().map(String::as_str) == Some("k0s")
            && command.get(1).map(String::as_str) == Some("status")
            && !self.status_delay.is_zero()
        {
            tokio::time::sleep(self.status_delay).await;
        }
        Ok(self.exec_output(command))
    }

    async fn get_port_mapping(
        &self,
        name: &str,
        container_port: u16,
        _protocol: &str,
    ) -> Result<(String, u16)> {
        let n = self.port_lookups.fetch_add(1, Ordering::SeqCst) + 1;
        if n < self.port_ready_after {
            return Err(Error::PortMappingNotFound {
                container: name.to_string(),
                port: container_port,
            });
        }
        Ok(("0.0.0.0".to_string(), self.host_port))
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.lock().unwrap().volumes.contains(name))
    }

    async fn remove_volume(&self, name: &str) -> Result<()> {
        self.state.lock().unwrap().volumes.remove(name);
        Ok(())
    }

    async fn list_containers_by_label(
        &self,
        selector: &BTreeMap<String, String>,
        include_stopped: bool,
    ) -> Result<Vec<ContainerRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .values()
            .filter(|c| include_stopped || c.running)
            .filter(|c| selector.iter().all(|(k, v)| c.opts.labels.get(k) == Some(v)))
            .map(|c| ContainerRecord {
                id: format!("{:0>64}", c.opts.name.len()),
                name: c.opts.name.clone(),
                image: c.opts.image.clone(),
                status: if c.running { "Up 1 minute" } else { "Exited (0)" }.to_string(),
                ports: "0.0.0.0:55131->6443/tcp".to_string(),
                created: c.created,
                labels: c
                    .opts
                    .labels
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            })
            .collect())
    }

    async fn copy_to_container(&self, name: &str, src: &Path, dst: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(name) {
            return Err(Self::not_found(name));
        }
        state
            .copies
            .push((name.to_string(), src.to_path_buf(), dst.to_string()));
        Ok(())
    }

    async fn save_image_to_tar(&self, image: &str, tar_path: &Path) -> Result<()> {
        std::fs::write(tar_path, b"fake image archive")?;
        self.state.lock().unwrap().saved.push(image.to_string());
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        if state.networks.insert(name.to_string()) {
            self.network_creates.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Settings rooted in `root` with fast polling and no network lookups.
pub fn fast_settings(root: &Path) -> Settings {
    let mut settings = Settings::with_root(root.join("clusters"));
    settings.fetch_stable = false;
    settings.readiness_interval = Duration::from_millis(10);
    settings.port_lookup =
        k0da::controllers::RetryPolicy::attempts(15, Duration::from_millis(5));
    settings
}
