use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use k0da::{
    controllers::{ClusterController, ClusterSummary, CreateOptions},
    models::{
        version::{fetch_stable_version, http_client, is_newer_than_default, normalize_version_tag},
        ClusterConfig,
    },
    runtime::{detect, DetectOptions},
    settings::DEFAULT_CLUSTER_NAME,
    storage::{kubeconfig_store::entry_name, KubeconfigStore},
    Settings,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "k0da", version, about = "Local k0s clusters in containers")]
struct Cli {
    /// Container runtime to use (docker or podman)
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Engine socket or host URI
    #[arg(long, global = true)]
    socket: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct NameArgs {
    /// Cluster name
    #[arg(value_name = "NAME")]
    positional: Option<String>,

    #[arg(short, long, default_value = DEFAULT_CLUSTER_NAME)]
    name: String,
}

impl NameArgs {
    fn resolve(&self) -> &str {
        self.positional.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Create a new k0s cluster
    Create {
        #[command(flatten)]
        name: NameArgs,
        /// Cluster config file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// k0s image to use
        #[arg(short, long)]
        image: Option<String>,
        /// Wait for the cluster to be ready
        #[arg(short, long, default_value_t = true, action = clap::ArgAction::Set)]
        wait: bool,
        /// Readiness timeout, e.g. 60s or 5m
        #[arg(short, long, default_value = "60s", value_parser = parse_duration)]
        timeout: Duration,
    },
    /// Re-apply manifests and k0s config to a running cluster
    Update {
        #[command(flatten)]
        name: NameArgs,
        #[arg(short, long)]
        config: Option<PathBuf>,
        #[arg(short, long, default_value = "60s", value_parser = parse_duration)]
        timeout: Duration,
    },
    /// Delete a cluster
    #[command(alias = "rm")]
    Delete {
        #[command(flatten)]
        name: NameArgs,
    },
    /// List clusters
    #[command(alias = "ls")]
    List {
        /// Include stopped clusters
        #[arg(short, long)]
        all: bool,
        #[arg(short, long)]
        verbose: bool,
    },
    /// Load images into a cluster
    Load {
        #[command(subcommand)]
        target: LoadTarget,
    },
    /// Print the kubeconfig of one cluster
    Kubeconfig {
        #[arg(short, long, default_value = DEFAULT_CLUSTER_NAME)]
        name: String,
    },
    /// Show or switch kubeconfig contexts
    Context {
        /// Context or cluster name to switch to
        name: Option<String>,
    },
    /// Print version information
    Version {
        /// Compare the default k0s version with the latest stable release
        #[arg(long)]
        check_latest: bool,
    },
}

#[derive(Subcommand)]
enum LoadTarget {
    /// Load an image archive
    Archive {
        path: PathBuf,
        #[arg(short, long, default_value = DEFAULT_CLUSTER_NAME)]
        name: String,
    },
    /// Load an image from the local engine
    Image {
        reference: String,
        #[arg(short, long, default_value = DEFAULT_CLUSTER_NAME)]
        name: String,
    },
}

/// Accepts `90`, `90s`, `2m`, `1h` or `500ms`.
fn parse_duration(value: &str) -> std::result::Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("invalid duration: {}", value))?;
    let seconds = |scale: u64| {
        number
            .checked_mul(scale)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration too large: {}", value))
    };
    match unit {
        "" | "s" => Ok(Duration::from_secs(number)),
        "ms" => Ok(Duration::from_millis(number)),
        "m" => seconds(60),
        "h" => seconds(3600),
        _ => Err(format!("invalid duration unit in {}", value)),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "k0da=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            on_signal.cancel();
        }
    });

    let detect_opts = DetectOptions {
        runtime: cli.runtime.clone().unwrap_or_default(),
        socket: cli.socket.clone().unwrap_or_default(),
    };

    match cli.command {
        Command::Create {
            name,
            config,
            image,
            wait,
            timeout,
        } => {
            let name = name.resolve().to_string();
            let config = ClusterConfig::load(config.as_deref())
                .context("failed to load cluster config")?;
            let controller = controller(&detect_opts, cancel).await?;
            println!("Creating k0s cluster '{}'...", name);
            controller
                .create(&CreateOptions {
                    name: name.clone(),
                    config,
                    image,
                    wait,
                    timeout,
                })
                .await
                .with_context(|| format!("failed to create cluster '{}'", name))?;
            println!("Cluster '{}' created", name);
            if wait {
                println!(
                    "To use this cluster, run: kubectl config use-context {}",
                    entry_name(&name)
                );
            }
        }
        Command::Update {
            name,
            config,
            timeout,
        } => {
            let name = name.resolve().to_string();
            let config = ClusterConfig::load(config.as_deref())
                .context("failed to load cluster config")?;
            let controller = controller(&detect_opts, cancel).await?;
            tokio::time::timeout(timeout, controller.update(&name, &config))
                .await
                .map_err(|_| anyhow::anyhow!("update timed out after {:?}", timeout))?
                .with_context(|| format!("failed to update cluster '{}'", name))?;
            println!("Cluster '{}' updated", name);
        }
        Command::Delete { name } => {
            let name = name.resolve().to_string();
            let controller = controller(&detect_opts, cancel).await?;
            controller.delete(&name).await?;
            println!("Cluster '{}' deleted", name);
        }
        Command::List { all, verbose } => {
            let controller = controller(&detect_opts, cancel).await?;
            let clusters = controller.list(all).await?;
            print_clusters(&clusters, verbose);
        }
        Command::Load { target } => {
            let controller = controller(&detect_opts, cancel).await?;
            match target {
                LoadTarget::Archive { path, name } => {
                    controller.load_archive(&name, &path).await?;
                    println!("Archive loaded into '{}'", name);
                }
                LoadTarget::Image { reference, name } => {
                    controller.load_image(&name, &reference).await?;
                    println!("Image {} loaded into '{}'", reference, name);
                }
            }
        }
        Command::Kubeconfig { name } => {
            let store = KubeconfigStore::from_env()?;
            let yaml = store
                .extract(&name)
                .await
                .with_context(|| format!("cluster '{}' not found in {}", name, store.path().display()))?;
            print!("{}", yaml);
        }
        Command::Context { name } => {
            let store = KubeconfigStore::from_env()?;
            match name {
                Some(name) => {
                    let context = store.use_context(&name).await?;
                    println!("Switched to context '{}'", context);
                }
                None => {
                    let (contexts, current) = store.contexts().await?;
                    println!("Current context: {}", current);
                    println!("\nAvailable contexts:");
                    for context in contexts {
                        let marker = if context == current { "*" } else { " " };
                        println!("  {} {}", marker, context);
                    }
                }
            }
        }
        Command::Version { check_latest } => {
            println!("k0da {}", env!("CARGO_PKG_VERSION"));
            if check_latest {
                check_latest_version().await;
            }
        }
    }

    Ok(())
}

async fn controller(opts: &DetectOptions, cancel: CancellationToken) -> Result<ClusterController> {
    let runtime = detect(opts).await?;
    let settings = Settings::from_env()?;
    let kubeconfig = KubeconfigStore::from_env()?;
    Ok(ClusterController::new(runtime, settings, kubeconfig, cancel))
}

async fn check_latest_version() {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            println!("Failed to check latest k0s version: {}", e);
            return;
        }
    };
    let stable = match http_client(Duration::from_secs(3)) {
        Ok(client) => fetch_stable_version(&client, &settings.stable_version_url).await,
        Err(e) => Err(e),
    };
    let current = normalize_version_tag(&settings.default_version);
    match stable {
        Ok(stable) if is_newer_than_default(&stable, &settings.default_version) => println!(
            "A newer stable k0s exists: {} (current default: {})",
            normalize_version_tag(&stable),
            current
        ),
        Ok(_) => println!("Default k0s version is up to date with stable."),
        Err(e) => println!("Failed to check latest k0s version: {}", e),
    }
}

fn print_clusters(clusters: &[ClusterSummary], verbose: bool) {
    if clusters.is_empty() {
        println!("No k0da clusters found.");
        return;
    }
    println!("Found {} k0da cluster(s):\n", clusters.len());

    if verbose {
        for (i, cluster) in clusters.iter().enumerate() {
            let rep = &cluster.representative;
            let id: String = rep.id.chars().take(12).collect();
            println!("Cluster {}:", i + 1);
            println!("  Name:        {}", cluster.name);
            println!("  Nodes:       {}", cluster.nodes);
            println!("  Container:   {}", id);
            println!("  Image:       {}", rep.image);
            println!("  Status:      {}", rep.status);
            println!("  Ports:       {}", rep.ports);
            println!("  Created:     {}", cluster.created_display());
            println!();
        }
        return;
    }

    let rows: Vec<[String; 4]> = clusters
        .iter()
        .map(|c| {
            [
                c.name.clone(),
                c.representative.status.clone(),
                c.representative.ports.clone(),
                c.representative.image.clone(),
            ]
        })
        .collect();
    let header = ["NAME", "STATUS", "PORTS", "IMAGE"].map(String::from);
    let mut widths = header.clone().map(|h| h.len());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    for row in std::iter::once(&header).chain(rows.iter()) {
        println!(
            "{:<w0$}  {:<w1$}  {:<w2$}  {}",
            row[0],
            row[1],
            row[2],
            row[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
        );
    }
}
