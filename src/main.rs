use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::info;

use dvpn_node_daemon::api::{self, ApiState};
use dvpn_node_daemon::container::{ContainerLifecycleManager, DockerCli};
use dvpn_node_daemon::logging;
use dvpn_node_daemon::node::store::seed_config_dir;
use dvpn_node_daemon::node::{ConfigStore, NodeConfig, NodeLocation, Passphrase};
use dvpn_node_daemon::paths::{self, DaemonPaths};
use dvpn_node_daemon::settings::DaemonSettings;

#[derive(Parser, Debug)]
#[command(name = "dvpn-node-daemon", version, about = "Sentinel dVPN node container daemon")]
struct Args {
    /// Settings file (default: $XDG_CONFIG_HOME/dvpn-node-daemon/daemon.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the REST API until SIGINT or SIGTERM
    Serve,
    /// Print the container status
    Status,
    /// Start the node container
    Start {
        /// Read the wallet passphrase from the first line of stdin
        #[arg(long)]
        passphrase_stdin: bool,
    },
    /// Stop the node container
    Stop,
    /// Stop, then start the node container
    Restart,
    /// Remove the node container
    Remove,
    /// Print the last lines of container output
    Logs {
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Rewrite the node config files from the loaded settings
    RefreshConfig,
    /// Print the node location inferred from its price table, or switch it
    Location {
        /// `residential` or `datacenter`
        #[arg(long, value_parser = parse_location)]
        set: Option<NodeLocation>,
    },
    /// Write a default daemon.toml and seed the node config directory
    InitConfig {
        /// Overwrite an existing daemon.toml
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let paths = DaemonPaths::resolve();
    let _log_guard = logging::init(&paths.logs);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("creating tokio runtime")?;

    let settings_path = args.config.clone().unwrap_or_else(|| paths.settings_file());
    runtime.block_on(run(args.command, settings_path))
}

async fn run(command: Command, settings_path: PathBuf) -> Result<()> {
    if let Command::InitConfig { force } = command {
        return init_config(&settings_path, force).await;
    }

    let settings = DaemonSettings::load(&settings_path)
        .with_context(|| format!("loading {}", settings_path.display()))?;
    let store = Arc::new(
        ConfigStore::open(&settings.node.config_dir)
            .await
            .context("loading node config")?,
    );
    let docker = Arc::new(DockerCli::new(&settings.container.runtime_binary));
    let manager = Arc::new(ContainerLifecycleManager::new(
        docker,
        store,
        settings.container.clone(),
    ));

    match command {
        Command::Serve => {
            let bind: SocketAddr = settings
                .api
                .bind
                .parse()
                .with_context(|| format!("api.bind `{}`", settings.api.bind))?;
            api::serve(bind, Arc::new(ApiState { manager })).await
        }
        Command::Status => {
            let status = manager.status().await;
            println!("{}", serde_json::to_string(&status)?);
            Ok(())
        }
        Command::Start { passphrase_stdin } => {
            if passphrase_stdin {
                manager.store().set_passphrase(read_passphrase().await?).await;
            }
            let watcher = interrupt_on_signal(&manager);
            let started = manager.start().await;
            watcher.abort();
            check("start", started)
        }
        Command::Stop => check("stop", manager.stop().await),
        Command::Restart => {
            let watcher = interrupt_on_signal(&manager);
            let restarted = manager.restart().await;
            watcher.abort();
            check("restart", restarted)
        }
        Command::Remove => check("remove", manager.remove().await),
        Command::Logs { tail } => match manager.logs(tail).await {
            Some(text) => {
                print!("{text}");
                Ok(())
            }
            None => bail!("logs unavailable for {}", manager.name()),
        },
        Command::RefreshConfig => check("config refresh", manager.refresh_config().await),
        Command::Location { set: Some(location) } => {
            manager
                .store()
                .set_location(location)
                .await
                .context("updating price tables")?;
            println!("{}", serde_json::to_string(&location)?);
            Ok(())
        }
        Command::Location { set: None } => {
            let location = manager.store().snapshot().await.location();
            println!("{}", serde_json::to_string(&location)?);
            Ok(())
        }
        Command::InitConfig { .. } => Ok(()),
    }
}

/// Interrupt a foreground start on SIGINT/SIGTERM so the container it
/// created is stopped before the process exits.
fn interrupt_on_signal(manager: &Arc<ContainerLifecycleManager>) -> tokio::task::JoinHandle<()> {
    let manager = Arc::clone(manager);
    tokio::spawn(async move {
        api::shutdown_signal().await;
        manager.begin_shutdown();
    })
}

fn parse_location(s: &str) -> Result<NodeLocation, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "residential" => Ok(NodeLocation::Residential),
        "datacenter" => Ok(NodeLocation::Datacenter),
        other => Err(format!("unknown location `{other}`, expected residential or datacenter")),
    }
}

fn check(op: &str, success: bool) -> Result<()> {
    if success {
        info!("{op} succeeded");
        Ok(())
    } else {
        bail!("{op} failed, see log output")
    }
}

async fn read_passphrase() -> Result<Passphrase> {
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin());
    Passphrase::read_line(&mut stdin)
        .await
        .context("reading passphrase from stdin")
}

async fn init_config(settings_path: &std::path::Path, force: bool) -> Result<()> {
    let exists = tokio::fs::try_exists(settings_path)
        .await
        .with_context(|| format!("checking {}", settings_path.display()))?;
    if exists && !force {
        bail!(
            "{} already exists, pass --force to overwrite",
            settings_path.display()
        );
    }
    paths::ensure_parent(settings_path)
        .with_context(|| format!("creating parent of {}", settings_path.display()))?;
    tokio::fs::write(settings_path, DaemonSettings::default_toml())
        .await
        .with_context(|| format!("writing {}", settings_path.display()))?;
    info!(path = %settings_path.display(), "wrote default settings");

    let settings = DaemonSettings::load(settings_path)?;
    seed_config_dir(&settings.node.config_dir, &NodeConfig::default())
        .await
        .context("seeding node config directory")?;
    info!(dir = %settings.node.config_dir.display(), "node config directory ready");
    Ok(())
}
