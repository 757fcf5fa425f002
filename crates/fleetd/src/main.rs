//! fleetd — the FleetGrid daemon.
//!
//! Single binary that assembles the FleetGrid subsystems:
//! - State store (redb)
//! - Rollout engine (controller + management)
//! - Rollout scheduler
//! - REST API
//!
//! # Usage
//!
//! ```text
//! fleetd init-config --node-id edge-1 --data-dir /var/lib/fleetgrid > fleetd.toml
//! fleetd run --config fleetd.toml
//! fleetd tick --config fleetd.toml   # one scheduler pass, e.g. from cron
//! ```

mod daemon;

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use fleetgrid_core::FleetConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::daemon::Daemon;

const DEFAULT_CONFIG: &str = "/etc/fleetgrid/fleetd.toml";
const DEFAULT_LOG_FILTER: &str = "info,fleetd=debug,fleetgrid=debug";

#[derive(Parser)]
#[command(name = "fleetd", about = "FleetGrid rollout daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler loop and serve the REST API.
    Run {
        #[command(flatten)]
        common: CommonArgs,

        /// Port to listen on.
        #[arg(long)]
        port: Option<u16>,

        /// Seconds between scheduler ticks.
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Run one scheduler tick and exit.
    Tick {
        #[command(flatten)]
        common: CommonArgs,
    },
    /// Print a scaffolded fleetd.toml.
    InitConfig {
        /// Node identifier used for scheduler leases.
        #[arg(long, default_value = "standalone")]
        node_id: String,

        /// Data directory for persistent state.
        #[arg(long, default_value = "/var/lib/fleetgrid")]
        data_dir: PathBuf,

        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Path to fleetd.toml. Defaults apply when the file does not exist.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Data directory for persistent state.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Node identifier used for scheduler leases.
    #[arg(long)]
    node_id: Option<String>,
}

impl CommonArgs {
    fn load(&self) -> anyhow::Result<FleetConfig> {
        let mut config = match &self.config {
            Some(path) => FleetConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None if Path::new(DEFAULT_CONFIG).exists() => {
                FleetConfig::from_file(Path::new(DEFAULT_CONFIG))
                    .with_context(|| format!("loading {DEFAULT_CONFIG}"))?
            }
            None => FleetConfig::default(),
        };
        if let Some(dir) = &self.data_dir {
            config.store.data_dir = dir.clone();
        }
        if let Some(node_id) = &self.node_id {
            config.scheduler.node_id = node_id.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run {
            common,
            port,
            interval_secs,
        } => {
            let mut config = common.load()?;
            if let Some(port) = port {
                config.api.port = port;
            }
            if let Some(secs) = interval_secs {
                config.scheduler.interval_secs = secs;
            }
            config.validate()?;
            info!(node = %config.scheduler.node_id, "fleetd starting");
            Daemon::open(config)?.run().await
        }
        Command::Tick { common } => {
            let daemon = Daemon::open(common.load()?)?;
            let report = daemon.tick().await?;
            info!(
                processed = report.processed,
                advanced = report.advanced,
                skipped = report.skipped,
                failed = report.failed,
                "tick finished"
            );
            if report.failed > 0 {
                anyhow::bail!("{} rollout(s) failed to process", report.failed);
            }
            Ok(())
        }
        Command::InitConfig {
            node_id,
            data_dir,
            output,
        } => {
            let toml = FleetConfig::scaffold(&node_id, &data_dir).to_toml_string()?;
            match output {
                Some(path) => {
                    std::fs::write(&path, toml)
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "config written");
                }
                None => print!("{toml}"),
            }
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
