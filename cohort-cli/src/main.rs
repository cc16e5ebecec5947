//! Cohort CLI - run and inspect process clusters

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use cohort_core::ClusterConfig;
use cohort_supervisor::{Master, ProcessArgv};
use humantime_serde::re::humantime;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "cohort")]
#[command(about = "Master/agent/worker process-cluster supervisor", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster and supervise it until it is shut down
    Start {
        #[command(flatten)]
        cluster: ClusterArgs,

        /// Arguments passed through to every agent and worker
        #[arg(last = true)]
        args: Vec<String>,
    },
    /// Validate the configuration and print it resolved
    Check {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
    /// Version information
    Version,
}

/// Overrides layered on top of the loaded configuration
#[derive(Args)]
struct ClusterArgs {
    /// Configuration file, layered after cohort.toml and COHORT_CONFIG_PATH
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Project working directory (absolute)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Agent to start; repeat for several
    #[arg(short, long = "agent")]
    agents: Vec<String>,

    /// Worker count (0 = one per CPU)
    #[arg(short, long)]
    workers: Option<usize>,

    /// Startup timeout per group, e.g. `30s`
    #[arg(long, value_parser = humantime::parse_duration)]
    timeout: Option<Duration>,

    /// Graceful shutdown deadline before children are killed, e.g. `10s`
    #[arg(long, value_parser = humantime::parse_duration)]
    shutdown_timeout: Option<Duration>,

    /// Framework directory holding the `agent` and `worker` executables
    #[arg(short, long)]
    framework: Option<PathBuf>,
}

impl ClusterArgs {
    fn load(self) -> Result<ClusterConfig> {
        let mut config = ClusterConfig::load_from(self.config.as_deref())
            .context("failed to load configuration")?;

        if let Some(cwd) = self.cwd {
            config.cwd = cwd;
        }
        if !self.agents.is_empty() {
            config.agents = self.agents;
        }
        if let Some(workers) = self.workers {
            config.max_workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.timeout = Some(timeout);
        }
        if let Some(timeout) = self.shutdown_timeout {
            config.shutdown_timeout = timeout;
        }
        if let Some(framework) = self.framework {
            config.framework = Some(framework);
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { cluster, args } => {
            let config = cluster.load()?;
            let master = Master::builder(config)
                .argv(ProcessArgv::partition(args))
                .build()
                .context("invalid cluster configuration")?;
            info!(
                agents = master.config().agents.len(),
                workers = master.config().max_workers,
                "starting cluster"
            );
            let code = master.run().await;
            std::process::exit(code);
        }
        Commands::Check { cluster } => {
            let config = cluster
                .load()?
                .resolve()
                .context("invalid cluster configuration")?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Version => {
            println!("cohort {}", env!("CARGO_PKG_VERSION"));
            println!("cohort-core {}", cohort_core::VERSION);
        }
    }

    Ok(())
}
