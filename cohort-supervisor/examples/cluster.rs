//! Cluster Example
//!
//! Runs a master with one `registry` agent and two workers. The `agent` and
//! `worker` examples are the framework it starts, so build them first:
//!
//! ```text
//! cargo build -p cohort-supervisor --examples
//! cargo run -p cohort-supervisor --example cluster
//! ```
//!
//! Stop it with Ctrl-C: workers close first, then the agent.

use cohort_supervisor::{ClusterConfig, Master};
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // The example binaries sit next to each other.
    let exe = std::env::current_exe()?;
    let framework = exe
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cannot locate the example directory"))?;

    let config = ClusterConfig::builder()
        .cwd(std::env::current_dir()?)
        .agent("registry")
        .max_workers(2)
        .timeout(Duration::from_secs(10))
        .shutdown_timeout(Duration::from_secs(5))
        .framework(framework)
        .build();

    let master = Master::builder(config).build()?;
    let code = master.run().await;
    std::process::exit(code)
}
