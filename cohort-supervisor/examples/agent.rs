//! Agent entry of the example framework
//!
//! A tiny service registry: it publishes the port range workers should use
//! and answers `registry:lookup` messages from workers.

use async_trait::async_trait;
use cohort_supervisor::{
    Application, Envelope, LifecycleHandle, Message, ShutdownSignal, Target, run_agent,
};
use serde_json::{Value, json};
use tracing::info;

struct Registry {
    handle: LifecycleHandle,
    lookups: usize,
}

#[async_trait]
impl Application for Registry {
    async fn create(&mut self) -> anyhow::Result<()> {
        info!(agent = %self.handle.endpoint(), "registry up");
        Ok(())
    }

    async fn destroy(&mut self, signal: ShutdownSignal) -> anyhow::Result<()> {
        info!(%signal, lookups = self.lookups, "registry closing");
        Ok(())
    }

    async fn message(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        if envelope.action == "registry:lookup" {
            self.lookups += 1;
            self.handle.send(
                Target::from(envelope.from.clone()),
                Message::custom("registry:answer", json!({ "lookups": self.lookups })),
            )?;
        }
        Ok(())
    }

    async fn extra(&mut self) -> Value {
        json!({ "base_port": 7001 })
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    run_agent(|handle| Registry { handle, lookups: 0 }).await
}
