//! Worker entry of the example framework
//!
//! Reads the registry's extra data, asks the registry for a lookup once the
//! cluster is ready, and logs the answer.

use async_trait::async_trait;
use cohort_supervisor::{
    Application, Envelope, LifecycleHandle, Message, ShutdownSignal, Target, run_worker,
};
use serde_json::json;
use tracing::info;

struct Server {
    handle: LifecycleHandle,
}

#[async_trait]
impl Application for Server {
    async fn create(&mut self) -> anyhow::Result<()> {
        let base_port = self
            .handle
            .args()
            .agent_extra
            .get("registry")
            .and_then(|extra| extra.get("base_port"))
            .and_then(|port| port.as_u64())
            .ok_or_else(|| anyhow::anyhow!("registry did not publish a base port"))?;
        info!(worker = %self.handle.endpoint(), base_port, "worker up");
        Ok(())
    }

    async fn destroy(&mut self, signal: ShutdownSignal) -> anyhow::Result<()> {
        info!(worker = %self.handle.endpoint(), %signal, "worker closing");
        Ok(())
    }

    async fn message(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
        match envelope.message()? {
            Message::ClusterReady => {
                self.handle.send(
                    Target::Agent {
                        name: "registry".into(),
                    },
                    Message::custom("registry:lookup", json!({})),
                )?;
            }
            Message::Custom { action, body } if action == "registry:answer" => {
                info!(worker = %self.handle.endpoint(), %body, "registry answered");
            }
            _ => {}
        }
        Ok(())
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

    run_worker(|handle| Server { handle }).await
}
