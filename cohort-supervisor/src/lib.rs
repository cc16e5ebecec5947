//! Cohort Supervisor - master/agent/worker process clusters
//!
//! A [`Master`] forks a fixed set of named agents, waits for all of them to
//! report ready, then forks a pool of identical workers. Children talk to the
//! master over a Unix domain socket ([`ChannelHub`] / [`ChildLink`]) and run
//! their application inside a [`ProcessLifecycle`].
//!
//! ## Startup
//!
//! 1. Agents are spawned and must all report `ipc:agent#success`
//! 2. Agents publish their extra data, which is handed to every worker
//! 3. Workers are spawned and must all report `ipc:worker#success`
//! 4. `cluster:ready` is broadcast
//!
//! Any failure or timeout shuts down what has started and exits with 1.
//!
//! ## Shutdown
//!
//! On SIGTERM/SIGINT/SIGQUIT or a `teardown` message, workers are closed and
//! drained first, then agents, within `shutdown_timeout`. Whatever is still
//! alive afterwards is killed.
//!
//! ## Writing a child
//!
//! ```no_run
//! use cohort_supervisor::{Application, LifecycleHandle, run_worker};
//!
//! struct Server {
//!     handle: LifecycleHandle,
//! }
//!
//! #[async_trait::async_trait]
//! impl Application for Server {
//!     async fn create(&mut self) -> anyhow::Result<()> {
//!         tracing::info!(args = ?self.handle.args(), "listening");
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     run_worker(|handle| Server { handle }).await
//! }
//! ```

mod channel;
mod error;
mod lifecycle;
mod master;
mod process;
mod signals;
mod state;

pub use channel::{ChannelHub, ChildLink, Inbound, MemoryTransport, PENDING_LIMIT, Transport};
pub use error::{Result, SupervisorError};
pub use lifecycle::{
    Application, LifecycleHandle, LifecycleState, ProcessLifecycle, run_agent, run_worker,
};
pub use master::{DEFAULT_SHUTDOWN_ORDER, Master, MasterBuilder};
pub use process::{
    LaunchSpec, LaunchedChild, Launcher, NixSignaller, ProcessArgv, ProcessHandle,
    ProcessLauncher, Signaller,
};
pub use signals::{ShutdownSignal, ShutdownSignals};
pub use state::{ChildRecord, ChildStatus, ClusterState, Group, GroupSnapshot, GroupStatus};

pub use cohort_core::{ClusterConfig, Endpoint, Envelope, Message, Role, Target};
