//! Per-process lifecycle wrapper run inside every agent and worker
//!
//! [`ProcessLifecycle`] drives the user [`Application`]: it runs `create`,
//! reports readiness (or the first startup error) to the master, and turns a
//! termination signal plus the master's close instruction into exactly one
//! `destroy` call and an exit code.
//!
//! The close instruction and the OS signal may arrive in either order. The
//! signal starts the shutdown; the close flag grants it.

use crate::channel::{ChildLink, Transport};
use crate::signals::{ShutdownSignal, ShutdownSignals};
use crate::{Result, SupervisorError};
use async_trait::async_trait;
use cohort_core::{ChildArgs, Endpoint, Envelope, Message, Role, Target};
use futures::{FutureExt, Stream, StreamExt};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, error, info, warn};

/// User application hosted by an agent or worker process.
///
/// Every hook is optional; the defaults do nothing.
#[async_trait]
pub trait Application: Send + 'static {
    /// Set the process up. Readiness is reported once this returns `Ok`.
    async fn create(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Tear the process down. An error makes the process exit with code 1.
    async fn destroy(&mut self, _signal: ShutdownSignal) -> anyhow::Result<()> {
        Ok(())
    }

    /// Any message not consumed by the lifecycle itself
    async fn message(&mut self, _envelope: &Envelope) -> anyhow::Result<()> {
        Ok(())
    }

    /// Data an agent publishes to every worker (agents only)
    async fn extra(&mut self) -> Value {
        Value::Null
    }
}

/// What an application gets to know about the process hosting it
#[derive(Clone)]
pub struct LifecycleHandle {
    endpoint: Endpoint,
    args: ChildArgs,
    transport: Arc<dyn Transport>,
}

impl LifecycleHandle {
    pub fn new(endpoint: Endpoint, args: ChildArgs, transport: Arc<dyn Transport>) -> Self {
        Self {
            endpoint,
            args,
            transport,
        }
    }

    /// This process on the channel
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Arguments the master started this process with
    pub fn args(&self) -> &ChildArgs {
        &self.args
    }

    pub fn role(&self) -> Role {
        self.args.role()
    }

    /// Send a message to the master, another child or a group
    pub fn send(&self, to: Target, message: Message) -> Result<()> {
        self.transport.send(to, message)
    }
}

/// Lifecycle states of a child process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    NotStarted,
    Running,
    ClosingRequested,
    Destroying,
    Exited,
}

/// Lifecycle wrapper around one [`Application`]
pub struct ProcessLifecycle<A: Application> {
    handle: LifecycleHandle,
    app: AsyncMutex<A>,
    state: Mutex<LifecycleState>,
    installed: AtomicBool,
    error_reported: AtomicBool,
    closing: AtomicBool,
    close_requested: watch::Sender<bool>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panicked".to_string())
}

impl<A: Application> ProcessLifecycle<A> {
    pub fn new(handle: LifecycleHandle, app: A) -> Self {
        let (close_requested, _) = watch::channel(false);
        Self {
            handle,
            app: AsyncMutex::new(app),
            state: Mutex::new(LifecycleState::NotStarted),
            installed: AtomicBool::new(false),
            error_reported: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            close_requested,
        }
    }

    pub fn handle(&self) -> &LifecycleHandle {
        &self.handle
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, next: LifecycleState) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        debug!(endpoint = %self.handle.endpoint, from = ?*state, to = ?next, "lifecycle transition");
        *state = next;
    }

    /// Whether readiness has been reported
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Whether the master has allowed this process to close
    pub fn is_close_requested(&self) -> bool {
        *self.close_requested.borrow()
    }

    /// Run `create`, then report readiness.
    ///
    /// A failing or panicking `create` is reported through [`Self::on_error`]
    /// and returned; the process keeps running until it is closed.
    pub async fn start(&self) -> Result<()> {
        let outcome = AssertUnwindSafe(async { self.app.lock().await.create().await })
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => {
                self.on_listen();
                return Ok(());
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(panic) => panic_message(&*panic),
        };
        self.on_error(&error);
        Err(SupervisorError::Lifecycle(format!("create failed: {}", error)))
    }

    fn on_listen(&self) {
        let message = match &self.handle.endpoint {
            Endpoint::Agent { name } => Message::AgentSuccess { name: name.clone() },
            _ => Message::WorkerSuccess,
        };
        if let Err(e) = self.handle.send(Target::Master, message) {
            warn!(endpoint = %self.handle.endpoint, "failed to report readiness: {}", e);
        }
        if self.state() == LifecycleState::NotStarted {
            self.set_state(LifecycleState::Running);
        }
        self.installed.store(true, Ordering::Release);
        info!(endpoint = %self.handle.endpoint, "started");
    }

    /// Report a fatal error.
    ///
    /// Only the first error before readiness reaches the master; anything
    /// else is logged locally.
    pub fn on_error(&self, error: &str) {
        if self.is_installed() || self.error_reported.swap(true, Ordering::AcqRel) {
            error!(endpoint = %self.handle.endpoint, "{}", error);
            return;
        }
        error!(endpoint = %self.handle.endpoint, "startup failed: {}", error);
        let message = match &self.handle.endpoint {
            Endpoint::Agent { name } => Message::AgentError {
                name: name.clone(),
                error: error.to_string(),
            },
            _ => Message::WorkerError {
                error: error.to_string(),
            },
        };
        if let Err(e) = self.handle.send(Target::Master, message) {
            warn!(endpoint = %self.handle.endpoint, "failed to report error: {}", e);
        }
    }

    /// Report a panic on any thread through [`Self::on_error`] while the
    /// process is not ready yet. The previously installed panic hook still
    /// runs.
    pub fn report_panics(self: &Arc<Self>) {
        let lifecycle = Arc::downgrade(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if let Some(lifecycle) = lifecycle.upgrade() {
                if !lifecycle.is_installed() {
                    lifecycle.on_error(&panic_message(info.payload()));
                }
            }
            previous(info);
        }));
    }

    /// Allow the process to close. Does not start the teardown by itself.
    pub fn request_close(&self) {
        if self.close_requested.send_replace(true) {
            return;
        }
        debug!(endpoint = %self.handle.endpoint, "close requested");
        if matches!(
            self.state(),
            LifecycleState::NotStarted | LifecycleState::Running
        ) {
            self.set_state(LifecycleState::ClosingRequested);
        }
    }

    /// Dispatch one inbound envelope
    pub async fn handle_message(&self, envelope: Envelope) {
        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(endpoint = %self.handle.endpoint, "dropping message: {}", e);
                return;
            }
        };

        match (self.handle.role(), message) {
            (Role::Agent, Message::AgentClose) | (Role::Worker, Message::WorkerClose) => {
                self.request_close();
            }
            (Role::Agent, Message::AgentExtraRequest) => {
                let data = self.app.lock().await.extra().await;
                let name = match &self.handle.endpoint {
                    Endpoint::Agent { name } => name.clone(),
                    other => other.to_string(),
                };
                if let Err(e) = self
                    .handle
                    .send(Target::Master, Message::AgentExtra { name, data })
                {
                    warn!(endpoint = %self.handle.endpoint, "failed to send extra data: {}", e);
                }
            }
            _ => {
                if let Err(e) = self.app.lock().await.message(&envelope).await {
                    warn!(
                        endpoint = %self.handle.endpoint,
                        action = %envelope.action,
                        "message hook failed: {:#}", e
                    );
                }
            }
        }
    }

    /// Handle a termination signal.
    ///
    /// Waits for the close flag, then runs `destroy` once and returns the
    /// exit code. Returns `None` when a previous call already owns the
    /// shutdown.
    pub async fn handle_termination_signal(&self, signal: ShutdownSignal) -> Option<i32> {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.handle.endpoint, %signal, "already closing");
            return None;
        }

        let mut close = self.close_requested.subscribe();
        if close.wait_for(|requested| *requested).await.is_err() {
            return Some(1);
        }

        self.set_state(LifecycleState::Destroying);
        let outcome = AssertUnwindSafe(async { self.app.lock().await.destroy(signal).await })
            .catch_unwind()
            .await;
        let code = match outcome {
            Ok(Ok(())) => {
                info!(endpoint = %self.handle.endpoint, %signal, "closed");
                0
            }
            Ok(Err(e)) => {
                error!(endpoint = %self.handle.endpoint, "destroy failed: {:#}", e);
                1
            }
            Err(panic) => {
                error!(endpoint = %self.handle.endpoint, "destroy panicked: {}", panic_message(&*panic));
                1
            }
        };
        self.set_state(LifecycleState::Exited);
        Some(code)
    }

    /// Drive the process until it has closed and return its exit code.
    ///
    /// Inbound messages are dispatched as they arrive, `create` runs
    /// concurrently, and each signal from `signals` is handed to
    /// [`Self::handle_termination_signal`]. Losing the link to the master
    /// counts as permission to close.
    pub async fn serve<S>(self: Arc<Self>, mut inbound: mpsc::UnboundedReceiver<Envelope>, signals: S) -> i32
    where
        S: Stream<Item = ShutdownSignal> + Send,
    {
        let pump = {
            let lifecycle = self.clone();
            tokio::spawn(async move {
                while let Some(envelope) = inbound.recv().await {
                    lifecycle.handle_message(envelope).await;
                }
                debug!(endpoint = %lifecycle.handle.endpoint, "link to master closed");
                lifecycle.request_close();
            })
        };
        let starter = {
            let lifecycle = self.clone();
            tokio::spawn(async move {
                let _ = lifecycle.start().await;
            })
        };

        let mut signals = std::pin::pin!(signals);
        let code = loop {
            match signals.next().await {
                Some(signal) => {
                    info!(endpoint = %self.handle.endpoint, %signal, "termination signal received");
                    if let Some(code) = self.handle_termination_signal(signal).await {
                        break code;
                    }
                }
                None => {
                    warn!(endpoint = %self.handle.endpoint, "signal stream ended");
                    break 1;
                }
            }
        };

        pump.abort();
        starter.abort();
        code
    }
}

/// Connect to the master, build the application and serve it
async fn run_child<A, F>(build: F) -> Result<i32>
where
    A: Application,
    F: FnOnce(LifecycleHandle) -> A,
{
    let args = ChildArgs::from_env()?;
    let endpoint = match &args.agent_name {
        Some(name) => Endpoint::agent(name.clone()),
        None => Endpoint::worker(std::process::id()),
    };
    // Listen before anything else so an early SIGTERM cannot kill us outright.
    let signals = ShutdownSignals::new()?;
    let (link, inbound) = ChildLink::connect_from_env(endpoint.clone()).await?;
    let handle = LifecycleHandle::new(endpoint, args, Arc::new(link));
    let lifecycle = Arc::new(ProcessLifecycle::new(handle.clone(), build(handle)));
    lifecycle.report_panics();
    Ok(lifecycle.serve(inbound, signals.into_stream()).await)
}

async fn run_and_exit<A, F>(role: Role, build: F)
where
    A: Application,
    F: FnOnce(LifecycleHandle) -> A,
{
    let code = match run_child(build).await {
        Ok(code) => code,
        Err(e) => {
            error!(%role, "{}", e);
            1
        }
    };
    std::process::exit(code)
}

/// Entry point for an agent executable; exits the process when done
pub async fn run_agent<A, F>(build: F)
where
    A: Application,
    F: FnOnce(LifecycleHandle) -> A,
{
    run_and_exit(Role::Agent, build).await
}

/// Entry point for a worker executable; exits the process when done
pub async fn run_worker<A, F>(build: F)
where
    A: Application,
    F: FnOnce(LifecycleHandle) -> A,
{
    run_and_exit(Role::Worker, build).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryTransport;
    use serde_json::json;
    use std::time::Duration;

    #[derive(Default, Clone)]
    struct Script {
        fail_create: bool,
        panic_create: bool,
        fail_destroy: bool,
    }

    struct TestApp {
        script: Script,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Application for TestApp {
        async fn create(&mut self) -> anyhow::Result<()> {
            if self.script.panic_create {
                panic!("create exploded");
            }
            if self.script.fail_create {
                anyhow::bail!("boom");
            }
            self.events.lock().unwrap().push("create".into());
            Ok(())
        }

        async fn destroy(&mut self, signal: ShutdownSignal) -> anyhow::Result<()> {
            self.events.lock().unwrap().push(format!("destroy:{}", signal));
            if self.script.fail_destroy {
                anyhow::bail!("cannot close");
            }
            Ok(())
        }

        async fn message(&mut self, envelope: &Envelope) -> anyhow::Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(format!("message:{}", envelope.action));
            Ok(())
        }

        async fn extra(&mut self) -> Value {
            json!({"port": 7001})
        }
    }

    type Fixture = (
        Arc<ProcessLifecycle<TestApp>>,
        Arc<MemoryTransport>,
        Arc<Mutex<Vec<String>>>,
    );

    fn lifecycle(endpoint: Endpoint, script: Script) -> Fixture {
        let (transport, _inbox) = MemoryTransport::pair();
        let args = match &endpoint {
            Endpoint::Agent { name } => ChildArgs::agent("/srv", name.clone(), "/fw", Vec::new()),
            _ => ChildArgs::worker("/srv", "/fw", Default::default(), Vec::new()),
        };
        let handle = LifecycleHandle::new(endpoint, args, transport.clone());
        let events = Arc::new(Mutex::new(Vec::new()));
        let app = TestApp {
            script,
            events: events.clone(),
        };
        (
            Arc::new(ProcessLifecycle::new(handle, app)),
            transport,
            events,
        )
    }

    fn inbound(to: Target, message: Message) -> Envelope {
        Envelope::new(Endpoint::Master, to, message).unwrap()
    }

    #[tokio::test]
    async fn test_start_reports_agent_success() {
        let (lc, transport, events) = lifecycle(Endpoint::agent("a"), Script::default());
        lc.start().await.unwrap();

        assert_eq!(lc.state(), LifecycleState::Running);
        assert!(lc.is_installed());
        assert_eq!(*events.lock().unwrap(), vec!["create"]);
        assert_eq!(
            transport.sent(),
            vec![(Target::Master, Message::AgentSuccess { name: "a".into() })]
        );
    }

    #[tokio::test]
    async fn test_start_reports_worker_success() {
        let (lc, transport, _) = lifecycle(Endpoint::worker(9), Script::default());
        lc.start().await.unwrap();
        assert_eq!(transport.sent(), vec![(Target::Master, Message::WorkerSuccess)]);
    }

    #[tokio::test]
    async fn test_create_error_is_reported_once() {
        let script = Script {
            fail_create: true,
            ..Script::default()
        };
        let (lc, transport, _) = lifecycle(Endpoint::agent("a"), script);

        assert!(lc.start().await.is_err());
        lc.on_error("second failure");

        assert_eq!(
            transport.sent(),
            vec![(
                Target::Master,
                Message::AgentError {
                    name: "a".into(),
                    error: "boom".into()
                }
            )]
        );
        assert!(!lc.is_installed());
        assert_eq!(lc.state(), LifecycleState::NotStarted);
    }

    #[tokio::test]
    async fn test_create_panic_is_caught_and_reported() {
        let script = Script {
            panic_create: true,
            ..Script::default()
        };
        let (lc, transport, _) = lifecycle(Endpoint::worker(3), script);

        assert!(lc.start().await.is_err());
        assert_eq!(
            transport.sent(),
            vec![(
                Target::Master,
                Message::WorkerError {
                    error: "create exploded".into()
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_errors_after_readiness_are_not_reported() {
        let (lc, transport, _) = lifecycle(Endpoint::worker(3), Script::default());
        lc.start().await.unwrap();
        lc.on_error("late");
        assert_eq!(transport.sent(), vec![(Target::Master, Message::WorkerSuccess)]);
    }

    #[tokio::test]
    async fn test_signal_waits_for_close_instruction() {
        let (lc, _, events) = lifecycle(Endpoint::worker(3), Script::default());
        lc.start().await.unwrap();

        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.handle_termination_signal(ShutdownSignal::Terminate).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(!events.lock().unwrap().iter().any(|e| e.starts_with("destroy")));

        lc.handle_message(inbound(Target::Worker { pid: 3 }, Message::WorkerClose))
            .await;

        assert_eq!(waiter.await.unwrap(), Some(0));
        assert_eq!(lc.state(), LifecycleState::Exited);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["create".to_string(), "destroy:SIGTERM".to_string()]
        );
    }

    #[tokio::test]
    async fn test_close_before_signal_closes_immediately() {
        let (lc, _, _) = lifecycle(Endpoint::agent("a"), Script::default());
        lc.request_close();
        assert_eq!(lc.state(), LifecycleState::ClosingRequested);
        assert_eq!(
            lc.handle_termination_signal(ShutdownSignal::Interrupt).await,
            Some(0)
        );
    }

    #[tokio::test]
    async fn test_termination_is_idempotent() {
        let (lc, _, events) = lifecycle(Endpoint::agent("a"), Script::default());
        lc.request_close();
        assert_eq!(
            lc.handle_termination_signal(ShutdownSignal::Terminate).await,
            Some(0)
        );
        assert_eq!(lc.handle_termination_signal(ShutdownSignal::Quit).await, None);

        let destroys = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.starts_with("destroy"))
            .count();
        assert_eq!(destroys, 1);
    }

    #[tokio::test]
    async fn test_failing_destroy_exits_with_one() {
        let script = Script {
            fail_destroy: true,
            ..Script::default()
        };
        let (lc, _, _) = lifecycle(Endpoint::worker(3), script);
        lc.request_close();
        assert_eq!(
            lc.handle_termination_signal(ShutdownSignal::Terminate).await,
            Some(1)
        );
    }

    #[tokio::test]
    async fn test_close_for_other_role_goes_to_message_hook() {
        let (lc, _, events) = lifecycle(Endpoint::worker(3), Script::default());
        lc.handle_message(inbound(Target::Workers, Message::AgentClose))
            .await;
        lc.handle_message(inbound(Target::Workers, Message::ClusterReady))
            .await;

        assert!(!lc.is_close_requested());
        assert_eq!(
            *events.lock().unwrap(),
            vec!["message:ipc:agent#close", "message:cluster:ready"]
        );
    }

    #[tokio::test]
    async fn test_agent_answers_extra_data_request() {
        let (lc, transport, _) = lifecycle(Endpoint::agent("a"), Script::default());
        lc.handle_message(inbound(Target::Agents, Message::AgentExtraRequest))
            .await;
        assert_eq!(
            transport.sent(),
            vec![(
                Target::Master,
                Message::AgentExtra {
                    name: "a".into(),
                    data: json!({"port": 7001})
                }
            )]
        );
    }

    #[tokio::test]
    async fn test_serve_treats_lost_master_as_close() {
        let (lc, transport, events) = lifecycle(Endpoint::worker(3), Script::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let signals = futures::stream::iter([ShutdownSignal::Terminate])
            .chain(futures::stream::pending());

        let serving = tokio::spawn(lc.clone().serve(rx, signals));
        transport
            .wait_for(|_, message| *message == Message::WorkerSuccess)
            .await;
        drop(tx);

        assert_eq!(serving.await.unwrap(), 0);
        assert!(events.lock().unwrap().contains(&"destroy:SIGTERM".to_string()));
    }
}
