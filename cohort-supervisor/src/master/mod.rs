//! Cluster master
//!
//! The [`Master`] spawns agents and then the worker pool, routes channel
//! traffic into [`ClusterState`], respawns workers that die, and runs the
//! graceful-then-forced shutdown.
//!
//! One event loop (the pump) handles every inbound message, connection and
//! child exit in order. Startup and shutdown run beside it and observe the
//! cluster state through its change notifications.

use crate::channel::{ChannelHub, Inbound, Transport};
use crate::process::{
    LaunchSpec, LaunchedChild, Launcher, NixSignaller, ProcessArgv, ProcessHandle,
    ProcessLauncher, Signaller,
};
use crate::signals::ShutdownSignals;
use crate::state::{ChildStatus, ClusterState, Group, GroupStatus};
use crate::{Result, SupervisorError};
use cohort_core::{
    ChildArgs, ClusterConfig, DEBUG_FLAGS_ENV, Endpoint, Envelope, Message, Role, Target,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};


/// Groups closed by a plain shutdown, in order
pub const DEFAULT_SHUTDOWN_ORDER: [Group; 2] = [Group::Workers, Group::Agents];

const CUSTOM_CAPACITY: usize = 64;

struct ChildExit {
    endpoint: Endpoint,
    handle: ProcessHandle,
    code: Option<i32>,
}

type Receivers = (
    mpsc::UnboundedReceiver<Inbound>,
    mpsc::UnboundedReceiver<ChildExit>,
);

/// Builder for [`Master`]
pub struct MasterBuilder {
    config: ClusterConfig,
    transport: Option<(Arc<dyn Transport>, mpsc::UnboundedReceiver<Inbound>)>,
    launcher: Option<Arc<dyn Launcher>>,
    signaller: Option<Arc<dyn Signaller>>,
    argv: Option<ProcessArgv>,
}

impl MasterBuilder {
    /// Use a custom transport and the inbox it delivers to
    pub fn transport(
        mut self,
        transport: Arc<dyn Transport>,
        inbox: mpsc::UnboundedReceiver<Inbound>,
    ) -> Self {
        self.transport = Some((transport, inbox));
        self
    }

    pub fn launcher(mut self, launcher: Arc<dyn Launcher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn signaller(mut self, signaller: Arc<dyn Signaller>) -> Self {
        self.signaller = Some(signaller);
        self
    }

    /// Arguments handed through to every child (default: this process's)
    pub fn argv(mut self, argv: ProcessArgv) -> Self {
        self.argv = Some(argv);
        self
    }

    /// Validate the configuration and build the master.
    ///
    /// Without a custom transport this binds a [`ChannelHub`], so it must be
    /// called inside a tokio runtime.
    pub fn build(self) -> Result<Master> {
        let config = self.config.resolve()?;

        let (transport, inbox) = match self.transport {
            Some(pair) => pair,
            None => {
                let (hub, inbox) = ChannelHub::bind()?;
                (Arc::new(hub) as Arc<dyn Transport>, inbox)
            }
        };
        let launcher = self
            .launcher
            .unwrap_or_else(|| Arc::new(ProcessLauncher) as Arc<dyn Launcher>);
        let signaller = self
            .signaller
            .unwrap_or_else(|| Arc::new(NixSignaller) as Arc<dyn Signaller>);
        let argv = self.argv.unwrap_or_else(ProcessArgv::from_env);

        let (exits, exits_rx) = mpsc::unbounded_channel();
        let (exit, _) = watch::channel(None);
        let (custom, _) = broadcast::channel(CUSTOM_CAPACITY);

        debug!(
            cwd = %config.cwd.display(),
            agents = config.agents.len(),
            workers = config.max_workers,
            "master configured"
        );

        Ok(Master {
            inner: Arc::new(MasterInner {
                state: ClusterState::new(transport.clone(), signaller),
                config,
                transport,
                launcher,
                argv,
                refork: AtomicBool::new(true),
                shutting_down: AtomicBool::new(false),
                spawn_lock: AsyncMutex::new(()),
                exits,
                exit,
                custom,
            }),
            receivers: Mutex::new(Some((inbox, exits_rx))),
            pump: Mutex::new(None),
        })
    }
}

/// Supervisor of one agent set and one worker pool
pub struct Master {
    inner: Arc<MasterInner>,
    receivers: Mutex<Option<Receivers>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Master {
    pub fn builder(config: ClusterConfig) -> MasterBuilder {
        MasterBuilder {
            config,
            transport: None,
            launcher: None,
            signaller: None,
            argv: None,
        }
    }

    /// Resolved configuration
    pub fn config(&self) -> &ClusterConfig {
        &self.inner.config
    }

    /// Aggregate state of every child
    pub fn state(&self) -> &ClusterState {
        &self.inner.state
    }

    fn start_pump(&self) {
        let receivers = self
            .receivers
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some((inbox, exits)) = receivers {
            let task = tokio::spawn(pump(self.inner.clone(), inbox, exits));
            *self.pump.lock().unwrap_or_else(|p| p.into_inner()) = Some(task);
        }
    }

    /// Start the cluster: agents first, then workers, then broadcast
    /// `cluster:ready`.
    ///
    /// On failure the started groups are shut down (exit code 1) before the
    /// error is returned.
    pub async fn listen(&self) -> Result<()> {
        self.start_pump();
        self.inner.startup().await
    }

    /// Shut the given groups down in order.
    ///
    /// Returns the exit code, or `None` if a shutdown was already running.
    pub async fn kill(&self, groups: &[Group]) -> Option<i32> {
        self.inner.shutdown(groups, false).await
    }

    /// Shut workers and then agents down
    pub async fn shutdown(&self) -> Option<i32> {
        self.kill(&DEFAULT_SHUTDOWN_ORDER).await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.is_shutting_down()
    }

    /// Exit code, once shutdown has finished
    pub fn exit_code(&self) -> Option<i32> {
        *self.inner.exit.borrow()
    }

    /// Wait for shutdown to finish and return the exit code
    pub async fn wait(&self) -> i32 {
        let mut exit = self.inner.exit.subscribe();
        match exit.wait_for(Option::is_some).await {
            Ok(code) => code.unwrap_or(1),
            Err(_) => 1,
        }
    }

    /// Messages with actions the master does not handle itself
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inner.custom.subscribe()
    }

    /// Send a message to a child or a group
    pub fn send(&self, to: Target, message: Message) -> Result<()> {
        self.inner.transport.send(to, message)
    }

    /// Start the cluster and supervise it until a termination signal or a
    /// `teardown` message shuts it down. Returns the exit code.
    pub async fn run(&self) -> i32 {
        let mut signals = match ShutdownSignals::new() {
            Ok(signals) => signals,
            Err(e) => {
                error!("failed to listen for signals: {}", e);
                return 1;
            }
        };

        let signal = tokio::select! {
            result = self.listen() => match result {
                Ok(()) => tokio::select! {
                    signal = signals.recv() => signal,
                    code = self.wait() => return code,
                },
                Err(e) => {
                    error!("cluster failed to start: {}", e);
                    return self.wait().await;
                }
            },
            signal = signals.recv() => signal,
        };

        match signal {
            Some(signal) => info!(%signal, "received signal, shutting down"),
            None => warn!("signal stream closed, shutting down"),
        }
        self.shutdown().await;
        self.wait().await
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        if let Some(task) = self.pump.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

struct MasterInner {
    config: ClusterConfig,
    state: ClusterState,
    transport: Arc<dyn Transport>,
    launcher: Arc<dyn Launcher>,
    argv: ProcessArgv,
    refork: AtomicBool,
    shutting_down: AtomicBool,
    /// Held while a child is launched and registered, and while the pump
    /// handles an event, so no event is seen before its child is tracked
    spawn_lock: AsyncMutex<()>,
    exits: mpsc::UnboundedSender<ChildExit>,
    exit: watch::Sender<Option<i32>>,
    custom: broadcast::Sender<Envelope>,
}

async fn pump(
    inner: Arc<MasterInner>,
    mut inbox: mpsc::UnboundedReceiver<Inbound>,
    mut exits: mpsc::UnboundedReceiver<ChildExit>,
) {
    loop {
        tokio::select! {
            Some(inbound) = inbox.recv() => {
                let _guard = inner.spawn_lock.lock().await;
                inner.on_inbound(inbound).await;
            }
            Some(exit) = exits.recv() => {
                let _guard = inner.spawn_lock.lock().await;
                inner.on_exit(exit).await;
            }
            else => break,
        }
    }
    debug!("master event loop stopped");
}

impl MasterInner {
    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutting_down() {
            Err(SupervisorError::Lifecycle(
                "shutdown started during startup".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    async fn startup(self: &Arc<Self>) -> Result<()> {
        let timeout = self.config.timeout;

        if !self.config.agents.is_empty() {
            for name in &self.config.agents {
                self.ensure_running()?;
                if let Err(e) = self.spawn_agent(name).await {
                    return self.abort_startup(&[Group::Agents], e).await;
                }
            }
            if !self.state.wait_group_status(Group::Agents, timeout).await {
                let e = self.startup_error(Group::Agents).await;
                return self.abort_startup(&[Group::Agents], e).await;
            }

            self.ensure_running()?;
            if let Err(e) = self
                .transport
                .send(Target::Agents, Message::AgentExtraRequest)
            {
                debug!("extra data request not delivered: {}", e);
            }
            if !self.state.wait_agent_extra(timeout).await {
                warn!("agents did not publish their extra data in time");
                return self
                    .abort_startup(&[Group::Agents], SupervisorError::StartupTimeout)
                    .await;
            }
        }

        self.ensure_running()?;
        for _ in 0..self.config.max_workers {
            if let Err(e) = self.spawn_worker().await {
                return self.abort_startup(&DEFAULT_SHUTDOWN_ORDER, e).await;
            }
        }
        if !self.state.wait_group_status(Group::Workers, timeout).await {
            let e = self.startup_error(Group::Workers).await;
            return self.abort_startup(&DEFAULT_SHUTDOWN_ORDER, e).await;
        }

        self.ensure_running()?;
        for group in [Target::Agents, Target::Workers] {
            if let Err(e) = self.transport.send(group.clone(), Message::ClusterReady) {
                debug!(%group, "ready broadcast not delivered: {}", e);
            }
        }
        info!(
            agents = self.config.agents.len(),
            workers = self.config.max_workers,
            "cluster ready"
        );
        Ok(())
    }

    async fn startup_error(&self, group: Group) -> SupervisorError {
        if self.is_shutting_down() {
            return SupervisorError::Lifecycle("shutdown started during startup".to_string());
        }
        match self.state.group_status(group).await {
            GroupStatus::Failed => SupervisorError::Lifecycle(format!("{} failed to start", group)),
            _ => SupervisorError::StartupTimeout,
        }
    }

    async fn abort_startup(self: &Arc<Self>, groups: &[Group], error: SupervisorError) -> Result<()> {
        error!("startup failed: {}", error);
        self.shutdown(groups, true).await;
        Err(error)
    }

    fn child_env(&self) -> Vec<(String, String)> {
        let mut envs = self.transport.child_env();
        if !self.argv.debug_flags.is_empty() {
            envs.push((DEBUG_FLAGS_ENV.to_string(), self.argv.debug_flags.join(" ")));
        }
        envs
    }

    fn launch(&self, role: Role, args: ChildArgs) -> Result<LaunchedChild> {
        let spec = LaunchSpec {
            role,
            program: self.config.entry(role)?,
            args: args.to_args(),
            cwd: self.config.cwd.clone(),
            envs: self.child_env(),
        };
        self.launcher.launch(spec)
    }

    fn watch_exit(&self, endpoint: Endpoint, child: LaunchedChild) {
        let exits = self.exits.clone();
        let LaunchedChild { handle, exit } = child;
        tokio::spawn(async move {
            let code = exit.await;
            let _ = exits.send(ChildExit {
                endpoint,
                handle,
                code,
            });
        });
    }

    async fn spawn_agent(&self, name: &str) -> Result<()> {
        let _guard = self.spawn_lock.lock().await;
        let args = ChildArgs::agent(
            &self.config.cwd,
            name,
            self.config.framework_dir()?,
            self.argv.args.clone(),
        );
        let endpoint = Endpoint::agent(name);
        self.transport.announce(&endpoint);
        let child = match self.launch(Role::Agent, args) {
            Ok(child) => child,
            Err(e) => {
                self.transport.forget(&endpoint);
                return Err(e);
            }
        };
        let pid = child.handle.pid();

        self.state.add_agent(name, child.handle.clone()).await;
        self.state.agent_forking(name).await;
        self.watch_exit(endpoint, child);
        info!(agent = name, pid, "agent spawned");
        Ok(())
    }

    async fn spawn_worker(&self) -> Result<u32> {
        let _guard = self.spawn_lock.lock().await;
        self.launch_worker().await
    }

    /// Caller holds `spawn_lock`
    async fn launch_worker(&self) -> Result<u32> {
        let args = ChildArgs::worker(
            &self.config.cwd,
            self.config.framework_dir()?,
            self.state.agent_extra().await,
            self.argv.args.clone(),
        );
        let child = self.launch(Role::Worker, args)?;
        let pid = child.handle.pid();
        self.transport.announce(&Endpoint::worker(pid));

        self.state.add_worker(child.handle.clone()).await;
        self.watch_exit(Endpoint::worker(pid), child);
        info!(pid, "worker spawned");
        Ok(pid)
    }

    async fn on_inbound(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::Connected(Endpoint::Worker { pid }) => {
                if self.state.worker_forking(pid).await {
                    debug!(pid, "worker online");
                }
            }
            Inbound::Connected(endpoint) => debug!(%endpoint, "connected"),
            Inbound::Disconnected(endpoint) => debug!(%endpoint, "disconnected"),
            Inbound::Message(envelope) => self.dispatch(envelope).await,
        }
    }

    async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let message = match envelope.message() {
            Ok(message) => message,
            Err(e) => {
                warn!(from = %envelope.from, "dropping message: {}", e);
                return;
            }
        };

        match message {
            Message::AgentSuccess { name } => {
                self.state.record_success(&Endpoint::agent(name)).await;
            }
            Message::AgentError { name, error } => {
                warn!(agent = %name, %error, "agent failed to start");
                self.state
                    .record_failure(&Endpoint::agent(name), error)
                    .await;
            }
            Message::WorkerSuccess => {
                self.state.record_success(&envelope.from).await;
            }
            Message::WorkerError { error } => {
                warn!(from = %envelope.from, %error, "worker failed to start");
                self.state.record_failure(&envelope.from, error).await;
            }
            Message::AgentExtra { name, data } => {
                debug!(agent = %name, "received agent extra data");
                self.state.record_agent_extra(&name, data).await;
            }
            Message::Teardown => {
                info!(from = %envelope.from, "teardown requested");
                let inner = self.clone();
                tokio::spawn(async move {
                    inner.shutdown(&DEFAULT_SHUTDOWN_ORDER, false).await;
                });
            }
            Message::Custom { .. } => {
                // No subscribers is fine.
                let _ = self.custom.send(envelope);
            }
            Message::Hello
            | Message::AgentClose
            | Message::WorkerClose
            | Message::AgentExtraRequest
            | Message::ClusterReady => {
                debug!(from = %envelope.from, action = %envelope.action, "ignoring unexpected message");
            }
        }
    }

    async fn on_exit(self: &Arc<Self>, exit: ChildExit) {
        let ChildExit {
            endpoint,
            handle,
            code,
        } = exit;
        handle.mark_exited();
        self.transport.forget(&endpoint);

        let shutting_down = self.is_shutting_down();
        if !shutting_down {
            let pending = self
                .state
                .record(&endpoint)
                .await
                .is_some_and(|record| record.status == ChildStatus::Pending);
            if pending {
                self.state
                    .record_failure(&endpoint, format!("exited with {:?} before it was ready", code))
                    .await;
            }
        }

        match &endpoint {
            Endpoint::Agent { name } => {
                if shutting_down {
                    info!(agent = %name, ?code, "agent exited");
                } else {
                    warn!(agent = %name, ?code, "agent exited and will not be restarted");
                }
                self.state.agent_killed(name).await;
            }
            Endpoint::Worker { pid } => {
                self.state.worker_killed(*pid).await;
                if self.refork.load(Ordering::Acquire) {
                    warn!(pid, ?code, "worker exited, forking a replacement");
                    if let Err(e) = self.launch_worker().await {
                        error!("failed to replace worker {}: {}", pid, e);
                    }
                } else {
                    info!(pid, ?code, "worker exited");
                }
            }
            Endpoint::Master => {}
        }
    }

    /// Latched shutdown: only the first caller starts it.
    ///
    /// Refork is disabled before any child is signalled. The sequence runs in
    /// its own task and finishes even if the caller is dropped.
    async fn shutdown(self: &Arc<Self>, groups: &[Group], failed: bool) -> Option<i32> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            debug!("shutdown already in progress");
            return None;
        }
        self.refork.store(false, Ordering::Release);
        info!(?groups, "shutting down");

        let inner = self.clone();
        let groups = groups.to_vec();
        let task = tokio::spawn(async move { inner.drain(&groups, failed).await });
        match task.await {
            Ok(code) => Some(code),
            Err(e) => {
                error!("shutdown task failed: {}", e);
                self.state.force_kill_all().await;
                self.exit.send_replace(Some(1));
                Some(1)
            }
        }
    }

    /// Close and drain each group in turn within `shutdown_timeout`, then
    /// force-kill whatever is still tracked and publish the exit code.
    /// `failed` forces exit code 1.
    async fn drain(&self, groups: &[Group], failed: bool) -> i32 {
        let graceful = async {
            for group in groups {
                self.state.request_group_close(*group).await;
                self.state.wait_group_empty(*group).await;
            }
        };
        let completed = match tokio::time::timeout(self.config.shutdown_timeout, graceful).await {
            Ok(()) => true,
            Err(_) => {
                error!(timeout = ?self.config.shutdown_timeout, "{}", SupervisorError::ShutdownTimeout);
                false
            }
        };

        let killed = self.state.force_kill_all().await;
        if killed > 0 {
            warn!(killed, "force killed remaining children");
        }

        let code = if completed && !failed { 0 } else { 1 };
        info!(code, "shutdown complete");
        self.exit.send_replace(Some(code));
        code
    }
}
