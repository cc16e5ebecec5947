//! Master-side cluster state
//!
//! [`ClusterState`] aggregates every agent and worker record, decides when a
//! group has started or failed, and coordinates close requests and the final
//! force-kill sweep. Waiters are woken by a change counter on every mutation,
//! so nothing polls.

use crate::channel::Transport;
use crate::process::{ProcessHandle, Signaller};
use cohort_core::{Endpoint, Message, Target};
use nix::sys::signal::Signal;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, watch};
use tracing::{debug, info, warn};

/// One of the two tracked collections of children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Group {
    Agents,
    Workers,
}

impl std::fmt::Display for Group {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Group::Agents => write!(f, "agents"),
            Group::Workers => write!(f, "workers"),
        }
    }
}

/// Readiness of a single child
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildStatus {
    /// Not reported yet
    Pending,
    /// Reported success
    Ready,
    /// Reported failure, with the failure message
    Failed(String),
}

/// Aggregate readiness of a group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStatus {
    /// Some children have not reported
    Starting,
    /// Every expected child is ready
    Ready,
    /// At least one child failed
    Failed,
}

/// One tracked child
#[derive(Debug, Clone)]
pub struct ChildRecord {
    pub handle: ProcessHandle,
    pub status: ChildStatus,
    counted: bool,
}

impl ChildRecord {
    pub fn pid(&self) -> u32 {
        self.handle.pid()
    }

    /// Whether the record contributes to the group's expected total
    pub fn is_counted(&self) -> bool {
        self.counted
    }
}

/// Counts describing a group at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GroupSnapshot {
    pub expected_total: usize,
    pub pending: usize,
    pub ready: usize,
    pub failed: usize,
}

#[derive(Debug)]
struct ClusterGroup<K> {
    records: HashMap<K, ChildRecord>,
    expected_total: usize,
    /// First failure seen; sticky so a later exit cannot hide it
    failure: Option<String>,
}

impl<K> Default for ClusterGroup<K> {
    fn default() -> Self {
        Self {
            records: HashMap::new(),
            expected_total: 0,
            failure: None,
        }
    }
}

impl<K: Eq + Hash> ClusterGroup<K> {
    fn insert(&mut self, key: K, handle: ProcessHandle) {
        let record = ChildRecord {
            handle,
            status: ChildStatus::Pending,
            counted: false,
        };
        if let Some(old) = self.records.insert(key, record) {
            if old.counted {
                self.expected_total = self.expected_total.saturating_sub(1);
            }
        }
    }

    fn count(&mut self, key: &K) -> bool {
        match self.records.get_mut(key) {
            Some(record) if !record.counted => {
                record.counted = true;
                self.expected_total += 1;
                true
            }
            _ => false,
        }
    }

    fn remove(&mut self, key: &K) -> Option<ChildRecord> {
        let record = self.records.remove(key)?;
        if record.counted {
            self.expected_total = self.expected_total.saturating_sub(1);
        }
        Some(record)
    }

    fn set_status(&mut self, key: &K, status: ChildStatus) -> bool {
        match self.records.get_mut(key) {
            Some(record) if record.status == ChildStatus::Pending => {
                if let ChildStatus::Failed(message) = &status {
                    self.failure.get_or_insert_with(|| message.clone());
                }
                record.status = status;
                true
            }
            _ => false,
        }
    }

    fn ready(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.status == ChildStatus::Ready)
            .count()
    }

    fn all_accounted_for(&self) -> bool {
        self.records
            .values()
            .all(|r| r.status != ChildStatus::Pending)
    }

    fn all_succeeded(&self) -> bool {
        self.failure.is_none() && self.all_accounted_for() && self.ready() == self.expected_total
    }

    fn all_gone(&self) -> bool {
        self.expected_total == 0 && self.records.is_empty()
    }

    fn status(&self) -> GroupStatus {
        if self.failure.is_some() {
            GroupStatus::Failed
        } else if self.all_succeeded() {
            GroupStatus::Ready
        } else {
            GroupStatus::Starting
        }
    }

    fn snapshot(&self) -> GroupSnapshot {
        let mut snapshot = GroupSnapshot {
            expected_total: self.expected_total,
            ..GroupSnapshot::default()
        };
        for record in self.records.values() {
            match record.status {
                ChildStatus::Pending => snapshot.pending += 1,
                ChildStatus::Ready => snapshot.ready += 1,
                ChildStatus::Failed(_) => snapshot.failed += 1,
            }
        }
        snapshot
    }
}

#[derive(Debug, Default)]
struct Inner {
    agents: ClusterGroup<String>,
    workers: ClusterGroup<u32>,
    /// Every pid still tracked, for the force-kill sweep
    pool: Vec<u32>,
    extra: Map<String, Value>,
}

impl Inner {
    fn status(&self, group: Group) -> GroupStatus {
        match group {
            Group::Agents => self.agents.status(),
            Group::Workers => self.workers.status(),
        }
    }

    fn all_gone(&self, group: Group) -> bool {
        match group {
            Group::Agents => self.agents.all_gone(),
            Group::Workers => self.workers.all_gone(),
        }
    }

    fn release(&mut self, pid: u32) {
        if let Some(index) = self.pool.iter().position(|p| *p == pid) {
            self.pool.remove(index);
        }
    }
}

/// Aggregate state of every agent and worker, owned by the master
pub struct ClusterState {
    inner: RwLock<Inner>,
    changes: watch::Sender<u64>,
    transport: Arc<dyn Transport>,
    signaller: Arc<dyn Signaller>,
}

impl ClusterState {
    pub fn new(transport: Arc<dyn Transport>, signaller: Arc<dyn Signaller>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: RwLock::new(Inner::default()),
            changes,
            transport,
            signaller,
        }
    }

    fn notify(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    /// Register a freshly spawned agent as pending
    pub async fn add_agent(&self, name: &str, handle: ProcessHandle) {
        {
            let mut inner = self.inner.write().await;
            inner.pool.push(handle.pid());
            inner.agents.insert(name.to_string(), handle);
        }
        self.notify();
    }

    /// Register a freshly spawned worker as pending
    pub async fn add_worker(&self, handle: ProcessHandle) {
        {
            let mut inner = self.inner.write().await;
            inner.pool.push(handle.pid());
            inner.workers.insert(handle.pid(), handle);
        }
        self.notify();
    }

    /// Count an agent into the expected total (at spawn time)
    pub async fn agent_forking(&self, name: &str) -> bool {
        let counted = self.inner.write().await.agents.count(&name.to_string());
        self.notify();
        counted
    }

    /// Count a worker into the expected total (once it is online)
    pub async fn worker_forking(&self, pid: u32) -> bool {
        let counted = self.inner.write().await.workers.count(&pid);
        self.notify();
        counted
    }

    /// Forget an agent whose process exited
    pub async fn agent_killed(&self, name: &str) {
        {
            let mut inner = self.inner.write().await;
            if let Some(record) = inner.agents.remove(&name.to_string()) {
                inner.release(record.pid());
            }
        }
        self.notify();
    }

    /// Forget a worker whose process exited
    pub async fn worker_killed(&self, pid: u32) {
        {
            let mut inner = self.inner.write().await;
            if inner.workers.remove(&pid).is_some() {
                inner.release(pid);
            }
        }
        self.notify();
    }

    /// Mark a child ready. Unknown or non-pending children are ignored.
    pub async fn record_success(&self, endpoint: &Endpoint) -> bool {
        self.transition(endpoint, ChildStatus::Ready).await
    }

    /// Mark a child failed. Unknown or non-pending children are ignored.
    pub async fn record_failure(&self, endpoint: &Endpoint, message: impl Into<String>) -> bool {
        self.transition(endpoint, ChildStatus::Failed(message.into()))
            .await
    }

    async fn transition(&self, endpoint: &Endpoint, status: ChildStatus) -> bool {
        let changed = {
            let mut inner = self.inner.write().await;
            match endpoint {
                Endpoint::Agent { name } => inner.agents.set_status(name, status),
                Endpoint::Worker { pid } => inner.workers.set_status(pid, status),
                Endpoint::Master => false,
            }
        };
        if changed {
            self.notify();
        } else {
            debug!(%endpoint, "ignoring status for unknown or settled child");
        }
        changed
    }

    /// Store the extra data an agent published
    pub async fn record_agent_extra(&self, name: &str, data: Value) {
        self.inner
            .write()
            .await
            .extra
            .insert(name.to_string(), data);
        self.notify();
    }

    /// Extra data collected from agents so far
    pub async fn agent_extra(&self) -> Map<String, Value> {
        self.inner.read().await.extra.clone()
    }

    /// Current aggregate status of a group
    pub async fn group_status(&self, group: Group) -> GroupStatus {
        self.inner.read().await.status(group)
    }

    /// Counts for a group
    pub async fn snapshot(&self, group: Group) -> GroupSnapshot {
        let inner = self.inner.read().await;
        match group {
            Group::Agents => inner.agents.snapshot(),
            Group::Workers => inner.workers.snapshot(),
        }
    }

    /// Record for a child, if tracked
    pub async fn record(&self, endpoint: &Endpoint) -> Option<ChildRecord> {
        let inner = self.inner.read().await;
        match endpoint {
            Endpoint::Agent { name } => inner.agents.records.get(name).cloned(),
            Endpoint::Worker { pid } => inner.workers.records.get(pid).cloned(),
            Endpoint::Master => None,
        }
    }

    /// Pids the force-kill sweep would target
    pub async fn tracked_pids(&self) -> Vec<u32> {
        self.inner.read().await.pool.clone()
    }

    async fn wait_until<T>(&self, check: impl Fn(&Inner) -> Option<T>) -> T {
        let mut changes = self.changes.subscribe();
        loop {
            let outcome = {
                let inner = self.inner.read().await;
                check(&inner)
            };
            if let Some(value) = outcome {
                return value;
            }
            if changes.changed().await.is_err() {
                // The sender lives as long as `self`.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Wait for a group to start.
    ///
    /// Resolves `true` once every child is ready and the ready count matches
    /// the expected total, `false` as soon as any child has failed or when
    /// `timeout` elapses. An empty group is ready immediately.
    pub async fn wait_group_status(&self, group: Group, timeout: Option<Duration>) -> bool {
        let wait = self.wait_until(|inner| match inner.status(group) {
            GroupStatus::Ready => Some(true),
            GroupStatus::Failed => Some(false),
            GroupStatus::Starting => None,
        });

        let ready = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(ready) => ready,
                Err(_) => {
                    warn!(%group, ?limit, "group startup timed out");
                    false
                }
            },
            None => wait.await,
        };

        let snapshot = self.snapshot(group).await;
        if ready {
            info!(%group, ready = snapshot.ready, "group started");
        } else {
            let failure = match group {
                Group::Agents => self.inner.read().await.agents.failure.clone(),
                Group::Workers => self.inner.read().await.workers.failure.clone(),
            };
            warn!(
                %group,
                pending = snapshot.pending,
                failed = snapshot.failed,
                error = failure.as_deref().unwrap_or("-"),
                "group failed to start"
            );
        }
        ready
    }

    /// Wait until every tracked agent has published its extra data
    pub async fn wait_agent_extra(&self, timeout: Option<Duration>) -> bool {
        let wait = self.wait_until(|inner| {
            inner
                .agents
                .records
                .keys()
                .all(|name| inner.extra.contains_key(name))
                .then_some(())
        });
        match timeout {
            Some(limit) => tokio::time::timeout(limit, wait).await.is_ok(),
            None => {
                wait.await;
                true
            }
        }
    }

    /// Ask every live child of a group to close: SIGTERM plus the role's
    /// close instruction. Children whose process already exited are skipped.
    ///
    /// Returns how many children were asked.
    pub async fn request_group_close(&self, group: Group) -> usize {
        let targets: Vec<(Target, ProcessHandle)> = {
            let inner = self.inner.read().await;
            match group {
                Group::Agents => inner
                    .agents
                    .records
                    .iter()
                    .map(|(name, r)| (Target::Agent { name: name.clone() }, r.handle.clone()))
                    .collect(),
                Group::Workers => inner
                    .workers
                    .records
                    .iter()
                    .map(|(pid, r)| (Target::Worker { pid: *pid }, r.handle.clone()))
                    .collect(),
            }
        };
        let close = match group {
            Group::Agents => Message::AgentClose,
            Group::Workers => Message::WorkerClose,
        };

        let mut asked = 0;
        for (target, handle) in targets {
            if handle.is_exited() {
                debug!(%target, "already exited, not signalling");
                continue;
            }
            if let Err(e) = self.signaller.signal(handle.pid(), Signal::SIGTERM) {
                debug!(%target, "SIGTERM not delivered: {}", e);
            }
            if let Err(e) = self.transport.send(target.clone(), close.clone()) {
                debug!(%target, "close instruction not delivered: {}", e);
            }
            asked += 1;
        }
        info!(%group, asked, "requested group close");
        asked
    }

    /// Wait until every child of a group has exited and been reaped
    pub async fn wait_group_empty(&self, group: Group) {
        self.wait_until(|inner| inner.all_gone(group).then_some(()))
            .await;
        info!(%group, "all exited");
    }

    /// SIGKILL every pid still tracked. Failures (already gone) are ignored.
    pub async fn force_kill_all(&self) -> usize {
        let pids = self.tracked_pids().await;
        for pid in &pids {
            info!(pid, "force killing");
            if let Err(e) = self.signaller.signal(*pid, Signal::SIGKILL) {
                debug!(pid, "force kill ignored: {}", e);
            }
        }
        pids.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::MemoryTransport;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSignaller {
        sent: Mutex<Vec<(u32, Signal)>>,
    }

    impl Signaller for RecordingSignaller {
        fn signal(&self, pid: u32, signal: Signal) -> crate::Result<()> {
            self.sent.lock().unwrap().push((pid, signal));
            Ok(())
        }
    }

    fn state() -> (Arc<ClusterState>, Arc<MemoryTransport>, Arc<RecordingSignaller>) {
        let (transport, _inbox) = MemoryTransport::pair();
        let signaller = Arc::new(RecordingSignaller::default());
        let state = Arc::new(ClusterState::new(transport.clone(), signaller.clone()));
        (state, transport, signaller)
    }

    async fn spawn_agent(state: &ClusterState, name: &str, pid: u32) -> ProcessHandle {
        let handle = ProcessHandle::new(pid);
        state.add_agent(name, handle.clone()).await;
        state.agent_forking(name).await;
        handle
    }

    async fn spawn_worker(state: &ClusterState, pid: u32) -> ProcessHandle {
        let handle = ProcessHandle::new(pid);
        state.add_worker(handle.clone()).await;
        state.worker_forking(pid).await;
        handle
    }

    #[tokio::test]
    async fn test_empty_group_is_ready_immediately() {
        let (state, _, _) = state();
        assert!(state.wait_group_status(Group::Agents, None).await);
        assert!(
            state
                .wait_group_status(Group::Workers, Some(Duration::from_millis(10)))
                .await
        );
    }

    #[tokio::test]
    async fn test_add_success_killed_round_trip() {
        let (state, _, _) = state();
        spawn_agent(&state, "x", 10).await;
        assert!(state.record_success(&Endpoint::agent("x")).await);
        state.agent_killed("x").await;

        assert_eq!(state.snapshot(Group::Agents).await.expected_total, 0);
        assert!(state.record(&Endpoint::agent("x")).await.is_none());
        assert!(state.tracked_pids().await.is_empty());
    }

    #[tokio::test]
    async fn test_group_ready_once_everyone_reports() {
        let (state, _, _) = state();
        spawn_agent(&state, "a", 1).await;
        spawn_agent(&state, "b", 2).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move {
                state
                    .wait_group_status(Group::Agents, Some(Duration::from_secs(1)))
                    .await
            })
        };
        state.record_success(&Endpoint::agent("a")).await;
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        state.record_success(&Endpoint::agent("b")).await;

        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_single_failure_fails_the_group_immediately() {
        let (state, _, _) = state();
        spawn_agent(&state, "a", 1).await;
        spawn_agent(&state, "b", 2).await;
        state
            .record_failure(&Endpoint::agent("a"), "boom")
            .await;

        // "b" is still pending; the failure short-circuits anyway.
        assert!(!state.wait_group_status(Group::Agents, None).await);
        assert_eq!(state.group_status(Group::Agents).await, GroupStatus::Failed);
    }

    #[tokio::test]
    async fn test_failure_is_monotonic() {
        let (state, _, _) = state();
        spawn_worker(&state, 1).await;
        spawn_worker(&state, 2).await;
        state.record_failure(&Endpoint::worker(1), "bad").await;
        state.record_success(&Endpoint::worker(2)).await;

        // The failed worker exits and a replacement becomes ready.
        state.worker_killed(1).await;
        spawn_worker(&state, 3).await;
        state.record_success(&Endpoint::worker(3)).await;

        assert_eq!(state.group_status(Group::Workers).await, GroupStatus::Failed);
        assert!(!state.wait_group_status(Group::Workers, None).await);
    }

    #[tokio::test]
    async fn test_status_is_one_way() {
        let (state, _, _) = state();
        spawn_agent(&state, "a", 1).await;
        assert!(state.record_success(&Endpoint::agent("a")).await);
        assert!(!state.record_failure(&Endpoint::agent("a"), "late").await);

        let record = state.record(&Endpoint::agent("a")).await.unwrap();
        assert_eq!(record.status, ChildStatus::Ready);
    }

    #[tokio::test]
    async fn test_unknown_children_are_ignored() {
        let (state, _, _) = state();
        assert!(!state.record_success(&Endpoint::worker(404)).await);
        assert!(!state.record_failure(&Endpoint::agent("ghost"), "x").await);
        assert!(!state.record_success(&Endpoint::Master).await);
        state.worker_killed(404).await;
        state.agent_killed("ghost").await;
        assert_eq!(state.snapshot(Group::Workers).await, GroupSnapshot::default());
    }

    #[tokio::test]
    async fn test_timeout_resolves_false() {
        let (state, _, _) = state();
        spawn_agent(&state, "slow", 1).await;
        let started = tokio::time::Instant::now();
        assert!(
            !state
                .wait_group_status(Group::Agents, Some(Duration::from_millis(50)))
                .await
        );
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_worker_waits_until_online_count_matches() {
        let (state, _, _) = state();
        // Ready before its connection was counted: ready 1, expected 0.
        state.add_worker(ProcessHandle::new(5)).await;
        assert_eq!(state.snapshot(Group::Workers).await.expected_total, 0);
        state.record_success(&Endpoint::worker(5)).await;
        assert_eq!(state.group_status(Group::Workers).await, GroupStatus::Starting);

        // A second worker pending keeps the group starting.
        spawn_worker(&state, 6).await;
        assert_eq!(state.group_status(Group::Workers).await, GroupStatus::Starting);
        state.record_success(&Endpoint::worker(6)).await;
        state.worker_forking(5).await;
        assert_eq!(state.group_status(Group::Workers).await, GroupStatus::Ready);
        assert_eq!(state.snapshot(Group::Workers).await.expected_total, 2);
    }

    #[tokio::test]
    async fn test_uncounted_worker_exit_keeps_total() {
        let (state, _, _) = state();
        spawn_worker(&state, 1).await;
        state.add_worker(ProcessHandle::new(2)).await;
        state.worker_killed(2).await;
        assert_eq!(state.snapshot(Group::Workers).await.expected_total, 1);
    }

    #[tokio::test]
    async fn test_request_close_skips_exited_children() {
        let (state, transport, signaller) = state();
        spawn_worker(&state, 1).await;
        let dead = spawn_worker(&state, 2).await;
        dead.mark_exited();

        assert_eq!(state.request_group_close(Group::Workers).await, 1);

        let signals = signaller.sent.lock().unwrap().clone();
        assert_eq!(signals, vec![(1, Signal::SIGTERM)]);
        assert_eq!(
            transport.sent(),
            vec![(Target::Worker { pid: 1 }, Message::WorkerClose)]
        );
    }

    #[tokio::test]
    async fn test_request_close_on_agents() {
        let (state, transport, signaller) = state();
        spawn_agent(&state, "a", 11).await;

        assert_eq!(state.request_group_close(Group::Agents).await, 1);
        assert_eq!(
            signaller.sent.lock().unwrap().clone(),
            vec![(11, Signal::SIGTERM)]
        );
        assert_eq!(
            transport.sent(),
            vec![(Target::Agent { name: "a".into() }, Message::AgentClose)]
        );
    }

    #[tokio::test]
    async fn test_wait_group_empty_resolves_on_last_exit() {
        let (state, _, _) = state();
        spawn_worker(&state, 1).await;
        spawn_worker(&state, 2).await;

        let waiter = {
            let state = state.clone();
            tokio::spawn(async move { state.wait_group_empty(Group::Workers).await })
        };
        state.worker_killed(1).await;
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        state.worker_killed(2).await;
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_force_kill_covers_both_groups() {
        let (state, _, signaller) = state();
        spawn_agent(&state, "a", 1).await;
        spawn_worker(&state, 2).await;
        spawn_worker(&state, 3).await;
        state.worker_killed(3).await;

        assert_eq!(state.force_kill_all().await, 2);
        let signals = signaller.sent.lock().unwrap().clone();
        assert_eq!(signals, vec![(1, Signal::SIGKILL), (2, Signal::SIGKILL)]);
    }

    #[tokio::test]
    async fn test_agent_extra_collection() {
        let (state, _, _) = state();
        spawn_agent(&state, "a", 1).await;
        spawn_agent(&state, "b", 2).await;
        state.record_agent_extra("a", serde_json::json!(1)).await;
        assert!(
            !state
                .wait_agent_extra(Some(Duration::from_millis(20)))
                .await
        );
        state.record_agent_extra("b", serde_json::json!(2)).await;
        assert!(state.wait_agent_extra(None).await);
        assert_eq!(state.agent_extra().await.len(), 2);
    }
}
