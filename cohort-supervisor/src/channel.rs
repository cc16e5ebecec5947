//! Message transport between the master and its children
//!
//! The master owns a [`ChannelHub`]: a Unix domain socket in a private
//! temporary directory whose path children receive in `COHORT_IPC_SOCKET`.
//! Each child connects with a [`ChildLink`] and introduces itself with an
//! `ipc:hello` line. Messages are newline-delimited JSON [`Envelope`]s.
//!
//! Everything addressed to the master lands in the hub's inbox; anything a
//! child addresses to another child or group is relayed. Messages for a
//! child the master announced but that has not connected yet are buffered
//! (up to [`PENDING_LIMIT`] per child) until it does; a worker's claimed pid
//! is checked against the connecting process.

use crate::{Result, SupervisorError};
use cohort_core::{Endpoint, Envelope, IPC_SOCKET_ENV, Message, Target};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Messages kept for one announced child that has not connected yet
pub const PENDING_LIMIT: usize = 256;

/// Outbound side of a channel
pub trait Transport: Send + Sync {
    /// Send a message to one endpoint or a whole group.
    ///
    /// Best-effort: an error means the message was definitely not queued.
    fn send(&self, to: Target, message: Message) -> Result<()>;

    /// Environment a child process needs to reach this transport
    fn child_env(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Expect a child to connect as `endpoint`
    fn announce(&self, _endpoint: &Endpoint) {}

    /// Drop anything still buffered for an endpoint that is gone
    fn forget(&self, _endpoint: &Endpoint) {}
}

/// Event delivered to the master's inbox
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// A child completed its handshake
    Connected(Endpoint),
    /// A child's connection closed
    Disconnected(Endpoint),
    /// A message addressed to the master
    Message(Envelope),
}

#[derive(Default)]
struct PeerTable {
    peers: HashMap<Endpoint, mpsc::UnboundedSender<Envelope>>,
    pending: HashMap<Endpoint, Vec<Envelope>>,
    announced: HashSet<Endpoint>,
}

impl PeerTable {
    fn register(&mut self, endpoint: Endpoint, tx: mpsc::UnboundedSender<Envelope>) {
        if let Some(buffered) = self.pending.remove(&endpoint) {
            debug!(%endpoint, count = buffered.len(), "flushing buffered messages");
            for envelope in buffered {
                let _ = tx.send(envelope);
            }
        }
        self.peers.insert(endpoint, tx);
    }

    fn unregister(&mut self, endpoint: &Endpoint, tx: &mpsc::UnboundedSender<Envelope>) {
        if self
            .peers
            .get(endpoint)
            .is_some_and(|current| current.same_channel(tx))
        {
            self.peers.remove(endpoint);
        }
    }

    fn route(&mut self, envelope: Envelope) -> Result<()> {
        match envelope.to.endpoint() {
            Some(Endpoint::Master) => Err(SupervisorError::Transport(
                "the hub cannot route messages to the master".to_string(),
            )),
            Some(endpoint) => match self.peers.get(&endpoint) {
                Some(tx) => tx.send(envelope).map_err(|_| {
                    SupervisorError::Transport(format!("{} is disconnected", endpoint))
                }),
                None if self.announced.contains(&endpoint) => {
                    let queue = self.pending.entry(endpoint.clone()).or_default();
                    if queue.len() >= PENDING_LIMIT {
                        return Err(SupervisorError::Transport(format!(
                            "{} has {} undelivered messages",
                            endpoint, PENDING_LIMIT
                        )));
                    }
                    queue.push(envelope);
                    Ok(())
                }
                None => Err(SupervisorError::Transport(format!(
                    "{} is not connected",
                    endpoint
                ))),
            },
            None => {
                for (endpoint, tx) in &self.peers {
                    if envelope.to.matches(endpoint) && tx.send(envelope.clone()).is_err() {
                        debug!(%endpoint, "skipping disconnected peer");
                    }
                }
                Ok(())
            }
        }
    }
}

fn lock(table: &Mutex<PeerTable>) -> MutexGuard<'_, PeerTable> {
    table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Master side of the channel
pub struct ChannelHub {
    _dir: TempDir,
    path: PathBuf,
    table: Arc<Mutex<PeerTable>>,
    accept: JoinHandle<()>,
}

impl ChannelHub {
    /// Bind a fresh socket and start accepting children.
    ///
    /// Must be called inside a tokio runtime. Returns the hub and the inbox
    /// the master consumes.
    pub fn bind() -> Result<(Self, mpsc::UnboundedReceiver<Inbound>)> {
        let dir = tempfile::Builder::new().prefix("cohort-").tempdir()?;
        let path = dir.path().join("master.sock");
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "channel hub listening");

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let table = Arc::new(Mutex::new(PeerTable::default()));
        let accept = tokio::spawn(accept_loop(listener, table.clone(), inbox_tx));

        Ok((
            Self {
                _dir: dir,
                path,
                table,
                accept,
            },
            inbox_rx,
        ))
    }

    /// Path of the listening socket
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Endpoints currently connected
    pub fn connected(&self) -> Vec<Endpoint> {
        lock(&self.table).peers.keys().cloned().collect()
    }
}

impl Drop for ChannelHub {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

impl Transport for ChannelHub {
    fn send(&self, to: Target, message: Message) -> Result<()> {
        let envelope = Envelope::new(Endpoint::Master, to, message)?;
        lock(&self.table).route(envelope)
    }

    fn child_env(&self) -> Vec<(String, String)> {
        vec![(
            IPC_SOCKET_ENV.to_string(),
            self.path.display().to_string(),
        )]
    }

    fn announce(&self, endpoint: &Endpoint) {
        lock(&self.table).announced.insert(endpoint.clone());
    }

    fn forget(&self, endpoint: &Endpoint) {
        let mut table = lock(&self.table);
        table.pending.remove(endpoint);
        table.announced.remove(endpoint);
    }
}

async fn accept_loop(
    listener: UnixListener,
    table: Arc<Mutex<PeerTable>>,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::spawn(serve_connection(stream, table.clone(), inbox.clone()));
            }
            Err(e) => {
                warn!("failed to accept child connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }
    }
}

async fn serve_connection(
    stream: UnixStream,
    table: Arc<Mutex<PeerTable>>,
    inbox: mpsc::UnboundedSender<Inbound>,
) {
    let peer_pid = stream.peer_cred().ok().and_then(|cred| cred.pid());
    let (read, write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    let endpoint = match lines.next_line().await {
        Ok(Some(line)) => match Envelope::from_line(&line) {
            Ok(hello) if hello.message().ok() == Some(Message::Hello) => hello.from,
            Ok(other) => {
                warn!(action = %other.action, "connection did not start with a handshake");
                return;
            }
            Err(e) => {
                warn!("invalid handshake: {}", e);
                return;
            }
        },
        Ok(None) => return,
        Err(e) => {
            warn!("failed to read handshake: {}", e);
            return;
        }
    };
    if endpoint == Endpoint::Master {
        warn!("rejecting a child that claims to be the master");
        return;
    }
    if let (Endpoint::Worker { pid }, Some(peer)) = (&endpoint, peer_pid) {
        if u32::try_from(peer).ok() != Some(*pid) {
            warn!(%endpoint, peer, "rejecting a worker whose pid does not match its connection");
            return;
        }
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write, rx));
    lock(&table).register(endpoint.clone(), tx.clone());
    debug!(%endpoint, "child connected");
    let _ = inbox.send(Inbound::Connected(endpoint.clone()));

    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => {
                let mut envelope = match Envelope::from_line(&line) {
                    Ok(envelope) => envelope,
                    Err(e) => {
                        warn!(%endpoint, "dropping message: {}", e);
                        continue;
                    }
                };
                // The connection, not the payload, decides who is talking.
                envelope.from = endpoint.clone();
                if envelope.to == Target::Master {
                    let _ = inbox.send(Inbound::Message(envelope));
                } else if let Err(e) = lock(&table).route(envelope) {
                    debug!(%endpoint, "relay failed: {}", e);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(%endpoint, "connection error: {}", e);
                break;
            }
        }
    }

    lock(&table).unregister(&endpoint, &tx);
    drop(tx);
    let _ = writer.await;
    debug!(%endpoint, "child disconnected");
    let _ = inbox.send(Inbound::Disconnected(endpoint));
}

async fn write_loop(mut write: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(envelope) = rx.recv().await {
        let line = match envelope.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode message: {}", e);
                continue;
            }
        };
        if let Err(e) = write.write_all(format!("{}\n", line).as_bytes()).await {
            debug!("peer write failed: {}", e);
            break;
        }
    }
}

/// Child side of the channel
pub struct ChildLink {
    me: Endpoint,
    writer: mpsc::UnboundedSender<Envelope>,
    tasks: Vec<JoinHandle<()>>,
}

impl ChildLink {
    /// Connect to the master's socket and send the handshake.
    ///
    /// Returns the link and a receiver of inbound envelopes; the receiver
    /// closes when the master goes away.
    pub async fn connect(
        path: &Path,
        me: Endpoint,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let stream = UnixStream::connect(path).await.map_err(|e| {
            SupervisorError::Transport(format!("cannot reach master at {}: {}", path.display(), e))
        })?;
        let (read, write) = stream.into_split();

        let (writer, outbound) = mpsc::unbounded_channel();
        writer
            .send(Envelope::new(me.clone(), Target::Master, Message::Hello)?)
            .map_err(|_| SupervisorError::Transport("link closed".to_string()))?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match Envelope::from_line(&line) {
                    Ok(envelope) => {
                        if inbound_tx.send(envelope).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("dropping message from master: {}", e),
                }
            }
        });
        let writer_task = tokio::spawn(write_loop(write, outbound));

        Ok((
            Self {
                me,
                writer,
                tasks: vec![reader, writer_task],
            },
            inbound_rx,
        ))
    }

    /// Connect using the socket path from `COHORT_IPC_SOCKET`
    pub async fn connect_from_env(me: Endpoint) -> Result<(Self, mpsc::UnboundedReceiver<Envelope>)> {
        let path = std::env::var(IPC_SOCKET_ENV).map_err(|_| {
            SupervisorError::Transport(format!("{} is not set; was this process started by a cohort master?", IPC_SOCKET_ENV))
        })?;
        Self::connect(Path::new(&path), me).await
    }

    /// This side's identity
    pub fn endpoint(&self) -> &Endpoint {
        &self.me
    }
}

impl Drop for ChildLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl Transport for ChildLink {
    fn send(&self, to: Target, message: Message) -> Result<()> {
        let envelope = Envelope::new(self.me.clone(), to, message)?;
        self.writer
            .send(envelope)
            .map_err(|_| SupervisorError::Transport("link to master is closed".to_string()))
    }
}

/// In-memory transport for testing.
///
/// Records everything sent through it and lets a test inject inbound events
/// as if they came from children.
pub struct MemoryTransport {
    sent: Mutex<Vec<(Target, Message)>>,
    announced: Mutex<HashSet<Endpoint>>,
    count: watch::Sender<usize>,
    inbox: mpsc::UnboundedSender<Inbound>,
}

impl MemoryTransport {
    /// Create a transport and the inbox a master would consume
    pub fn pair() -> (Arc<Self>, mpsc::UnboundedReceiver<Inbound>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        let (count, _) = watch::channel(0);
        (
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                announced: Mutex::new(HashSet::new()),
                count,
                inbox,
            }),
            rx,
        )
    }

    /// Inject a message from `from` addressed to the master
    pub fn deliver(&self, from: Endpoint, message: Message) {
        if let Ok(envelope) = Envelope::new(from, Target::Master, message) {
            let _ = self.inbox.send(Inbound::Message(envelope));
        }
    }

    /// Inject a completed handshake
    pub fn connect(&self, endpoint: Endpoint) {
        let _ = self.inbox.send(Inbound::Connected(endpoint));
    }

    /// Everything sent so far
    pub fn sent(&self) -> Vec<(Target, Message)> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Whether `endpoint` was announced and not forgotten since
    pub fn is_announced(&self, endpoint: &Endpoint) -> bool {
        self.announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(endpoint)
    }

    /// Wait until a sent message matches `predicate`
    pub async fn wait_for<F>(&self, predicate: F) -> (Target, Message)
    where
        F: Fn(&Target, &Message) -> bool,
    {
        let mut changes = self.count.subscribe();
        loop {
            if let Some(found) = self
                .sent()
                .into_iter()
                .find(|(target, message)| predicate(target, message))
            {
                return found;
            }
            if changes.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn send(&self, to: Target, message: Message) -> Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((to, message));
        self.count.send_modify(|n| *n += 1);
        Ok(())
    }

    fn announce(&self, endpoint: &Endpoint) {
        self.announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(endpoint.clone());
    }

    fn forget(&self, endpoint: &Endpoint) {
        self.announced
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(endpoint);
    }
}
