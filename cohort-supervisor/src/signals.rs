//! OS termination signals
//!
//! Both the master and every child listen for:
//! - **SIGTERM** (default kill signal, also what the master sends children)
//! - **SIGINT** (Ctrl-C in terminal)
//! - **SIGQUIT** (quit signal)

use futures::Stream;
use tokio::signal::unix::{Signal, SignalKind, signal};

/// Termination signal received by the process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShutdownSignal {
    Terminate,
    Interrupt,
    Quit,
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Quit => write!(f, "SIGQUIT"),
        }
    }
}

/// Registered termination signal listeners.
///
/// Once created, the signals no longer terminate the process by default;
/// delivery is observed through [`ShutdownSignals::recv`] instead.
pub struct ShutdownSignals {
    sigterm: Signal,
    sigint: Signal,
    sigquit: Signal,
}

impl ShutdownSignals {
    /// Register listeners for SIGTERM, SIGINT and SIGQUIT
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigterm: signal(SignalKind::terminate())?,
            sigint: signal(SignalKind::interrupt())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Wait for the next termination signal
    pub async fn recv(&mut self) -> Option<ShutdownSignal> {
        tokio::select! {
            s = self.sigterm.recv() => s.map(|_| ShutdownSignal::Terminate),
            s = self.sigint.recv() => s.map(|_| ShutdownSignal::Interrupt),
            s = self.sigquit.recv() => s.map(|_| ShutdownSignal::Quit),
        }
    }

    /// Turn the listeners into a stream of signals
    pub fn into_stream(self) -> impl Stream<Item = ShutdownSignal> + Send {
        futures::stream::unfold(self, |mut signals| async move {
            signals.recv().await.map(|signal| (signal, signals))
        })
    }
}
