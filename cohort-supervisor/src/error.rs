//! Error types for supervisor operations

use thiserror::Error;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for supervisor
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Cluster(#[from] cohort_core::ClusterError),

    #[error("Failed to spawn {role} process: {reason}")]
    Spawn { role: String, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Signal error: {0}")]
    Signal(String),

    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    #[error("Group startup timeout")]
    StartupTimeout,

    #[error("Shutdown timeout")]
    ShutdownTimeout,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for SupervisorError {
    fn from(err: serde_json::Error) -> Self {
        SupervisorError::Cluster(err.into())
    }
}
