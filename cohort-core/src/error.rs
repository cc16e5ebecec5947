//! Error types for cohort operations

/// Result type for cohort operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Error types shared by every cohort crate
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Invalid or missing configuration (fatal, raised before anything starts)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed IPC message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Child startup arguments could not be understood
    #[error("Invalid child arguments: {0}")]
    Arguments(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for ClusterError {
    fn from(s: String) -> Self {
        ClusterError::Other(s)
    }
}

impl From<&str> for ClusterError {
    fn from(s: &str) -> Self {
        ClusterError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ClusterError {
    fn from(err: anyhow::Error) -> Self {
        ClusterError::Other(err.to_string())
    }
}

impl From<figment::Error> for ClusterError {
    fn from(err: figment::Error) -> Self {
        ClusterError::Configuration(format!("Failed to load configuration: {}", err))
    }
}
