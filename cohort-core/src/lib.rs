//! # Cohort core
//!
//! Shared vocabulary of the cohort process-cluster supervisor:
//! - **Configuration**: [`ClusterConfig`], loaded with figment and validated
//!   before a master starts
//! - **Errors**: [`ClusterError`]
//! - **Protocol**: the [`Envelope`]/[`Message`] pair exchanged between the
//!   master and its agent and worker processes
//! - **Child arguments**: [`ChildArgs`] and [`Role`]
//!
//! The supervisor itself lives in `cohort-supervisor`.

pub mod args;
pub mod config;
pub mod error;
pub mod message;

pub use args::{ChildArgs, Role, DEBUG_FLAGS_ENV, IPC_SOCKET_ENV};
pub use config::{ClusterConfig, ConfigBuilder};
pub use error::{ClusterError, Result};
pub use message::{actions, Endpoint, Envelope, Message, Target};

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
