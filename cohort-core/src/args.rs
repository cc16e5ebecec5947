//! Child process roles and startup arguments
//!
//! The master starts every child with a small set of reserved `--key=value`
//! flags followed by the pass-through arguments the master itself received.

use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;

/// Environment variable carrying the master's IPC socket path
pub const IPC_SOCKET_ENV: &str = "COHORT_IPC_SOCKET";

/// Environment variable carrying runtime debug flags (`--inspect*` arguments)
pub const DEBUG_FLAGS_ENV: &str = "COHORT_DEBUG_FLAGS";

const CWD_FLAG: &str = "--cwd=";
const FRAMEWORK_FLAG: &str = "--framework=";
const AGENT_NAME_FLAG: &str = "--agent-name=";
const AGENT_EXTRA_FLAG: &str = "--agent-extra=";

/// Kind of child process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Named auxiliary process, started before workers, never respawned
    Agent,
    /// Member of the homogeneous worker pool, respawned on exit
    Worker,
}

impl Role {
    /// File name of the framework executable for this role
    pub fn entry_name(&self) -> &'static str {
        match self {
            Role::Agent => "agent",
            Role::Worker => "worker",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Agent => write!(f, "agent"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// Arguments a child process is started with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChildArgs {
    /// Project working directory
    pub cwd: Option<PathBuf>,
    /// Framework directory
    pub framework: Option<PathBuf>,
    /// Agent name (agents only)
    pub agent_name: Option<String>,
    /// Extra data published by every agent, keyed by agent name (workers only)
    pub agent_extra: Map<String, Value>,
    /// Everything else, in order
    pub passthrough: Vec<String>,
}

impl ChildArgs {
    /// Arguments for an agent
    pub fn agent(
        cwd: impl Into<PathBuf>,
        name: impl Into<String>,
        framework: impl Into<PathBuf>,
        passthrough: Vec<String>,
    ) -> Self {
        Self {
            cwd: Some(cwd.into()),
            framework: Some(framework.into()),
            agent_name: Some(name.into()),
            agent_extra: Map::new(),
            passthrough,
        }
    }

    /// Arguments for a worker
    pub fn worker(
        cwd: impl Into<PathBuf>,
        framework: impl Into<PathBuf>,
        agent_extra: Map<String, Value>,
        passthrough: Vec<String>,
    ) -> Self {
        Self {
            cwd: Some(cwd.into()),
            framework: Some(framework.into()),
            agent_name: None,
            agent_extra,
            passthrough,
        }
    }

    /// Role implied by the arguments
    pub fn role(&self) -> Role {
        if self.agent_name.is_some() {
            Role::Agent
        } else {
            Role::Worker
        }
    }

    /// Render as a command line (without the program name)
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.passthrough.len() + 4);
        if let Some(cwd) = &self.cwd {
            args.push(format!("{}{}", CWD_FLAG, cwd.display()));
        }
        if let Some(name) = &self.agent_name {
            args.push(format!("{}{}", AGENT_NAME_FLAG, name));
        }
        if let Some(framework) = &self.framework {
            args.push(format!("{}{}", FRAMEWORK_FLAG, framework.display()));
        }
        if self.agent_name.is_none() {
            args.push(format!(
                "{}{}",
                AGENT_EXTRA_FLAG,
                Value::Object(self.agent_extra.clone())
            ));
        }
        args.extend(self.passthrough.iter().cloned());
        args
    }

    /// Parse a command line (without the program name).
    ///
    /// Reserved flags are only recognised before the first other argument;
    /// from there on everything is pass-through.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut parsed = ChildArgs::default();
        let mut reserved = true;

        for arg in args.into_iter().map(Into::into) {
            if reserved {
                if let Some(v) = arg.strip_prefix(CWD_FLAG) {
                    parsed.cwd = Some(PathBuf::from(v));
                    continue;
                }
                if let Some(v) = arg.strip_prefix(FRAMEWORK_FLAG) {
                    parsed.framework = Some(PathBuf::from(v));
                    continue;
                }
                if let Some(v) = arg.strip_prefix(AGENT_NAME_FLAG) {
                    if v.is_empty() {
                        return Err(ClusterError::Arguments("empty agent name".to_string()));
                    }
                    parsed.agent_name = Some(v.to_string());
                    continue;
                }
                if let Some(v) = arg.strip_prefix(AGENT_EXTRA_FLAG) {
                    parsed.agent_extra = match serde_json::from_str::<Value>(v) {
                        Ok(Value::Object(map)) => map,
                        Ok(Value::Null) => Map::new(),
                        Ok(other) => {
                            return Err(ClusterError::Arguments(format!(
                                "agent extra data must be a JSON object, got {}",
                                other
                            )));
                        }
                        Err(e) => {
                            return Err(ClusterError::Arguments(format!(
                                "agent extra data is not valid JSON: {}",
                                e
                            )));
                        }
                    };
                    continue;
                }
                reserved = false;
            }
            parsed.passthrough.push(arg);
        }

        Ok(parsed)
    }

    /// Parse the current process arguments
    pub fn from_env() -> Result<Self> {
        Self::parse(std::env::args().skip(1))
    }
}
