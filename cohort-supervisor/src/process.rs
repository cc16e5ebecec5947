//! Process spawning and signalling

use crate::{Result, SupervisorError};
use cohort_core::Role;
use futures::future::{BoxFuture, FutureExt};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, warn};

/// Handle to a spawned child process.
///
/// Owned by the master; cloned into the cluster state so shutdown can
/// signal the child and skip it once it has exited.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
struct HandleInner {
    pid: u32,
    exited: AtomicBool,
}

impl ProcessHandle {
    pub fn new(pid: u32) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                pid,
                exited: AtomicBool::new(false),
            }),
        }
    }

    /// OS process ID
    pub fn pid(&self) -> u32 {
        self.inner.pid
    }

    /// Whether the process has been reaped
    pub fn is_exited(&self) -> bool {
        self.inner.exited.load(Ordering::Acquire)
    }

    /// Record that the process has been reaped
    pub fn mark_exited(&self) {
        self.inner.exited.store(true, Ordering::Release);
    }
}

/// Sends OS signals to processes
pub trait Signaller: Send + Sync {
    fn signal(&self, pid: u32, signal: Signal) -> Result<()>;
}

/// [`Signaller`] backed by `kill(2)`
#[derive(Debug, Clone, Copy, Default)]
pub struct NixSignaller;

impl Signaller for NixSignaller {
    fn signal(&self, pid: u32, signal: Signal) -> Result<()> {
        let raw = i32::try_from(pid)
            .map_err(|_| SupervisorError::Signal(format!("pid {} out of range", pid)))?;
        kill(Pid::from_raw(raw), signal).map_err(|e| {
            SupervisorError::Signal(format!("failed to send {} to {}: {}", signal, pid, e))
        })
    }
}

/// The master's own command line, split for its children.
///
/// Arguments starting with `--inspect` are runtime debug flags: they are
/// handed to children through `COHORT_DEBUG_FLAGS` instead of their argv.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessArgv {
    pub args: Vec<String>,
    pub debug_flags: Vec<String>,
}

impl ProcessArgv {
    pub fn partition<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (debug_flags, args) = argv
            .into_iter()
            .map(Into::into)
            .partition(|arg: &String| arg.starts_with("--inspect"));
        Self { args, debug_flags }
    }

    /// Split the current process arguments
    pub fn from_env() -> Self {
        Self::partition(std::env::args().skip(1))
    }
}

/// Everything needed to start one child
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub role: Role,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub envs: Vec<(String, String)>,
}

/// A started child: its handle plus a future resolving with its exit code
/// once it has been reaped (`None` when it was killed by a signal)
pub struct LaunchedChild {
    pub handle: ProcessHandle,
    pub exit: BoxFuture<'static, Option<i32>>,
}

/// Starts child processes
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: LaunchSpec) -> Result<LaunchedChild>;
}

/// [`Launcher`] that execs the framework entry as an OS process
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl Launcher for ProcessLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<LaunchedChild> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(false);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Spawn {
            role: spec.role.to_string(),
            reason: format!("{}: {}", spec.program.display(), e),
        })?;

        let pid = child.id().ok_or_else(|| SupervisorError::Spawn {
            role: spec.role.to_string(),
            reason: "process exited before its pid could be read".to_string(),
        })?;
        debug!(pid, role = %spec.role, program = %spec.program.display(), "spawned child");

        let exit = async move {
            match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!(pid, "failed to wait for child: {}", e);
                    None
                }
            }
        }
        .boxed();

        Ok(LaunchedChild {
            handle: ProcessHandle::new(pid),
            exit,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inspect_flags_are_split_out() {
        let argv = ProcessArgv::partition([
            "--port=8080",
            "--inspect",
            "serve",
            "--inspect-brk=9229",
        ]);
        assert_eq!(argv.args, vec!["--port=8080", "serve"]);
        assert_eq!(argv.debug_flags, vec!["--inspect", "--inspect-brk=9229"]);
    }

    #[test]
    fn test_handle_exit_latch_is_shared() {
        let handle = ProcessHandle::new(7);
        let clone = handle.clone();
        assert!(!clone.is_exited());
        handle.mark_exited();
        assert!(clone.is_exited());
        assert_eq!(clone.pid(), 7);
    }

    #[test]
    fn test_signalling_a_missing_pid_is_an_error_not_a_panic() {
        // Far above any default pid_max.
        let result = NixSignaller.signal(i32::MAX as u32, Signal::SIGTERM);
        assert!(matches!(result, Err(SupervisorError::Signal(_))));
    }

    #[tokio::test]
    async fn test_launcher_reports_exit_code() {
        let launched = ProcessLauncher
            .launch(LaunchSpec {
                role: Role::Worker,
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".into(), "exit 3".into()],
                cwd: std::env::temp_dir(),
                envs: Vec::new(),
            })
            .unwrap();
        assert!(launched.handle.pid() > 0);
        assert_eq!(launched.exit.await, Some(3));
    }

    #[test]
    fn test_launch_of_missing_program_fails() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = rt.enter();
        let err = ProcessLauncher
            .launch(LaunchSpec {
                role: Role::Agent,
                program: PathBuf::from("/definitely/not/a/program"),
                args: Vec::new(),
                cwd: std::env::temp_dir(),
                envs: Vec::new(),
            })
            .err()
            .unwrap();
        assert!(matches!(err, SupervisorError::Spawn { .. }));
    }
}
