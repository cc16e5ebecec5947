//! Configuration types for cohort clusters

use crate::args::Role;
use crate::error::{ClusterError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Name of the configuration file looked up in the current directory
pub const CONFIG_FILE: &str = "cohort.toml";

/// Environment variable naming an additional configuration file
pub const CONFIG_PATH_ENV: &str = "COHORT_CONFIG_PATH";

/// Cluster configuration.
///
/// Built programmatically with [`ConfigBuilder`] or loaded with
/// [`ClusterConfig::load`], then checked with [`ClusterConfig::resolve`]
/// before a master is allowed to start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Project working directory (must be absolute)
    #[serde(default = "default_cwd")]
    pub cwd: PathBuf,

    /// Names of the agents to start, in order
    #[serde(default)]
    pub agents: Vec<String>,

    /// Worker pool size (0 means one per CPU)
    #[serde(default)]
    pub max_workers: usize,

    /// Startup timeout per group (unbounded when absent)
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Deadline for the graceful part of shutdown before force killing
    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Framework directory providing the `agent` and `worker` executables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<PathBuf>,
}

fn default_cwd() -> PathBuf {
    std::env::current_dir().unwrap_or_default()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cwd: default_cwd(),
            agents: Vec::new(),
            max_workers: 0,
            timeout: None,
            shutdown_timeout: default_shutdown_timeout(),
            framework: None,
        }
    }
}

impl ClusterConfig {
    /// Start building a configuration
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. `cohort.toml` in the current directory
    /// 3. The file named by `COHORT_CONFIG_PATH`, if set
    /// 4. `COHORT_*` environment variable overrides
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file is invalid.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Same as [`ClusterConfig::load`], with an explicit file layered after
    /// `cohort.toml`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Toml},
        };

        let mut figment = Figment::new().merge(Toml::file(CONFIG_FILE));

        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            debug!(%path, "layering configuration from {}", CONFIG_PATH_ENV);
            figment = figment.merge(Toml::file(path));
        }
        if let Some(path) = path {
            if !path.exists() {
                return Err(ClusterError::Configuration(format!(
                    "configuration file not found: {}",
                    path.display()
                )));
            }
            figment = figment.merge(Toml::file(path));
        }

        let config: ClusterConfig = figment
            .merge(Env::prefixed("COHORT_").only(&[
                "cwd",
                "agents",
                "max_workers",
                "timeout",
                "shutdown_timeout",
                "framework",
            ]))
            .extract()?;

        Ok(config)
    }

    /// Validate and normalize the configuration.
    ///
    /// Fails fast when the working directory is not absolute, agent names are
    /// empty or duplicated, or the framework directory or one of its entry
    /// executables cannot be found. Relative framework paths are resolved
    /// against `cwd`, and a zero worker count becomes one worker per CPU.
    pub fn resolve(mut self) -> Result<Self> {
        if !self.cwd.is_absolute() {
            return Err(ClusterError::Configuration(format!(
                "cwd must be an absolute path: {}",
                self.cwd.display()
            )));
        }

        let mut seen = HashSet::new();
        for name in &self.agents {
            if name.trim().is_empty() {
                return Err(ClusterError::Configuration(
                    "agent names cannot be empty".to_string(),
                ));
            }
            if !seen.insert(name.as_str()) {
                return Err(ClusterError::Configuration(format!(
                    "agent `{}` is configured more than once",
                    name
                )));
            }
        }

        if self.max_workers == 0 {
            self.max_workers = default_max_workers();
            debug!(max_workers = self.max_workers, "worker count defaults to CPU count");
        }

        let framework = self.framework.take().ok_or_else(|| {
            ClusterError::Configuration(
                "framework is not set; point it at the directory holding the `agent` and `worker` executables"
                    .to_string(),
            )
        })?;
        let framework: PathBuf = if framework.is_absolute() {
            framework
        } else {
            self.cwd.join(framework)
        }
        .components()
        .collect();

        if !framework.is_dir() {
            return Err(ClusterError::Configuration(format!(
                "can not find the framework directory: {}",
                framework.display()
            )));
        }
        for role in [Role::Worker, Role::Agent] {
            let entry = framework.join(role.entry_name());
            if !entry.is_file() {
                return Err(ClusterError::Configuration(format!(
                    "can not find the framework {} entry: {}",
                    role,
                    entry.display()
                )));
            }
        }

        self.framework = Some(framework);
        Ok(self)
    }

    /// Framework directory, once resolved
    pub fn framework_dir(&self) -> Result<&Path> {
        self.framework.as_deref().ok_or_else(|| {
            ClusterError::Configuration("framework is not set".to_string())
        })
    }

    /// Executable started for the given role
    pub fn entry(&self, role: Role) -> Result<PathBuf> {
        Ok(self.framework_dir()?.join(role.entry_name()))
    }
}

/// Builder for ClusterConfig
pub struct ConfigBuilder {
    config: ClusterConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self {
            config: ClusterConfig::default(),
        }
    }

    /// Set the working directory
    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.config.cwd = cwd.into();
        self
    }

    /// Add one agent
    pub fn agent(mut self, name: impl Into<String>) -> Self {
        self.config.agents.push(name.into());
        self
    }

    /// Replace the agent list
    pub fn agents<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.agents = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the worker pool size
    pub fn max_workers(mut self, n: usize) -> Self {
        self.config.max_workers = n;
        self
    }

    /// Set the startup timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set the graceful shutdown deadline
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the framework directory
    pub fn framework(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.framework = Some(path.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> ClusterConfig {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn framework() -> TempDir {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("agent"), b"").unwrap();
        std::fs::write(dir.path().join("worker"), b"").unwrap();
        dir
    }

    #[test]
    fn test_resolve_accepts_complete_config() {
        let fw = framework();
        let config = ClusterConfig::builder()
            .cwd(fw.path())
            .agents(["a", "b"])
            .max_workers(2)
            .framework(fw.path())
            .build()
            .resolve()
            .unwrap();

        assert_eq!(config.max_workers, 2);
        assert_eq!(config.entry(Role::Agent).unwrap(), fw.path().join("agent"));
        assert_eq!(config.entry(Role::Worker).unwrap(), fw.path().join("worker"));
    }

    #[test]
    fn test_relative_cwd_is_rejected() {
        let err = ClusterConfig::builder()
            .cwd("relative/dir")
            .framework("/tmp")
            .build()
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(msg) if msg.contains("absolute")));
    }

    #[test]
    fn test_relative_framework_resolves_against_cwd() {
        let root = TempDir::new().unwrap();
        let fw = root.path().join("app");
        std::fs::create_dir(&fw).unwrap();
        std::fs::write(fw.join("agent"), b"").unwrap();
        std::fs::write(fw.join("worker"), b"").unwrap();

        let config = ClusterConfig::builder()
            .cwd(root.path())
            .framework("./app")
            .build()
            .resolve()
            .unwrap();
        assert_eq!(config.framework_dir().unwrap(), fw.as_path());
    }

    #[test]
    fn test_missing_entry_is_rejected() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("worker"), b"").unwrap();

        let err = ClusterConfig::builder()
            .cwd(dir.path())
            .framework(dir.path())
            .build()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("agent entry"));
    }

    #[test]
    fn test_missing_framework_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = ClusterConfig::builder()
            .cwd(dir.path())
            .build()
            .resolve()
            .unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));

        let err = ClusterConfig::builder()
            .cwd(dir.path())
            .framework(dir.path().join("nope"))
            .build()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("framework directory"));
    }

    #[test]
    fn test_duplicate_agents_are_rejected() {
        let fw = framework();
        let err = ClusterConfig::builder()
            .cwd(fw.path())
            .agents(["a", "a"])
            .framework(fw.path())
            .build()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_zero_workers_defaults_to_cpu_count() {
        let fw = framework();
        let config = ClusterConfig::builder()
            .cwd(fw.path())
            .framework(fw.path())
            .build()
            .resolve()
            .unwrap();
        assert!(config.max_workers >= 1);
    }

    #[test]
    fn test_load_from_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cluster.toml");
        std::fs::write(
            &path,
            r#"
cwd = "/srv/app"
agents = ["mailer", "cache"]
max_workers = 3
timeout = "1s 500ms"
shutdown_timeout = "20s"
framework = "./framework"
"#,
        )
        .unwrap();

        let config = ClusterConfig::load_from(Some(&path)).unwrap();
        assert_eq!(config.cwd, PathBuf::from("/srv/app"));
        assert_eq!(config.agents, vec!["mailer", "cache"]);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(20));
        assert_eq!(config.framework, Some(PathBuf::from("./framework")));
    }

    #[test]
    fn test_load_from_missing_file() {
        let err = ClusterConfig::load_from(Some(Path::new("/definitely/not/here.toml"))).unwrap_err();
        assert!(matches!(err, ClusterError::Configuration(_)));
    }
}
