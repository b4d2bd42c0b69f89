use crate::error::{Result, WardenError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Immutable description of a process to supervise
///
/// Values are built either from a config file or with the builder methods
/// below; once handed to the supervisor the spec is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Process name (unique registry key)
    pub name: String,

    /// Executable to run; bare names are resolved through `PATH`
    pub command: PathBuf,

    /// Command-line arguments
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment overlay on top of the inherited environment
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the process
    #[serde(default, alias = "cwd")]
    pub working_directory: Option<PathBuf>,

    /// Whether a failed process is relaunched automatically
    #[serde(default = "default_restart_on_failure")]
    pub restart_on_failure: bool,

    /// Automatic relaunch budget (0 = never restart)
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Base of the exponential restart backoff (in milliseconds)
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,

    /// Grace period between the terminate request and SIGKILL (in milliseconds)
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

fn default_restart_on_failure() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_backoff_ms() -> u64 {
    1_000
}

fn default_stop_timeout_ms() -> u64 {
    10_000
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_directory: None,
            restart_on_failure: default_restart_on_failure(),
            max_restarts: default_max_restarts(),
            restart_backoff_ms: default_restart_backoff_ms(),
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn restart_on_failure(mut self, enabled: bool) -> Self {
        self.restart_on_failure = enabled;
        self
    }

    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn restart_backoff(mut self, base: Duration) -> Self {
        self.restart_backoff_ms = base.as_millis() as u64;
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Get restart backoff base as Duration
    pub fn restart_backoff_base(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }

    /// Get stop timeout as Duration
    pub fn stop_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Validate the spec before it is registered
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(WardenError::MissingConfigField("name".to_string()));
        }

        if self.command.as_os_str().is_empty() {
            return Err(WardenError::MissingConfigField("command".to_string()));
        }

        if self.stop_timeout_ms == 0 {
            return Err(WardenError::ConfigValidationError(format!(
                "stop_timeout_ms for {} must be greater than zero",
                self.name
            )));
        }

        if let Some(ref dir) = self.working_directory {
            if !dir.exists() {
                return Err(WardenError::ConfigValidationError(format!(
                    "Working directory does not exist: {}",
                    dir.display()
                )));
            }
            if !dir.is_dir() {
                return Err(WardenError::ConfigValidationError(format!(
                    "Working directory is not a directory: {}",
                    dir.display()
                )));
            }
        }

        Ok(())
    }

    /// Expand `$VAR` and `${VAR}` references from the host environment
    pub fn expand_env_vars(&mut self) {
        self.command = expand_env_in_path(&self.command);

        if let Some(ref dir) = self.working_directory {
            self.working_directory = Some(expand_env_in_path(dir));
        }

        self.args = self.args.iter().map(|arg| expand_env_in_string(arg)).collect();

        // Values only; keys are taken literally
        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

/// Tunables for the supervisor itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorSettings {
    /// Monitor tick interval (in milliseconds)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Ceiling for the exponential restart backoff (in seconds)
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,

    /// Per-record stop timeout used when a shutdown signal arrives (in seconds)
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Whether the monitor samples CPU and memory of running processes
    #[serde(default = "default_sample_resources")]
    pub sample_resources: bool,
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_backoff_secs() -> u64 {
    60
}

fn default_shutdown_timeout_secs() -> u64 {
    10
}

fn default_sample_resources() -> bool {
    true
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_backoff_secs: default_max_backoff_secs(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            sample_resources: default_sample_resources(),
        }
    }
}

impl SupervisorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(WardenError::ConfigValidationError(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(WardenError::ConfigValidationError(
                "shutdown_timeout_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Complete configuration file: supervisor settings plus the managed processes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WardenConfig {
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    #[serde(default)]
    pub processes: Vec<ProcessSpec>,
}

impl WardenConfig {
    /// Load a configuration file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<WardenConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| WardenError::ConfigError(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let mut config = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(WardenError::InvalidConfig(format!(
                    "Unsupported file format: {}. Use .toml or .json",
                    extension
                )))
            }
        };

        for spec in &mut config.processes {
            spec.expand_env_vars();
        }

        config.validate()?;

        Ok(config)
    }

    /// Parse a TOML document holding either `[[processes]]` or a single process
    pub fn parse_toml(contents: &str) -> Result<WardenConfig> {
        let config: WardenConfig = toml::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        if !config.processes.is_empty() {
            return Ok(config);
        }

        let single: ProcessSpec = toml::from_str(contents).map_err(|_| {
            WardenError::InvalidConfig("No process configuration found in file".to_string())
        })?;

        Ok(WardenConfig {
            supervisor: config.supervisor,
            processes: vec![single],
        })
    }

    /// Parse a JSON document holding either `processes` or a single process
    pub fn parse_json(contents: &str) -> Result<WardenConfig> {
        let config: WardenConfig = serde_json::from_str(contents)
            .map_err(|e| WardenError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        if !config.processes.is_empty() {
            return Ok(config);
        }

        let single: ProcessSpec = serde_json::from_str(contents).map_err(|_| {
            WardenError::InvalidConfig("No process configuration found in file".to_string())
        })?;

        Ok(WardenConfig {
            supervisor: config.supervisor,
            processes: vec![single],
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.supervisor.validate()?;

        let mut seen = HashSet::new();
        for spec in &self.processes {
            spec.validate()?;
            if !seen.insert(spec.name.as_str()) {
                return Err(WardenError::ConfigValidationError(format!(
                    "Duplicate process name: {}",
                    spec.name
                )));
            }
        }

        Ok(())
    }
}

/// Expand `$VAR` and `${VAR}`; unknown variables are left untouched
fn expand_env_in_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(pos) = rest.find('$') {
        result.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        match (name.is_empty(), std::env::var(name)) {
            (false, Ok(value)) => result.push_str(&value),
            _ => result.push_str(&rest[pos..pos + 1 + consumed]),
        }

        rest = &after[consumed..];
    }

    result.push_str(rest);
    result
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    PathBuf::from(expand_env_in_string(&path_str))
}
