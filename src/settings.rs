//! Settings - YAML settings file with environment overrides

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_NAME_MAX_CONCURRENT_RUNS: &str = "ASK_SHELL_MAX_CONCURRENT_RUNS";
pub const ENV_NAME_FORCE_INTERACTIVE_SHELL: &str = "ASK_SHELL_FORCE_INTERACTIVE_SHELL";
pub const ENV_NAME_RAISE_ON_QUESTION: &str = "ASK_SHELL_RAISE_ON_QUESTION";
pub const ENV_NAME_RUN_LOGS_DIR: &str = "ASK_SHELL_RUN_LOGS_DIR";
pub const ENV_NAME_INCLUDE_LOG_TIME: &str = "ASK_SHELL_INCLUDE_LOG_TIME";
pub const ENV_NAME_KILL_ABORT_TIMEOUT: &str = "ASK_SHELL_KILL_ABORT_TIMEOUT";

const SETTINGS_FILE: &str = "ask-shell/settings.yaml";

/// Runtime settings shared by every run of a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AskShellSettings {
    /// Upper bound of runs executing at the same time in one pool
    pub max_concurrent_runs: usize,
    /// Treat the shell as interactive even when detection says otherwise
    pub force_interactive: bool,
    /// Fail every question instead of asking it
    pub raise_on_question: bool,
    /// Root for per-run log directories, no log files when unset
    pub run_logs_dir: Option<PathBuf>,
    /// Prefix log file lines with a `[HH:MM:SS]` timestamp
    pub include_log_time: bool,
    /// Seconds to wait for a signalled process group before force-killing
    pub kill_abort_timeout_secs: f64,
    /// Select questions longer than this use search instead of shortcuts
    pub search_enabled_after_choices: usize,
    /// Emit run events as JSON lines instead of prefixed output
    pub event_log_json: bool,
}

impl Default for AskShellSettings {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 12,
            force_interactive: false,
            raise_on_question: false,
            run_logs_dir: None,
            include_log_time: false,
            kill_abort_timeout_secs: 3.0,
            search_enabled_after_choices: 7,
            event_log_json: false,
        }
    }
}

impl AskShellSettings {
    /// Default settings file location (`~/.config/ask-shell/settings.yaml` on Linux)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(SETTINGS_FILE))
    }

    /// Root for run logs when `--log-dir` is given without a path
    pub fn default_run_logs_dir() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join("ask-shell").join("run_logs"))
    }

    /// Load settings from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate(path)?;
        Ok(settings)
    }

    fn validate(&self, path: &Path) -> Result<(), ConfigError> {
        let invalid = |field, value: String| ConfigError::InvalidValue {
            path: path.to_path_buf(),
            field,
            value,
        };
        if !valid_timeout_secs(self.kill_abort_timeout_secs) {
            return Err(invalid(
                "kill_abort_timeout_secs",
                self.kill_abort_timeout_secs.to_string(),
            ));
        }
        if self.max_concurrent_runs == 0 {
            return Err(invalid("max_concurrent_runs", "0".to_string()));
        }
        Ok(())
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Settings file (if present) with environment overrides applied
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match Self::default_path() {
            Some(path) if path.exists() => {
                log::debug!("Loading settings from {}", path.display());
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup(ENV_NAME_MAX_CONCURRENT_RUNS) {
            self.max_concurrent_runs = value
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|count| *count > 0)
                .ok_or_else(|| invalid_env(ENV_NAME_MAX_CONCURRENT_RUNS, &value))?;
        }
        if let Some(value) = lookup(ENV_NAME_FORCE_INTERACTIVE_SHELL) {
            self.force_interactive = parse_flag(ENV_NAME_FORCE_INTERACTIVE_SHELL, &value)?;
        }
        if let Some(value) = lookup(ENV_NAME_RAISE_ON_QUESTION) {
            self.raise_on_question = parse_flag(ENV_NAME_RAISE_ON_QUESTION, &value)?;
        }
        if let Some(value) = lookup(ENV_NAME_RUN_LOGS_DIR) {
            self.run_logs_dir = if value.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            };
        }
        if let Some(value) = lookup(ENV_NAME_INCLUDE_LOG_TIME) {
            self.include_log_time = parse_flag(ENV_NAME_INCLUDE_LOG_TIME, &value)?;
        }
        if let Some(value) = lookup(ENV_NAME_KILL_ABORT_TIMEOUT) {
            self.kill_abort_timeout_secs = value
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|secs| valid_timeout_secs(*secs))
                .ok_or_else(|| invalid_env(ENV_NAME_KILL_ABORT_TIMEOUT, &value))?;
        }
        Ok(())
    }

    /// Abort timeout, the default when the field holds no valid duration
    pub fn kill_abort_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.kill_abort_timeout_secs).unwrap_or_else(|_| {
            log::warn!(
                "Ignoring invalid kill_abort_timeout_secs {}",
                self.kill_abort_timeout_secs
            );
            Duration::from_secs_f64(Self::default().kill_abort_timeout_secs)
        })
    }
}

fn valid_timeout_secs(secs: f64) -> bool {
    secs.is_finite() && secs >= 0.0
}

/// Parse a boolean environment flag
pub fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" | "" => Ok(false),
        _ => Err(invalid_env(name, value)),
    }
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv {
        name: name.to_string(),
        value: value.to_string(),
    }
}
