//! Error types shared by the run engine and the prompt layer

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::core::Stream;

/// Number of trailing output lines carried by a [`ShellError::NonZeroExit`]
pub const ERROR_TAIL_LINES: usize = 10;

/// Failure of a single run.
///
/// Errors are values: they are stored on the run and collected by the pool,
/// so they are cheap to clone and carry owned strings only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShellError {
    #[error("invalid shell config: {0}")]
    InvalidConfig(String),

    #[error("binary '{binary}' not found. Please install '{binary}' using your package manager")]
    BinaryNotFound { binary: String },

    #[error("failed to launch '{command}': {reason}")]
    Spawn { command: String, reason: String },

    #[error("{run}\nExit code: {exit_code}\nlines:{last_lines}")]
    NonZeroExit {
        run: String,
        exit_code: i32,
        last_lines: String,
    },

    #[error("error reading {stream} for {run}: {reason}")]
    Read {
        run: String,
        stream: Stream,
        reason: String,
    },

    #[error("{run} timed out after {timeout:?}")]
    Timeout { run: String, timeout: Duration },

    #[error("{run} was killed: {reason}")]
    Killed { run: String, reason: String },

    #[error("{run} did not complete")]
    Incomplete { run: String },

    #[error("No output in {stream} for {run}")]
    EmptyOutput { run: String, stream: Stream },

    #[error("failed to parse {stream} of {run} as {format}: {reason}")]
    ParseOutput {
        run: String,
        stream: Stream,
        format: String,
        reason: String,
    },

    #[error("{run} already belongs to a pool")]
    AlreadyPooled { run: String },
}

impl ShellError {
    /// Build a non-zero exit error with the last lines of both streams
    pub fn non_zero_exit(run: String, exit_code: i32, stdout: &[String], stderr: &[String]) -> Self {
        let mut lines = Vec::new();
        for (title, stream) in [("STDOUT", stdout), ("STDERR", stderr)] {
            let start = stream.len().saturating_sub(ERROR_TAIL_LINES);
            let tail: Vec<&str> = stream[start..]
                .iter()
                .map(|line| line.trim())
                .filter(|line| !line.is_empty())
                .collect();
            if !tail.is_empty() {
                lines.push(title);
                lines.extend(tail);
            }
        }

        Self::NonZeroExit {
            run,
            exit_code,
            last_lines: lines.join("\n"),
        }
    }

    /// Whether the retry policy may attempt the run again after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NonZeroExit { .. } | Self::Read { .. })
    }
}

/// Failure of an interactive question
#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Question asked: '{prompt}'")]
    RaiseOnQuestion { prompt: String },

    #[error("question '{prompt}' asked in a non-interactive shell, but no default value provided")]
    NoDefault { prompt: String },

    #[error("Not enough responses provided. Expected {expected}, got {asked} questions. Last prompt: '{prompt}'")]
    OutOfResponses {
        expected: usize,
        asked: usize,
        prompt: String,
    },

    #[error("invalid response '{response}' for '{prompt}': {reason}")]
    InvalidResponse {
        prompt: String,
        response: String,
        reason: String,
    },

    #[error("question '{prompt}' aborted: input closed")]
    Aborted { prompt: String },

    #[error("prompt I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure loading settings or preparing run log directories
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: String, value: String },

    #[error("invalid value {value} for {field} in settings file {path}")]
    InvalidValue {
        path: PathBuf,
        field: &'static str,
        value: String,
    },

    #[error("Run logs directory {0} is full! Please clean it up")]
    RunLogsFull(PathBuf),

    #[error("run log I/O failed: {0}")]
    Io(#[from] std::io::Error),
}
