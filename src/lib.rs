//! ask-shell - run, retry and pool shell commands
//!
//! Launches external processes, streams their output as typed events,
//! retries failed attempts, coordinates concurrent runs and asks
//! interactive questions that can be answered from defaults or patched
//! in tests.

pub mod console;
pub mod context;
pub mod core;
pub mod error;
pub mod interactive;
pub mod settings;
pub mod summary;

// Re-exports
pub use context::AskShell;
pub use core::{
    BackoffPolicy, Event, EventBus, EventFilter, EventKind, EventPayload, OutputFormat, PoolOutcome, RunHandle,
    RunId, RunPool, RunState, Runner, ShellConfig, ShellRun, Stream, Subscription,
};
pub use error::{ConfigError, PromptError, ShellError};
pub use interactive::{Choice, PromptMatch, PromptMode, Prompter, QuestionPatcher};
pub use settings::AskShellSettings;
pub use summary::{PoolSummary, RunSummary};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
