//! Core engine - run configuration, process runner, retries and pooling

mod config;
mod events;
mod pool;
mod retry;
mod run;
pub mod run_logs;
mod runner;

pub use config::{first_arg, resolve_binary, CommandLine, OutputCallback, RetryPredicate, ShellConfig, ShellConfigBuilder};
pub use events::{Event, EventBus, EventFilter, EventKind, EventPayload, RunAfterInfo, Stream, Subscription};
pub use pool::{wait_on_ok_errors, PoolOutcome, RunHandle, RunPool};
pub use retry::{BackoffPolicy, RetryPolicy, RunOutcome};
pub use run::{KillRequest, OutputFormat, RunId, RunState, ShellRun};
pub use runner::{AttemptOutcome, Runner};
