//! Run record - state machine, captured output and completion signalling

use super::config::ShellConfig;
use super::events::Stream;
use crate::error::ShellError;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique run identifier, increasing in creation order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub u64);

impl RunId {
    fn next() -> Self {
        Self(NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Run lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Killed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Killed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Killed => write!(f, "killed"),
        }
    }
}

/// Termination request observed by the runner
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillRequest {
    pub reason: String,
    /// `SIGTERM` instead of `SIGINT` as the first signal
    pub immediate: bool,
}

/// Format of structured process output
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Yaml,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Yaml => write!(f, "yaml"),
        }
    }
}

#[derive(Debug)]
struct RunInner {
    state: RunState,
    exit_code: Option<i32>,
    attempt: u32,
    pid: Option<u32>,
    has_started: bool,
    stdout: Vec<String>,
    stderr: Vec<String>,
    error: Option<ShellError>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
}

/// One tracked execution of a [`ShellConfig`], possibly over several attempts.
///
/// Only the runner and the retry policy mutate a run. Everyone else observes
/// it through the accessors and the `wait_*` futures.
pub struct ShellRun {
    id: RunId,
    config: ShellConfig,
    inner: Mutex<RunInner>,
    state_tx: watch::Sender<RunState>,
    started_tx: watch::Sender<bool>,
    kill_tx: watch::Sender<Option<KillRequest>>,
    pooled: AtomicBool,
}

impl fmt::Debug for ShellRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShellRun")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl fmt::Display for ShellRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        write!(f, "ShellRun( {}", self.config.print_prefix())?;
        if inner.state.is_terminal() {
            match inner.exit_code {
                Some(code) => write!(f, " exit_code={}", code)?,
                None => write!(f, " {}", inner.state)?,
            }
        } else {
            write!(f, " {}", inner.state)?;
        }
        if inner.attempt > 1 {
            write!(f, " attempt={}/{}", inner.attempt, self.config.attempts())?;
        }
        write!(f, " )")
    }
}

impl ShellRun {
    pub fn new(config: ShellConfig) -> Arc<Self> {
        let (state_tx, _) = watch::channel(RunState::Pending);
        let (started_tx, _) = watch::channel(false);
        let (kill_tx, _) = watch::channel(None);

        Arc::new(Self {
            id: RunId::next(),
            config,
            inner: Mutex::new(RunInner {
                state: RunState::Pending,
                exit_code: None,
                attempt: 0,
                pid: None,
                has_started: false,
                stdout: Vec::new(),
                stderr: Vec::new(),
                error: None,
                started_at: None,
                ended_at: None,
            }),
            state_tx,
            started_tx,
            kill_tx,
            pooled: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn config(&self) -> &ShellConfig {
        &self.config
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        !self.state().is_terminal()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Current attempt, 0 before the first launch
    pub fn attempt(&self) -> u32 {
        self.lock().attempt
    }

    pub fn pid(&self) -> Option<u32> {
        self.lock().pid
    }

    pub fn error(&self) -> Option<ShellError> {
        self.lock().error.clone()
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.lock().ended_at
    }

    pub fn stdout_lines(&self) -> Vec<String> {
        self.lock().stdout.clone()
    }

    pub fn stderr_lines(&self) -> Vec<String> {
        self.lock().stderr.clone()
    }

    /// Captured stdout of the latest attempt
    pub fn stdout(&self) -> String {
        self.lock().stdout.join("\n").trim().to_string()
    }

    /// Captured stderr of the latest attempt
    pub fn stderr(&self) -> String {
        self.lock().stderr.join("\n").trim().to_string()
    }

    pub fn stdout_one_line(&self) -> String {
        self.lock().stdout.concat().trim().to_string()
    }

    pub fn stderr_one_line(&self) -> String {
        self.lock().stderr.concat().trim().to_string()
    }

    /// Deserialize the captured output of `stream`
    pub fn parse_output<T: DeserializeOwned>(
        &self,
        format: OutputFormat,
        stream: Stream,
    ) -> Result<T, ShellError> {
        let content = match (format, stream) {
            (OutputFormat::Json, Stream::Stdout) => self.stdout_one_line(),
            (OutputFormat::Json, Stream::Stderr) => self.stderr_one_line(),
            (OutputFormat::Yaml, Stream::Stdout) => self.stdout(),
            (OutputFormat::Yaml, Stream::Stderr) => self.stderr(),
        };
        if content.is_empty() {
            return Err(ShellError::EmptyOutput {
                run: self.to_string(),
                stream,
            });
        }

        let parsed = match format {
            OutputFormat::Json => serde_json::from_str(&content).map_err(|e| e.to_string()),
            OutputFormat::Yaml => serde_yaml::from_str(&content).map_err(|e| e.to_string()),
        };
        parsed.map_err(|reason| ShellError::ParseOutput {
            run: self.to_string(),
            stream,
            format: format.to_string(),
            reason,
        })
    }

    /// Wait until the run reaches a terminal state
    pub async fn wait_until_complete(&self) -> Result<(), ShellError> {
        let mut rx = self.state_tx.subscribe();
        // Sender lives in `self`, so the channel cannot close while borrowed
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Wait until the first attempt has a live process.
    ///
    /// Fails with the run error if the run ended without ever starting.
    pub async fn wait_on_started(&self) -> Result<(), ShellError> {
        let mut started = self.started_tx.subscribe();
        let mut state = self.state_tx.subscribe();
        tokio::select! {
            _ = async { started.wait_for(|started| *started).await.is_ok() } => Ok(()),
            _ = async { state.wait_for(|state| state.is_terminal()).await.is_ok() } => {
                if self.lock().has_started {
                    return Ok(());
                }
                Err(self.error().unwrap_or_else(|| ShellError::Incomplete {
                    run: self.to_string(),
                }))
            }
        }
    }

    /// Ask the runner to terminate the run.
    ///
    /// Returns `false` (and does nothing) when the run is already terminal.
    /// A run that never started is moved to `Killed` directly.
    pub fn request_kill(&self, reason: &str, immediate: bool) -> bool {
        {
            let state = self.lock().state;
            if state.is_terminal() {
                log::info!("killing run already completed: {} {}", self, reason);
                return false;
            }
        }
        let killed_while_pending = self.finish_if_pending(RunState::Killed, None, || {
            ShellError::Killed {
                run: self.config.print_prefix().to_string(),
                reason: reason.to_string(),
            }
        });
        if !killed_while_pending {
            log::warn!("killing starting: {} {}", self, reason);
        }
        self.kill_tx.send_replace(Some(KillRequest {
            reason: reason.to_string(),
            immediate,
        }));
        true
    }

    pub fn kill_requested(&self) -> Option<KillRequest> {
        self.kill_tx.borrow().clone()
    }

    pub(crate) fn kill_receiver(&self) -> watch::Receiver<Option<KillRequest>> {
        self.kill_tx.subscribe()
    }

    /// Pending → Running. Returns `false` if the run is already terminal.
    pub(crate) fn begin(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            RunState::Pending => {
                inner.state = RunState::Running;
                inner.started_at = Some(Utc::now());
                drop(inner);
                self.state_tx.send_replace(RunState::Running);
                true
            }
            RunState::Running => true,
            _ => false,
        }
    }

    /// Reset per-attempt state before launching `attempt`
    pub(crate) fn start_attempt(&self, attempt: u32) {
        let mut inner = self.lock();
        inner.attempt = attempt;
        inner.pid = None;
        inner.stdout.clear();
        inner.stderr.clear();
    }

    pub(crate) fn mark_process_started(&self, pid: Option<u32>) {
        let first = {
            let mut inner = self.lock();
            inner.pid = pid;
            !std::mem::replace(&mut inner.has_started, true)
        };
        if first {
            self.started_tx.send_replace(true);
        }
    }

    pub(crate) fn push_line(&self, stream: Stream, line: String) {
        let mut inner = self.lock();
        match stream {
            Stream::Stdout => inner.stdout.push(line),
            Stream::Stderr => inner.stderr.push(line),
        }
    }

    /// Record a terminal state. The exit code is recorded exactly once here.
    ///
    /// Waiters are not woken until [`ShellRun::notify_complete`], so the
    /// runner can publish `RunAfter` in between. Returns `false` when the run
    /// was already terminal.
    pub(crate) fn complete(&self, state: RunState, exit_code: Option<i32>, error: Option<ShellError>) -> bool {
        debug_assert!(state.is_terminal());
        let mut inner = self.lock();
        if inner.state.is_terminal() {
            log::warn!("already done {}", self.config.print_prefix());
            return false;
        }
        inner.state = state;
        inner.exit_code = exit_code;
        inner.error = error;
        inner.pid = None;
        inner.ended_at = Some(Utc::now());
        true
    }

    /// Wake everyone waiting for the recorded terminal state
    pub(crate) fn notify_complete(&self) {
        let state = self.lock().state;
        if state.is_terminal() {
            self.state_tx.send_replace(state);
        }
    }

    fn finish_if_pending<F>(&self, state: RunState, exit_code: Option<i32>, error: F) -> bool
    where
        F: FnOnce() -> ShellError,
    {
        let mut inner = self.lock();
        if inner.state != RunState::Pending {
            return false;
        }
        inner.state = state;
        inner.exit_code = exit_code;
        inner.error = Some(error());
        inner.ended_at = Some(Utc::now());
        drop(inner);
        self.state_tx.send_replace(state);
        true
    }

    /// Claim membership in a pool
    pub(crate) fn attach_to_pool(&self) -> Result<(), ShellError> {
        self.pooled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| ShellError::AlreadyPooled {
                run: self.to_string(),
            })
    }

    pub(crate) fn detach_from_pool(&self) {
        self.pooled.store(false, Ordering::Release);
    }

    pub fn is_pooled(&self) -> bool {
        self.pooled.load(Ordering::Acquire)
    }

    fn lock(&self) -> MutexGuard<'_, RunInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
