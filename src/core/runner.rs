//! Process runner - launches attempts and streams their output
//!
//! stdout and stderr are read on their own tasks and forwarded to a single
//! consumer loop per attempt, which publishes every line on the bus. That
//! loop is the only place a run's events are produced, so they arrive in
//! order.

use super::events::{EventBus, EventPayload, RunAfterInfo, Stream};
use super::retry::RetryPolicy;
use super::run::ShellRun;
use super::run_logs::{next_run_logs_dir, RunLogFiles};
use crate::error::ShellError;
use crate::settings::AskShellSettings;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Result of a single launch of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// Process exited and both streams closed
    Exited { exit_code: i32 },
    /// Process exited but one of its streams failed
    ReadFailed {
        exit_code: Option<i32>,
        error: ShellError,
    },
    SpawnFailed(ShellError),
    TimedOut { timeout: Duration },
    Killed { reason: String },
}

enum StreamMessage {
    Line(Stream, String),
    Failed(Stream, std::io::Error),
}

/// Executes runs and publishes their lifecycle on an [`EventBus`]
#[derive(Debug, Clone)]
pub struct Runner {
    bus: EventBus,
    settings: Arc<AskShellSettings>,
}

impl Runner {
    pub fn new(bus: EventBus, settings: Arc<AskShellSettings>) -> Self {
        Self { bus, settings }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn settings(&self) -> &AskShellSettings {
        &self.settings
    }

    /// Drive a run from `Pending` to a terminal state.
    ///
    /// Does nothing for a run that is already terminal (killed before start).
    pub async fn execute(&self, run: &Arc<ShellRun>) {
        if !run.begin() {
            log::debug!("Skipping run {}: already {}", run.id(), run.state());
            return;
        }

        let config = run.config();
        self.bus.emit(
            run.id(),
            EventPayload::RunBefore {
                print_prefix: config.print_prefix().to_string(),
                command: config.command().to_string(),
            },
        );
        log::info!("Starting run {}: {}", run.id(), config.print_prefix());

        let log_dir = self.log_dir(run);
        let outcome = RetryPolicy::for_run(run)
            .drive(self, run, log_dir.as_deref())
            .await;

        let info = RunAfterInfo {
            state: outcome.state,
            exit_code: outcome.exit_code,
            attempts: run.attempt(),
            error: outcome.error.as_ref().map(ToString::to_string),
        };
        if !run.complete(outcome.state, outcome.exit_code, outcome.error) {
            return;
        }

        match &info.error {
            None => log::info!("Run {} {}", run.id(), run),
            Some(error) => log::warn!("Run {} {}: {}", run.id(), info.state, error),
        }
        // Waiters only wake once the RunAfter handlers have returned
        self.bus.emit(run.id(), EventPayload::RunAfter(info));
        run.notify_complete();
    }

    /// Directory for the log files of a run, if logging is enabled
    fn log_dir(&self, run: &ShellRun) -> Option<PathBuf> {
        let config = run.config();
        if let Some(dir) = config.run_output_dir() {
            return Some(dir.to_path_buf());
        }
        let root = self.settings.run_logs_dir.as_ref()?;
        match next_run_logs_dir(root, config.exec_name()) {
            Ok(dir) => Some(dir),
            Err(e) => {
                log::warn!("Run logs disabled for {}: {}", run.id(), e);
                None
            }
        }
    }

    /// Launch one attempt and wait for it to end
    pub(crate) async fn attempt(&self, run: &Arc<ShellRun>, attempt: u32, log_dir: Option<&Path>) -> AttemptOutcome {
        run.start_attempt(attempt);
        let config = run.config();

        let mut kill_rx = run.kill_receiver();
        if let Some(request) = kill_rx.borrow_and_update().clone() {
            return AttemptOutcome::Killed {
                reason: request.reason,
            };
        }

        let mut command = Command::new(config.program());
        command
            .args(config.program_args())
            .current_dir(config.cwd())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if config.skip_os_env() {
            command.env_clear();
        }
        command.envs(config.env());
        #[cfg(unix)]
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return AttemptOutcome::SpawnFailed(ShellError::Spawn {
                    command: config.command().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let pid = child.id();
        run.mark_process_started(pid);
        self.bus.emit(run.id(), EventPayload::RunStarted { attempt, pid });
        log::debug!("Run {} attempt {} started with pid {:?}", run.id(), attempt, pid);

        let mut logs = log_dir.and_then(|dir| {
            RunLogFiles::create(
                dir,
                &config.run_log_stem(attempt),
                config.ansi_content(),
                config.include_log_time() || self.settings.include_log_time,
            )
            .map_err(|e| log::warn!("Failed to open run logs in {}: {}", dir.display(), e))
            .ok()
        });

        let (line_tx, mut line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            spawn_reader(stdout, Stream::Stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_reader(stderr, Stream::Stderr, line_tx.clone());
        }
        drop(line_tx);

        let deadline = async {
            match config.timeout() {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(deadline);

        let mut status: Option<ExitStatus> = None;
        let mut streams_open = true;
        let mut read_error: Option<ShellError> = None;

        while status.is_none() || streams_open {
            tokio::select! {
                message = line_rx.recv(), if streams_open => match message {
                    Some(StreamMessage::Line(stream, line)) => {
                        self.publish_line(run, stream, line, logs.as_mut());
                    }
                    Some(StreamMessage::Failed(stream, e)) => {
                        log::warn!("Run {} failed reading {}: {}", run.id(), stream, e);
                        self.bus.emit(
                            run.id(),
                            EventPayload::ReadError {
                                stream,
                                error: e.to_string(),
                            },
                        );
                        read_error.get_or_insert(ShellError::Read {
                            run: config.print_prefix().to_string(),
                            stream,
                            reason: e.to_string(),
                        });
                    }
                    None => streams_open = false,
                },
                waited = child.wait(), if status.is_none() => match waited {
                    Ok(exit) => status = Some(exit),
                    Err(e) => {
                        log::warn!("Run {} lost its process: {}", run.id(), e);
                        return AttemptOutcome::ReadFailed {
                            exit_code: None,
                            error: ShellError::Incomplete {
                                run: config.print_prefix().to_string(),
                            },
                        };
                    }
                },
                _ = &mut deadline => {
                    let timeout = config.timeout().unwrap_or_default();
                    log::warn!("Run {} timed out after {:?}", run.id(), timeout);
                    self.terminate(run, &mut child, false).await;
                    return AttemptOutcome::TimedOut { timeout };
                }
                request = async {
                    kill_rx.wait_for(|request| request.is_some()).await.ok().and_then(|r| r.clone())
                } => {
                    let (reason, immediate) = request
                        .map(|r| (r.reason, r.immediate))
                        .unwrap_or_else(|| ("run dropped".to_string(), true));
                    self.terminate(run, &mut child, immediate).await;
                    return AttemptOutcome::Killed { reason };
                }
            }
        }

        let exit_code = status.map(exit_code_of).unwrap_or(-1);
        match read_error {
            Some(error) => AttemptOutcome::ReadFailed {
                exit_code: Some(exit_code),
                error,
            },
            None => AttemptOutcome::Exited { exit_code },
        }
    }

    fn publish_line(&self, run: &ShellRun, stream: Stream, line: String, logs: Option<&mut RunLogFiles>) {
        if let Some(callback) = run.config().output_callback() {
            callback(&line, stream);
        }
        if let Some(logs) = logs {
            logs.write_line(stream, &line);
        }
        run.push_line(stream, line.clone());

        let payload = match stream {
            Stream::Stdout => EventPayload::StdOutput { line },
            Stream::Stderr => EventPayload::StdErr { line },
        };
        self.bus.emit(run.id(), payload);
    }

    /// Signal the process group, then force-kill after the abort timeout
    async fn terminate(&self, run: &ShellRun, child: &mut Child, immediate: bool) {
        if let Some(pid) = child.id() {
            if signal_group(pid, immediate) {
                let abort_timeout = self.settings.kill_abort_timeout();
                if tokio::time::timeout(abort_timeout, child.wait()).await.is_ok() {
                    return;
                }
                log::warn!(
                    "Run {} did not stop within {:?}, force killing",
                    run.id(),
                    abort_timeout
                );
            }
        }
        if let Err(e) = child.kill().await {
            log::warn!("Failed to kill run {}: {}", run.id(), e);
        }
    }
}

fn spawn_reader<R>(pipe: R, stream: Stream, tx: mpsc::UnboundedSender<StreamMessage>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    if tx.send(StreamMessage::Line(stream, line)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    let _ = tx.send(StreamMessage::Failed(stream, e));
                    break;
                }
            }
        }
    });
}

/// `SIGINT` (graceful) or `SIGTERM` (immediate) to the child's process group
#[cfg(unix)]
fn signal_group(pid: u32, immediate: bool) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = if immediate {
        Signal::SIGTERM
    } else {
        Signal::SIGINT
    };
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) => true,
        Err(e) => {
            log::warn!("Failed to send {} to process group {}: {}", signal, pid, e);
            false
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _immediate: bool) -> bool {
    false
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}
