//! Retry policy - bounded re-invocation of failed attempts with backoff
//!
//! A run gets `retries + 1` attempts. Only non-zero exits and stream read
//! errors are retried; spawn failures, timeouts and kills end the run at once.

use super::events::{EventBus, EventPayload};
use super::run::{RunState, ShellRun};
use super::runner::{AttemptOutcome, Runner};
use crate::error::ShellError;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Delay between attempts: `first × factor^n`, clamped to `max`.
///
/// `n` is 0 for the delay before the first retry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl BackoffPolicy {
    /// Retry immediately
    pub fn none() -> Self {
        Self {
            first: Duration::ZERO,
            max: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Same delay before every retry
    pub fn constant(delay: Duration) -> Self {
        Self {
            first: delay,
            max: delay,
            factor: 1.0,
        }
    }

    /// Doubling delay starting at `first`, capped at `max`
    pub fn exponential(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    pub fn next(&self, retry: u32) -> Duration {
        let max_secs = self.max.as_secs_f64();
        let exp = retry.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);

        if !secs.is_finite() || secs < 0.0 || secs > max_secs {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Final state of a run as decided by the retry loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub state: RunState,
    pub exit_code: Option<i32>,
    pub error: Option<ShellError>,
}

impl RunOutcome {
    fn succeeded(exit_code: i32) -> Self {
        Self {
            state: RunState::Succeeded,
            exit_code: Some(exit_code),
            error: None,
        }
    }

    fn failed(exit_code: Option<i32>, error: ShellError) -> Self {
        Self {
            state: RunState::Failed,
            exit_code,
            error: Some(error),
        }
    }

    fn killed(error: ShellError) -> Self {
        Self {
            state: RunState::Killed,
            exit_code: None,
            error: Some(error),
        }
    }
}

/// Attempt budget and delays for one run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    pub fn for_run(run: &ShellRun) -> Self {
        Self {
            attempts: run.config().attempts(),
            backoff: run.config().backoff(),
        }
    }

    /// Launch attempts until one succeeds, the budget is spent or the run is killed
    pub async fn drive(
        &self,
        runner: &Runner,
        run: &Arc<ShellRun>,
        log_dir: Option<&Path>,
    ) -> RunOutcome {
        self.drive_with(runner.bus(), run, move |attempt| runner.attempt(run, attempt, log_dir))
            .await
    }

    /// Retry loop over an arbitrary attempt launcher
    async fn drive_with<F, Fut>(&self, bus: &EventBus, run: &Arc<ShellRun>, mut launch: F) -> RunOutcome
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = AttemptOutcome>,
    {
        let config = run.config();
        let mut last = None;

        for attempt in 1..=self.attempts.max(1) {
            if attempt > 1 {
                bus.emit(run.id(), EventPayload::RetryAttempt { attempt });
                log::warn!(
                    "Retrying run {} attempt {} of {}",
                    run,
                    attempt,
                    self.attempts
                );
                if let Some(outcome) = self.sleep_before(run, attempt - 2).await {
                    return outcome;
                }
            }

            let (exit_code, error) = match launch(attempt).await {
                AttemptOutcome::Exited { exit_code: 0 } => return RunOutcome::succeeded(0),
                AttemptOutcome::Exited { exit_code } if config.allow_non_zero_exit() => {
                    return RunOutcome::succeeded(exit_code)
                }
                AttemptOutcome::Exited { exit_code } => (
                    Some(exit_code),
                    ShellError::non_zero_exit(
                        run.to_string(),
                        exit_code,
                        &run.stdout_lines(),
                        &run.stderr_lines(),
                    ),
                ),
                AttemptOutcome::ReadFailed { exit_code, error } => (exit_code, error),
                AttemptOutcome::SpawnFailed(error) => return RunOutcome::failed(None, error),
                AttemptOutcome::TimedOut { timeout } => {
                    return RunOutcome::killed(ShellError::Timeout {
                        run: run.to_string(),
                        timeout,
                    })
                }
                AttemptOutcome::Killed { reason } => {
                    return RunOutcome::killed(ShellError::Killed {
                        run: run.to_string(),
                        reason,
                    })
                }
            };

            let retry = error.is_retryable() && config.should_retry(run);
            last = Some(RunOutcome::failed(exit_code, error));
            if !retry {
                break;
            }
        }

        last.unwrap_or_else(|| {
            RunOutcome::failed(None, ShellError::Incomplete { run: run.to_string() })
        })
    }

    /// Sleep the backoff delay, cut short by a kill request
    async fn sleep_before(&self, run: &ShellRun, retry: u32) -> Option<RunOutcome> {
        let mut kill_rx = run.kill_receiver();
        let delay = self.backoff.next(retry);

        let request = if delay.is_zero() {
            kill_rx.borrow().clone()
        } else {
            tokio::select! {
                _ = tokio::time::sleep(delay) => kill_rx.borrow().clone(),
                request = async {
                    kill_rx.wait_for(|request| request.is_some()).await.ok().and_then(|r| r.clone())
                } => request,
            }
        };

        request.map(|request| {
            RunOutcome::killed(ShellError::Killed {
                run: run.to_string(),
                reason: request.reason,
            })
        })
    }
}
