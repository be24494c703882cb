//! Run pool - concurrent runs under a concurrency limit
//!
//! Each run gets its own worker task which waits for a permit and then
//! hands the run to the [`Runner`]. The registry is the only shared mutable
//! structure of the pool.

use super::config::ShellConfig;
use super::run::{RunId, RunState, ShellRun};
use super::runner::Runner;
use crate::error::ShellError;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Extra time granted after the abort timeout before giving up on a kill
const KILL_GRACE: Duration = Duration::from_secs(1);

/// Handle to a run scheduled on a pool
#[derive(Debug, Clone)]
pub struct RunHandle {
    run: Arc<ShellRun>,
}

impl RunHandle {
    pub fn run(&self) -> &Arc<ShellRun> {
        &self.run
    }

    pub fn into_run(self) -> Arc<ShellRun> {
        self.run
    }

    /// Wait for completion and return the run, or its error
    pub async fn wait(&self) -> Result<Arc<ShellRun>, ShellError> {
        self.run.wait_until_complete().await?;
        Ok(self.run.clone())
    }

    pub fn kill(&self, reason: &str, immediate: bool) -> bool {
        self.run.request_kill(reason, immediate)
    }
}

impl Deref for RunHandle {
    type Target = ShellRun;

    fn deref(&self) -> &ShellRun {
        &self.run
    }
}

/// Runs partitioned by outcome, each side in submission order
#[derive(Debug, Default)]
pub struct PoolOutcome {
    pub ok: Vec<Arc<ShellRun>>,
    pub errors: Vec<(ShellError, Arc<ShellRun>)>,
}

impl PoolOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ok.len() + self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracked collection of concurrently executing runs
#[derive(Debug, Clone)]
pub struct RunPool {
    runner: Runner,
    registry: Arc<Mutex<BTreeMap<RunId, Arc<ShellRun>>>>,
    permits: Arc<Semaphore>,
}

impl RunPool {
    /// Pool bounded by the runner's `max_concurrent_runs` setting
    pub fn new(runner: Runner) -> Self {
        let limit = runner.settings().max_concurrent_runs.max(1);
        Self::with_limit(runner, limit)
    }

    pub fn with_limit(runner: Runner, max_concurrent: usize) -> Self {
        Self {
            runner,
            registry: Arc::new(Mutex::new(BTreeMap::new())),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    /// Create a run for `config` and schedule it.
    ///
    /// Must be called within a tokio runtime.
    pub fn run(&self, config: ShellConfig) -> RunHandle {
        let run = ShellRun::new(config);
        // A fresh run cannot belong to another pool
        let _ = run.attach_to_pool();
        self.lock().insert(run.id(), run.clone());
        self.schedule(run.clone());
        RunHandle { run }
    }

    /// Adopt an externally created run, scheduling it if still pending
    pub fn track(&self, run: Arc<ShellRun>) -> Result<RunHandle, ShellError> {
        run.attach_to_pool()?;
        self.lock().insert(run.id(), run.clone());
        if run.state() == RunState::Pending {
            self.schedule(run.clone());
        }
        Ok(RunHandle { run })
    }

    /// Drop a terminal run from the registry. Running runs stay tracked.
    pub fn remove(&self, id: RunId) -> Option<Arc<ShellRun>> {
        let mut registry = self.lock();
        if !registry.get(&id)?.state().is_terminal() {
            log::warn!("Not removing run {}: still running", id);
            return None;
        }
        let run = registry.remove(&id)?;
        run.detach_from_pool();
        Some(run)
    }

    pub fn get(&self, id: RunId) -> Option<Arc<ShellRun>> {
        self.lock().get(&id).cloned()
    }

    /// Tracked runs in submission order
    pub fn runs(&self) -> Vec<Arc<ShellRun>> {
        self.lock().values().cloned().collect()
    }

    /// Number of tracked runs not yet terminal
    pub fn current_run_count(&self) -> usize {
        self.lock().values().filter(|run| run.is_running()).count()
    }

    /// Wait for every tracked run and partition them into ok and errors
    pub async fn wait_on_ok_errors(
        &self,
        timeout: Option<Duration>,
        skip_kill_timeouts: bool,
    ) -> PoolOutcome {
        wait_on_ok_errors(
            &self.runs(),
            timeout,
            skip_kill_timeouts,
            self.runner.settings().kill_abort_timeout(),
        )
        .await
    }

    /// Wait for every tracked run, stopping the rest at the first failure
    pub async fn wait_all_ok(&self) -> Result<Vec<Arc<ShellRun>>, ShellError> {
        let runs = self.runs();
        let mut waiting = JoinSet::new();
        for run in &runs {
            let run = run.clone();
            waiting.spawn(async move {
                let result = run.wait_until_complete().await;
                result.map_err(|e| (e, run))
            });
        }

        while let Some(joined) = waiting.join_next().await {
            let failure = match joined {
                Ok(Ok(())) => continue,
                Ok(Err((error, run))) => {
                    log::warn!("Run {} failed, stopping the remaining runs", run.id());
                    error
                }
                Err(e) => ShellError::Incomplete {
                    run: format!("waiter task: {}", e),
                },
            };
            waiting.abort_all();
            self.kill_all_runs("another run failed", false).await;
            return Err(failure);
        }
        Ok(runs)
    }

    /// Terminate every non-terminal run and wait for them to stop.
    ///
    /// Returns how many runs were signalled. Never fails; runs that do not
    /// stop in time are logged.
    pub async fn kill_all_runs(&self, reason: &str, immediate: bool) -> usize {
        let abort_timeout = self.runner.settings().kill_abort_timeout();
        kill_runs(&self.runs(), reason, immediate, abort_timeout).await
    }

    fn schedule(&self, run: Arc<ShellRun>) {
        let runner = self.runner.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            runner.execute(&run).await;
        });
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<RunId, Arc<ShellRun>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait for `runs` and partition them by outcome.
///
/// Runs still going after `timeout` are killed, or with `skip_kill_timeouts`
/// left alone and reported as [`ShellError::Incomplete`].
pub async fn wait_on_ok_errors(
    runs: &[Arc<ShellRun>],
    timeout: Option<Duration>,
    skip_kill_timeouts: bool,
    abort_timeout: Duration,
) -> PoolOutcome {
    let all_done = async {
        for run in runs {
            let _ = run.wait_until_complete().await;
        }
    };
    let finished = match timeout {
        Some(timeout) => tokio::time::timeout(timeout, all_done).await.is_ok(),
        None => {
            all_done.await;
            true
        }
    };
    if !finished && !skip_kill_timeouts {
        kill_runs(runs, "timeout", true, abort_timeout).await;
    }

    let mut outcome = PoolOutcome::default();
    for run in runs {
        match run.state() {
            RunState::Succeeded => outcome.ok.push(run.clone()),
            state if state.is_terminal() => {
                let error = run.error().unwrap_or_else(|| ShellError::Incomplete {
                    run: run.to_string(),
                });
                outcome.errors.push((error, run.clone()));
            }
            _ => outcome.errors.push((
                ShellError::Incomplete {
                    run: run.to_string(),
                },
                run.clone(),
            )),
        }
    }
    outcome
}

async fn kill_runs(
    runs: &[Arc<ShellRun>],
    reason: &str,
    immediate: bool,
    abort_timeout: Duration,
) -> usize {
    let signalled: Vec<&Arc<ShellRun>> = runs
        .iter()
        .filter(|run| run.request_kill(reason, immediate))
        .collect();

    let stopped = async {
        for run in &signalled {
            let _ = run.wait_until_complete().await;
        }
    };
    if tokio::time::timeout(abort_timeout + KILL_GRACE, stopped).await.is_err() {
        for run in signalled.iter().filter(|run| run.is_running()) {
            log::warn!("Run {} did not stop after kill: {}", run.id(), run);
        }
    }
    signalled.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::events::EventBus;
    use crate::settings::AskShellSettings;

    fn pool(limit: usize) -> RunPool {
        let settings = AskShellSettings {
            kill_abort_timeout_secs: 0.5,
            ..AskShellSettings::default()
        };
        RunPool::with_limit(Runner::new(EventBus::new(), Arc::new(settings)), limit)
    }

    fn sh(script: &str) -> ShellConfig {
        ShellConfig::shell(script).build().unwrap()
    }

    #[tokio::test]
    async fn test_partition_ok_and_errors() {
        let pool = pool(4);
        let ok = pool.run(sh("true"));
        let failed = pool.run(sh("exit 2"));
        let also_ok = pool.run(sh("echo fine"));

        let outcome = pool.wait_on_ok_errors(None, false).await;

        assert_eq!(outcome.len(), 3);
        let ok_ids: Vec<RunId> = outcome.ok.iter().map(|r| r.id()).collect();
        assert_eq!(ok_ids, vec![ok.id(), also_ok.id()]);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].1.id(), failed.id());
        assert!(matches!(outcome.errors[0].0, ShellError::NonZeroExit { exit_code: 2, .. }));
        assert_eq!(pool.current_run_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_kills_remaining_runs() {
        let pool = pool(4);
        let quick = pool.run(sh("true"));
        let slow = pool.run(ShellConfig::builder(["sleep", "10"]).build().unwrap());

        let outcome = pool
            .wait_on_ok_errors(Some(Duration::from_millis(300)), false)
            .await;

        assert_eq!(outcome.ok.len(), 1);
        assert_eq!(outcome.ok[0].id(), quick.id());
        assert_eq!(slow.state(), RunState::Killed);
        assert_eq!(outcome.errors[0].1.id(), slow.id());
    }

    #[tokio::test]
    async fn test_skip_kill_timeouts_reports_incomplete() {
        let pool = pool(4);
        let slow = pool.run(ShellConfig::builder(["sleep", "10"]).build().unwrap());

        let outcome = pool
            .wait_on_ok_errors(Some(Duration::from_millis(200)), true)
            .await;

        assert!(matches!(outcome.errors[0].0, ShellError::Incomplete { .. }));
        assert!(slow.is_running());
        assert_eq!(pool.kill_all_runs("cleanup", true).await, 1);
        assert_eq!(slow.state(), RunState::Killed);
    }

    #[tokio::test]
    async fn test_wait_all_ok_fails_fast() {
        let pool = pool(4);
        let slow = pool.run(ShellConfig::builder(["sleep", "10"]).build().unwrap());
        pool.run(sh("exit 1"));

        let started = std::time::Instant::now();
        let err = pool.wait_all_ok().await.unwrap_err();

        assert!(matches!(err, ShellError::NonZeroExit { exit_code: 1, .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(slow.state(), RunState::Killed);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let pool = pool(1);
        let started = std::time::Instant::now();
        pool.run(ShellConfig::builder(["sleep", "0.3"]).build().unwrap());
        pool.run(ShellConfig::builder(["sleep", "0.3"]).build().unwrap());

        let runs = pool.wait_all_ok().await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(started.elapsed() >= Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_track_and_remove() {
        let pool = pool(2);
        let run = ShellRun::new(sh("true"));
        let handle = pool.track(run.clone()).unwrap();
        assert!(matches!(pool.track(run.clone()), Err(ShellError::AlreadyPooled { .. })));

        handle.wait().await.unwrap();
        assert!(pool.get(run.id()).is_some());
        assert!(pool.remove(run.id()).is_some());
        assert!(pool.get(run.id()).is_none());
        assert!(!run.is_pooled());
    }

    #[tokio::test]
    async fn test_kill_pending_run_never_starts() {
        let pool = pool(1);
        let blocker = pool.run(ShellConfig::builder(["sleep", "0.3"]).build().unwrap());
        let queued = pool.run(sh("echo never"));

        assert!(queued.kill("not needed", false));
        blocker.wait().await.unwrap();
        let outcome = pool.wait_on_ok_errors(None, false).await;

        assert_eq!(queued.state(), RunState::Killed);
        assert_eq!(queued.attempt(), 0);
        assert_eq!(outcome.errors.len(), 1);
    }
}
