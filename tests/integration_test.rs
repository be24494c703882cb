use ask_shell::{
    AskShellSettings, BackoffPolicy, Event, EventBus, EventFilter, EventKind, EventPayload, PromptError, PromptMode, Prompter,
    QuestionPatcher, RunPool, RunState, Runner, ShellConfig, ShellError, Subscription,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn pool() -> RunPool {
    let settings = AskShellSettings {
        kill_abort_timeout_secs: 0.5,
        ..AskShellSettings::default()
    };
    RunPool::new(Runner::new(EventBus::new(), Arc::new(settings)))
}

fn record(pool: &RunPool) -> (Arc<Mutex<Vec<Event>>>, Subscription) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let sub = pool.runner().bus().subscribe(EventFilter::All, move |event| {
        sink.lock().unwrap().push(event.clone());
    });
    (events, sub)
}

fn count(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}

#[tokio::test]
async fn test_false_with_two_retries() {
    let pool = pool();
    let (events, _sub) = record(&pool);

    let handle = pool.run(ShellConfig::builder(["false"]).retries(2).build().unwrap());
    let err = assert_err!(handle.wait().await);

    assert!(matches!(err, ShellError::NonZeroExit { exit_code: 1, .. }));
    assert_eq!(handle.state(), RunState::Failed);
    assert_eq!(handle.attempt(), 3);

    let events = events.lock().unwrap();
    assert_eq!(count(&events, EventKind::RunStarted), 3);
    assert_eq!(count(&events, EventKind::RetryAttempt), 2);
    assert_eq!(count(&events, EventKind::RunAfter), 1);
}

#[tokio::test]
async fn test_always_failing_gets_retries_plus_one_attempts() {
    for retries in [0u32, 1, 4] {
        let pool = pool();
        let (events, _sub) = record(&pool);
        let handle = pool.run(ShellConfig::shell("exit 7").retries(retries).build().unwrap());
        assert_err!(handle.wait().await);

        let events = events.lock().unwrap();
        assert_eq!(count(&events, EventKind::RunStarted), retries as usize + 1);
        assert_eq!(count(&events, EventKind::RetryAttempt), retries as usize);
        assert_eq!(handle.exit_code(), Some(7));
    }
}

#[tokio::test]
async fn test_success_has_single_started_after_pair() {
    let pool = pool();
    let (events, _sub) = record(&pool);

    let handle = pool.run(ShellConfig::builder(["echo", "hello"]).retries(3).build().unwrap());
    assert_ok!(handle.wait().await);

    let events = events.lock().unwrap();
    let kinds: Vec<EventKind> = events.iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::RunBefore,
            EventKind::RunStarted,
            EventKind::StdOutput,
            EventKind::RunAfter
        ]
    );
    assert!(events.windows(2).all(|pair| pair[0].seq < pair[1].seq));
    match &events[3].payload {
        EventPayload::RunAfter(info) => {
            assert_eq!(info.state, RunState::Succeeded);
            assert_eq!(info.exit_code, Some(0));
            assert_eq!(info.attempts, 1);
        }
        other => panic!("unexpected payload {:?}", other),
    }
}

#[tokio::test]
async fn test_retry_events_are_ordered_per_run() {
    let pool = pool();
    let (events, _sub) = record(&pool);

    let handle = pool.run(ShellConfig::shell("echo try; exit 1").retries(1).build().unwrap());
    assert_err!(handle.wait().await);

    let kinds: Vec<EventKind> = events.lock().unwrap().iter().map(Event::kind).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::RunBefore,
            EventKind::RunStarted,
            EventKind::StdOutput,
            EventKind::RetryAttempt,
            EventKind::RunStarted,
            EventKind::StdOutput,
            EventKind::RunAfter,
        ]
    );
}

#[tokio::test]
async fn test_predicate_vetoes_retry() {
    let pool = pool();
    let handle = pool.run(
        ShellConfig::shell("echo fatal >&2; exit 1")
            .retries(5)
            .should_retry(|run| !run.stderr().contains("fatal"))
            .build()
            .unwrap(),
    );
    assert_err!(handle.wait().await);
    assert_eq!(handle.attempt(), 1);
}

#[tokio::test]
async fn test_partition_sums_to_submitted_runs() {
    let pool = pool();
    let scripts = ["true", "exit 1", "echo a", "exit 3", "sleep 0.1"];
    for script in scripts {
        pool.run(ShellConfig::shell(script).build().unwrap());
    }

    let outcome = pool.wait_on_ok_errors(Some(Duration::from_secs(20)), false).await;

    assert_eq!(outcome.ok.len() + outcome.errors.len(), scripts.len());
    assert_eq!(outcome.errors.len(), 2);
    for (_, run) in &outcome.errors {
        assert!(matches!(run.state(), RunState::Failed | RunState::Killed));
    }
    for run in &outcome.ok {
        assert_eq!(run.state(), RunState::Succeeded);
    }
}

#[tokio::test]
async fn test_kill_terminal_run_is_noop() {
    let pool = pool();
    let handle = pool.run(ShellConfig::builder(["true"]).build().unwrap());
    assert_ok!(handle.wait().await);

    let (events, _sub) = record(&pool);
    assert!(!handle.kill("too late", true));
    assert_eq!(pool.kill_all_runs("too late", false).await, 0);

    assert_eq!(handle.state(), RunState::Succeeded);
    assert_eq!(handle.exit_code(), Some(0));
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_running_run() {
    let pool = pool();
    let handle = pool.run(ShellConfig::shell("sleep 10").build().unwrap());
    assert_ok!(handle.wait_on_started().await);

    assert_eq!(pool.kill_all_runs("stop", false).await, 1);
    assert_eq!(handle.state(), RunState::Killed);
    assert_eq!(handle.exit_code(), None);
    assert_eq!(pool.current_run_count(), 0);
}

#[tokio::test]
async fn test_wait_on_started_for_spawn_failure() {
    let pool = pool();
    let handle = pool.run(
        ShellConfig::builder(["./no-such-script-4711.sh"])
            .build()
            .unwrap(),
    );
    let err = assert_err!(handle.wait_on_started().await);
    assert!(matches!(err, ShellError::Spawn { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_run_after_handlers_finish_before_waiters_wake() {
    let pool = pool();
    let finished = Arc::new(Mutex::new(Vec::new()));
    let sink = finished.clone();
    let _sub = pool
        .runner()
        .bus()
        .subscribe(EventFilter::kinds([EventKind::RunAfter]), move |event| {
            std::thread::sleep(Duration::from_millis(1));
            sink.lock().unwrap().push(event.run_id);
        });

    for _ in 0..50 {
        let handle = pool.run(ShellConfig::builder(["true"]).build().unwrap());
        assert_ok!(handle.wait().await);
        assert!(finished.lock().unwrap().contains(&handle.id()));
    }
}

#[tokio::test]
async fn test_kill_during_backoff_skips_next_attempt() {
    let pool = pool();
    let (events, _sub) = record(&pool);
    let handle = pool.run(
        ShellConfig::shell("exit 1")
            .retries(3)
            .backoff(BackoffPolicy::constant(Duration::from_secs(30)))
            .build()
            .unwrap(),
    );

    let started = Instant::now();
    while count(&events.lock().unwrap(), EventKind::RetryAttempt) == 0 {
        assert!(started.elapsed() < Duration::from_secs(10), "no retry was scheduled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(handle.kill("stop", false));

    let err = assert_err!(handle.wait().await);
    assert!(matches!(err, ShellError::Killed { .. }));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(handle.state(), RunState::Killed);

    let events = events.lock().unwrap();
    assert_eq!(count(&events, EventKind::RunStarted), 1);
    assert_eq!(events.last().map(Event::kind), Some(EventKind::RunAfter));
}

#[test]
fn test_non_interactive_prompts_never_block() {
    let prompter = Prompter::new(PromptMode::NonInteractive, QuestionPatcher::default());
    assert!(!assert_ok!(prompter.confirm("deploy?", Some(false))));
    assert_eq!(assert_ok!(prompter.text("name?", Some("default-name"))), "default-name");
    let err = assert_err!(prompter.select("env?", &["dev", "prod"], None));
    assert!(matches!(err, PromptError::NoDefault { .. }));
}
