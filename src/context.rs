//! AskShell context - owns settings, event bus, console, prompter and pool

use crate::console::Console;
use crate::core::{EventBus, RunHandle, RunPool, Runner, ShellConfig, ShellRun, Subscription};
use crate::error::ShellError;
use crate::interactive::Prompter;
use crate::settings::AskShellSettings;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Everything a program needs to run commands and ask questions.
///
/// The console renders every event of the context's bus for as long as the
/// context lives.
pub struct AskShell {
    settings: Arc<AskShellSettings>,
    bus: EventBus,
    console: Console,
    prompter: Prompter,
    pool: RunPool,
    _console_subscription: Subscription,
}

impl std::fmt::Debug for AskShell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AskShell")
            .field("settings", &self.settings)
            .field("prompter", &self.prompter)
            .finish()
    }
}

impl AskShell {
    /// Context on stdout with a terminal prompter
    pub fn new(settings: AskShellSettings) -> Self {
        let console = Console::stdout(settings.event_log_json);
        let prompter = Prompter::from_settings(&settings).with_console(console.clone());
        Self::with_parts(settings, console, prompter)
    }

    /// Settings from the settings file and environment
    pub fn load() -> Result<Self> {
        let settings = AskShellSettings::load().context("Failed to load ask-shell settings")?;
        Ok(Self::new(settings))
    }

    /// Context with an explicit console and prompter, e.g. for tests
    pub fn with_parts(settings: AskShellSettings, console: Console, prompter: Prompter) -> Self {
        let settings = Arc::new(settings);
        let bus = EventBus::new();
        let runner = Runner::new(bus.clone(), settings.clone());
        let pool = RunPool::new(runner);
        let console_subscription = console.attach(&bus);

        Self {
            settings,
            bus,
            console,
            prompter,
            pool,
            _console_subscription: console_subscription,
        }
    }

    pub fn settings(&self) -> &AskShellSettings {
        &self.settings
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn console(&self) -> &Console {
        &self.console
    }

    pub fn prompter(&self) -> &Prompter {
        &self.prompter
    }

    pub fn pool(&self) -> &RunPool {
        &self.pool
    }

    /// Schedule a run on the context pool
    pub fn run(&self, config: ShellConfig) -> RunHandle {
        self.pool.run(config)
    }

    /// Schedule a run and wait for it to complete
    pub async fn run_and_wait(&self, config: ShellConfig) -> Result<Arc<ShellRun>, ShellError> {
        self.run(config).wait().await
    }

    /// Stop every run of the context pool
    pub async fn shutdown(&self, reason: &str) -> usize {
        let killed = self.pool.kill_all_runs(reason, false).await;
        if killed > 0 {
            self.console.warn(&format!("stopped {} run(s): {}", killed, reason));
        }
        killed
    }
}
