//! Console - live output of runs, paused while a question is asked

use crate::core::{Event, EventBus, EventFilter, EventPayload, RunId, RunState, Subscription};
use crossterm::style::Stylize;
use std::collections::HashMap;
use std::io::{self, IsTerminal, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

struct ConsoleInner {
    out: Box<dyn Write + Send>,
    styled: bool,
    json: bool,
    paused: usize,
    buffered: Vec<String>,
    prefixes: HashMap<RunId, String>,
}

impl ConsoleInner {
    fn write(&mut self, text: String) {
        if self.paused > 0 {
            self.buffered.push(text);
            return;
        }
        if let Err(e) = writeln!(self.out, "{}", text).and_then(|_| self.out.flush()) {
            log::warn!("Console write failed: {}", e);
        }
    }
}

/// Shared handle to the output console.
///
/// Clones write to the same output and share the pause state.
#[derive(Clone)]
pub struct Console {
    inner: Arc<Mutex<ConsoleInner>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Console")
            .field("json", &inner.json)
            .field("paused", &inner.paused)
            .finish()
    }
}

impl Console {
    pub fn new(out: impl Write + Send + 'static, styled: bool, json: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ConsoleInner {
                out: Box::new(out),
                styled,
                json,
                paused: 0,
                buffered: Vec::new(),
                prefixes: HashMap::new(),
            })),
        }
    }

    /// Console on stdout, styled when stdout is a terminal
    pub fn stdout(json: bool) -> Self {
        let styled = !json && io::stdout().is_terminal();
        Self::new(io::stdout(), styled, json)
    }

    /// Unstyled console writing to memory
    pub fn capture() -> (Self, CapturedOutput) {
        let output = CapturedOutput::default();
        (Self::new(output.clone(), false, false), output)
    }

    pub fn is_json(&self) -> bool {
        self.lock().json
    }

    /// Write one line, buffered while paused
    pub fn line(&self, text: &str) {
        self.lock().write(text.to_string());
    }

    pub fn warn(&self, text: &str) {
        let mut inner = self.lock();
        let text = if inner.styled {
            text.yellow().to_string()
        } else {
            text.to_string()
        };
        inner.write(text);
    }

    /// Hold output back until the returned guard is dropped
    pub fn pause(&self) -> ConsolePause {
        self.lock().paused += 1;
        ConsolePause {
            console: self.clone(),
        }
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused > 0
    }

    /// Render every run event published on `bus`
    pub fn attach(&self, bus: &EventBus) -> Subscription {
        let console = self.clone();
        bus.subscribe(EventFilter::All, move |event| console.render(event))
    }

    fn render(&self, event: &Event) {
        let mut inner = self.lock();
        if inner.json {
            match event.to_json() {
                Ok(json) => inner.write(json),
                Err(e) => log::warn!("Failed to serialize event {}: {}", event.seq, e),
            }
            return;
        }

        let styled = inner.styled;
        let prefix = inner
            .prefixes
            .get(&event.run_id)
            .cloned()
            .unwrap_or_else(|| event.run_id.to_string());
        let text = match &event.payload {
            EventPayload::RunBefore {
                print_prefix,
                command,
            } => {
                inner.prefixes.insert(event.run_id, print_prefix.clone());
                let line = format!("{} $ {}", print_prefix, command);
                if styled {
                    line.dark_grey().to_string()
                } else {
                    line
                }
            }
            EventPayload::RunStarted { .. } => return,
            EventPayload::StdOutput { line } => format!("{} {}", tag(&prefix, styled), line),
            EventPayload::StdErr { line } if styled => {
                format!("{} {}", tag(&prefix, styled), line.as_str().red())
            }
            EventPayload::StdErr { line } => format!("{} {}", tag(&prefix, styled), line),
            EventPayload::ReadError { stream, error } => {
                let line = format!("{} error reading {}: {}", prefix, stream, error);
                if styled {
                    line.red().to_string()
                } else {
                    line
                }
            }
            EventPayload::RetryAttempt { attempt } => {
                let line = format!("{} retry attempt {}", prefix, attempt);
                if styled {
                    line.yellow().to_string()
                } else {
                    line
                }
            }
            EventPayload::RunAfter(info) => {
                inner.prefixes.remove(&event.run_id);
                let status = match (info.state, info.exit_code) {
                    (RunState::Succeeded, _) => "done".to_string(),
                    (state, Some(code)) => format!("{} (exit code {})", state, code),
                    (state, None) => state.to_string(),
                };
                let line = format!("{} {}", prefix, status);
                match (styled, info.state) {
                    (false, _) => line,
                    (true, RunState::Succeeded) => line.green().to_string(),
                    (true, _) => line.red().to_string(),
                }
            }
        };
        inner.write(text);
    }

    fn lock(&self) -> MutexGuard<'_, ConsoleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn tag(prefix: &str, styled: bool) -> String {
    let tag = format!("[{}]", prefix);
    if styled {
        tag.cyan().to_string()
    } else {
        tag
    }
}

/// Scoped pause of a [`Console`]; buffered lines are written on drop
#[must_use = "the console resumes as soon as the guard is dropped"]
pub struct ConsolePause {
    console: Console,
}

impl Drop for ConsolePause {
    fn drop(&mut self) {
        let mut inner = self.console.lock();
        inner.paused = inner.paused.saturating_sub(1);
        if inner.paused == 0 {
            let buffered = std::mem::take(&mut inner.buffered);
            for text in buffered {
                inner.write(text);
            }
        }
    }
}

/// In-memory console output
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl CapturedOutput {
    pub fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&bytes).to_string()
    }
}

impl Write for CapturedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunAfterInfo, Stream};

    #[test]
    fn test_renders_run_events_with_prefix() {
        let (console, output) = Console::capture();
        let bus = EventBus::new();
        let _sub = console.attach(&bus);
        let id = RunId(42);

        bus.emit(
            id,
            EventPayload::RunBefore {
                print_prefix: "tmp/dir ls".to_string(),
                command: "ls -la".to_string(),
            },
        );
        bus.emit(id, EventPayload::RunStarted { attempt: 1, pid: Some(7) });
        bus.emit(id, EventPayload::StdOutput { line: "file".to_string() });
        bus.emit(
            id,
            EventPayload::ReadError {
                stream: Stream::Stderr,
                error: "broken pipe".to_string(),
            },
        );
        bus.emit(id, EventPayload::RetryAttempt { attempt: 2 });
        bus.emit(
            id,
            EventPayload::RunAfter(RunAfterInfo {
                state: RunState::Failed,
                exit_code: Some(2),
                attempts: 2,
                error: None,
            }),
        );

        let lines: Vec<String> = output.contents().lines().map(str::to_string).collect();
        assert_eq!(
            lines,
            vec![
                "tmp/dir ls $ ls -la",
                "[tmp/dir ls] file",
                "tmp/dir ls error reading stderr: broken pipe",
                "tmp/dir ls retry attempt 2",
                "tmp/dir ls failed (exit code 2)",
            ]
        );
    }

    #[test]
    fn test_json_mode_writes_one_event_per_line() {
        let output = CapturedOutput::default();
        let console = Console::new(output.clone(), false, true);
        let bus = EventBus::new();
        let _sub = console.attach(&bus);

        bus.emit(RunId(1), EventPayload::StdErr { line: "warn".to_string() });

        let contents = output.contents();
        let event: Event = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(event.payload, EventPayload::StdErr { line: "warn".to_string() });
    }

    #[test]
    fn test_nested_pauses_flush_once() {
        let (console, output) = Console::capture();
        let outer = console.pause();
        let inner = console.pause();
        console.line("held");
        drop(inner);
        assert!(console.is_paused());
        assert_eq!(output.contents(), "");
        drop(outer);
        assert_eq!(output.contents(), "held\n");
    }
}
