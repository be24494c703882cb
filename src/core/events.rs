//! Event bus - typed run lifecycle events with synchronous delivery
//!
//! Handlers run on the task that publishes the event, so events of one run
//! reach every subscriber in the order the runner produced them. Each
//! subscription returns a [`Subscription`] that unsubscribes when dropped.

use super::run::RunId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// Output stream of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stream {
    Stdout,
    Stderr,
}

impl fmt::Display for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// Terminal outcome carried by [`EventPayload::RunAfter`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAfterInfo {
    pub state: super::run::RunState,
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Event payloads, tagged for JSON streaming
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Run is about to launch its first attempt
    RunBefore { print_prefix: String, command: String },
    /// An attempt has a live process
    RunStarted { attempt: u32, pid: Option<u32> },
    /// Line written to stdout
    StdOutput { line: String },
    /// Line written to stderr
    StdErr { line: String },
    /// Reading one of the streams failed
    ReadError { stream: Stream, error: String },
    /// A failed attempt is being retried, `attempt` is the upcoming one
    RetryAttempt { attempt: u32 },
    /// Run reached a terminal state
    RunAfter(RunAfterInfo),
}

/// Discriminant of [`EventPayload`], used for subscription filters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RunBefore,
    RunStarted,
    StdOutput,
    StdErr,
    ReadError,
    RetryAttempt,
    RunAfter,
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RunBefore { .. } => EventKind::RunBefore,
            Self::RunStarted { .. } => EventKind::RunStarted,
            Self::StdOutput { .. } => EventKind::StdOutput,
            Self::StdErr { .. } => EventKind::StdErr,
            Self::ReadError { .. } => EventKind::ReadError,
            Self::RetryAttempt { .. } => EventKind::RetryAttempt,
            Self::RunAfter(_) => EventKind::RunAfter,
        }
    }

    /// Output line and its stream, for the two output variants
    pub fn output_line(&self) -> Option<(&str, Stream)> {
        match self {
            Self::StdOutput { line } => Some((line, Stream::Stdout)),
            Self::StdErr { line } => Some((line, Stream::Stderr)),
            _ => None,
        }
    }
}

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Immutable notification of a run lifecycle occurrence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Process-wide publication order
    pub seq: u64,
    pub run_id: RunId,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(run_id: RunId, payload: EventPayload) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, Ordering::Relaxed),
            run_id,
            at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Which events a handler receives
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    #[default]
    All,
    Kinds(Vec<EventKind>),
    Run(RunId),
}

impl EventFilter {
    pub fn kinds(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self::Kinds(kinds.into_iter().collect())
    }

    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::All => true,
            Self::Kinds(kinds) => kinds.contains(&event.kind()),
            Self::Run(run_id) => *run_id == event.run_id,
        }
    }
}

/// Handler that returns `true` once it wants to be removed
type Handler = dyn Fn(&Event) -> bool + Send + Sync;

struct Entry {
    id: u64,
    filter: EventFilter,
    handler: Arc<Handler>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    entries: Vec<Entry>,
}

/// Publish/subscribe channel for [`Event`]s.
///
/// Cloning is cheap and every clone shares the same subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for events matching `filter`
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.subscribe_until(filter, move |event| {
            handler(event);
            false
        })
    }

    /// Register a handler that is removed after it returns `true`
    pub fn subscribe_until<F>(&self, filter: EventFilter, handler: F) -> Subscription
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        registry.next_id += 1;
        let id = registry.next_id;
        registry.entries.push(Entry {
            id,
            filter,
            handler: Arc::new(handler),
        });

        Subscription {
            id,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver an event to every matching handler on the calling task
    pub fn publish(&self, event: Event) {
        // Snapshot so handlers may subscribe or unsubscribe while running
        let handlers: Vec<(u64, Arc<Handler>)> = self
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.filter.matches(&event))
            .map(|entry| (entry.id, entry.handler.clone()))
            .collect();

        let done: Vec<u64> = handlers
            .into_iter()
            .filter(|(_, handler)| handler(&event))
            .map(|(id, _)| id)
            .collect();

        if !done.is_empty() {
            self.lock().entries.retain(|entry| !done.contains(&entry.id));
        }
    }

    pub fn emit(&self, run_id: RunId, payload: EventPayload) {
        self.publish(Event::new(run_id, payload));
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().entries.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Disposable handle of a bus subscription
#[must_use = "dropping a Subscription unsubscribes its handler"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Remove the handler now
    pub fn unsubscribe(self) {}

    /// Keep the handler registered for the lifetime of the bus
    pub fn detach(self) {
        std::mem::forget(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entries
                .retain(|entry| entry.id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collector(bus: &EventBus, filter: EventFilter) -> (Arc<Mutex<Vec<Event>>>, Subscription) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let sub = bus.subscribe(filter, move |event| sink.lock().unwrap().push(event.clone()));
        (seen, sub)
    }

    #[test]
    fn test_filter_by_kind() {
        let bus = EventBus::new();
        let (seen, _sub) = collector(&bus, EventFilter::kinds([EventKind::StdOutput]));

        bus.emit(RunId(1), EventPayload::StdOutput { line: "hi".to_string() });
        bus.emit(RunId(1), EventPayload::StdErr { line: "oops".to_string() });

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload.output_line(), Some(("hi", Stream::Stdout)));
    }

    #[test]
    fn test_filter_by_run() {
        let bus = EventBus::new();
        let (seen, _sub) = collector(&bus, EventFilter::Run(RunId(7)));

        bus.emit(RunId(6), EventPayload::RetryAttempt { attempt: 2 });
        bus.emit(RunId(7), EventPayload::RetryAttempt { attempt: 2 });

        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = EventBus::new();
        let (seen, sub) = collector(&bus, EventFilter::All);
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        bus.emit(RunId(1), EventPayload::RetryAttempt { attempt: 2 });

        assert_eq!(bus.subscriber_count(), 0);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn test_subscribe_until_removes_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(Mutex::new(0));
        let counter = calls.clone();
        let _sub = bus.subscribe_until(EventFilter::All, move |_| {
            let mut calls = counter.lock().unwrap();
            *calls += 1;
            *calls == 2
        });

        for attempt in 0..5 {
            bus.emit(RunId(1), EventPayload::RetryAttempt { attempt });
        }

        assert_eq!(*calls.lock().unwrap(), 2);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_handler_can_subscribe_during_publish() {
        let bus = EventBus::new();
        let inner_bus = bus.clone();
        let _sub = bus.subscribe(EventFilter::All, move |_| {
            inner_bus.subscribe(EventFilter::All, |_| {}).detach();
        });

        bus.emit(RunId(1), EventPayload::RetryAttempt { attempt: 2 });
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_sequence_is_increasing() {
        let first = Event::new(RunId(1), EventPayload::RetryAttempt { attempt: 2 });
        let second = Event::new(RunId(1), EventPayload::RetryAttempt { attempt: 3 });
        assert!(second.seq > first.seq);
    }

    #[test]
    fn test_event_json_shape() {
        let event = Event::new(RunId(3), EventPayload::StdOutput { line: "done".to_string() });
        let json = event.to_json().unwrap();
        assert!(json.contains("\"type\":\"std_output\""));
        assert!(json.contains("\"run_id\":3"));

        let parsed: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.payload, event.payload);
    }
}
