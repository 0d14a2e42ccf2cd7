//! In-process pub/sub for dispatch lifecycle events.
//!
//! Analogous to `rlm_core::trajectory`'s event stream, but addressed at the
//! dispatch/orchestration lifecycle instead of RLM recursion: `TASK_STARTED`,
//! `STEP_DONE`, `BUDGET_EXCEEDED`, and friends rather than `REPL_EXEC`/`REASON`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Typed lifecycle event kinds published on the `EventBus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskStarted,
    TaskCompleted,
    StepStarted,
    StepDone,
    AgentActivity,
    BudgetExceeded,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TaskStarted => "TASK_STARTED",
            Self::TaskCompleted => "TASK_COMPLETED",
            Self::StepStarted => "STEP_STARTED",
            Self::StepDone => "STEP_DONE",
            Self::AgentActivity => "AGENT_ACTIVITY",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
        };
        write!(f, "{s}")
    }
}

/// A single event moving through the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchEvent {
    pub kind: EventKind,
    pub ts: DateTime<Utc>,
    pub data: Value,
}

impl DispatchEvent {
    pub fn new(kind: EventKind, data: Value) -> Self {
        Self {
            kind,
            ts: Utc::now(),
            data,
        }
    }

    pub fn with_fields(kind: EventKind, fields: HashMap<String, Value>) -> Self {
        Self::new(kind, Value::Object(fields.into_iter().collect()))
    }
}

/// A minimal in-process publish/subscribe bus.
///
/// Subscribers are unbounded mpsc channels; a subscriber whose receiver has
/// been dropped is pruned the next time `publish` runs rather than treated
/// as an error, so a failing or disinterested subscriber never affects the
/// publisher. No event is ever persisted.
pub struct EventBus {
    subscribers: Mutex<Vec<(u64, UnboundedSender<DispatchEvent>)>>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new subscriber, returning its id (for `unsubscribe`) and a
    /// receiver that yields events in publication order.
    pub fn subscribe(&self) -> (u64, UnboundedReceiver<DispatchEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .push((id, tx));
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("event bus mutex poisoned")
            .retain(|(sub_id, _)| *sub_id != id);
    }

    /// Publish an event to every live subscriber, fire-and-forget. Closed
    /// channels are pruned silently.
    pub fn publish(&self, event: DispatchEvent) {
        let mut subs = self.subscribers.lock().expect("event bus mutex poisoned");
        subs.retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().expect("event bus mutex poisoned").len()
    }
}
