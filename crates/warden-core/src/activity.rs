//! Activity log emitter.
//!
//! Every connection, request, filter and flex decision is appended here with
//! a reason code. Sinks are pluggable; the proxy usually fans out to a
//! tracing sink and the SQLite log in `warden-storage`.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::decision::Reason;

/// Which component produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Connection,
    Request,
    Filter,
    Flex,
}

impl Stage {
    /// Returns the stage name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Connection => "connection",
            Stage::Request => "request",
            Stage::Filter => "filter",
            Stage::Flex => "flex",
        }
    }

    /// Parses a stage name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "connection" => Some(Stage::Connection),
            "request" => Some(Stage::Request),
            "filter" => Some(Stage::Filter),
            "flex" => Some(Stage::Flex),
            _ => None,
        }
    }
}

/// One logged decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub at: DateTime<Utc>,
    pub stage: Stage,
    pub client: String,
    pub target: String,
    /// What was done, e.g. `passthru`, `block`, `abort_not_found`.
    pub action: String,
    pub reason: Reason,
}

impl ActivityEvent {
    /// Creates an event stamped with the current time.
    pub fn new(
        stage: Stage,
        client: impl Into<String>,
        target: impl Into<String>,
        action: impl Into<String>,
        reason: Reason,
    ) -> Self {
        Self {
            at: Utc::now(),
            stage,
            client: client.into(),
            target: target.into(),
            action: action.into(),
            reason,
        }
    }
}

/// Append-only sink for activity events.
pub trait ActivityLog: Send + Sync {
    /// Appends an event. Sinks must not fail the caller.
    fn record(&self, event: ActivityEvent);
}

/// Bounded in-memory log, newest last.
#[derive(Debug)]
pub struct MemoryActivityLog {
    events: RwLock<VecDeque<ActivityEvent>>,
    capacity: usize,
}

impl MemoryActivityLog {
    /// Default number of retained events.
    pub const DEFAULT_CAPACITY: usize = 10_000;

    /// Creates a log with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a log that keeps at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Returns a copy of the retained events.
    pub fn events(&self) -> Vec<ActivityEvent> {
        self.events.read().iter().cloned().collect()
    }

    /// Returns the most recent event.
    pub fn last(&self) -> Option<ActivityEvent> {
        self.events.read().back().cloned()
    }

    /// Counts retained events with the given reason.
    pub fn count_reason(&self, reason: Reason) -> usize {
        self.events.read().iter().filter(|e| e.reason == reason).count()
    }

    /// Number of retained events.
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// True if nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

impl Default for MemoryActivityLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityLog for MemoryActivityLog {
    fn record(&self, event: ActivityEvent) {
        let mut events = self.events.write();
        if events.len() == self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }
}

/// Emits each event as a structured tracing event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingActivityLog;

impl ActivityLog for TracingActivityLog {
    fn record(&self, event: ActivityEvent) {
        tracing::info!(
            target: "warden::activity",
            stage = event.stage.as_str(),
            client = %event.client,
            target_host = %event.target,
            action = %event.action,
            reason = event.reason.as_str(),
            "activity"
        );
    }
}

/// Forwards every event to several sinks.
#[derive(Clone, Default)]
pub struct FanoutActivityLog {
    sinks: Vec<Arc<dyn ActivityLog>>,
}

impl FanoutActivityLog {
    /// Creates an empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    pub fn with_sink(mut self, sink: Arc<dyn ActivityLog>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanoutActivityLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutActivityLog")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ActivityLog for FanoutActivityLog {
    fn record(&self, event: ActivityEvent) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.record(event.clone());
            }
            last.record(event);
        }
    }
}
