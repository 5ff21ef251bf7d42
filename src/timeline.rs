//! Audit timeline of administrative events

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ProxyAction,
    Configuration,
    System,
    Error,
    HostMapping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: EventType,
    pub action: String,
    pub details: String,
    pub timestamp: DateTime<Utc>,
    pub status: EventStatus,
    pub actor: String,
    pub duration: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
}

struct Events {
    entries: VecDeque<TimelineEvent>,
    next_id: u64,
}

/// Append-only event log with dense ids starting at 0.
///
/// The id counter lives under the same lock as the storage, so ids follow
/// append order exactly and are never handed out twice. With a capacity
/// set, the oldest events are dropped; ids keep counting.
pub struct TimelineEventLog {
    events: RwLock<Events>,
    capacity: Option<usize>,
}

impl Default for TimelineEventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl TimelineEventLog {
    /// Unbounded log
    pub fn new() -> Self {
        Self {
            events: RwLock::new(Events {
                entries: VecDeque::new(),
                next_id: 0,
            }),
            capacity: None,
        }
    }

    /// Log that keeps at most `capacity` events
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity.max(1)),
            ..Self::new()
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &self,
        kind: EventType,
        action: impl Into<String>,
        details: impl Into<String>,
        status: EventStatus,
        actor: impl Into<String>,
        duration: impl Into<String>,
        profile_name: Option<&str>,
    ) -> u64 {
        let timestamp = Utc::now();
        let mut events = self.events.write();
        let id = events.next_id;
        events.next_id += 1;

        events.entries.push_back(TimelineEvent {
            id,
            kind,
            action: action.into(),
            details: details.into(),
            timestamp,
            status,
            actor: actor.into(),
            duration: duration.into(),
            profile_name: profile_name.map(str::to_string),
        });
        if let Some(capacity) = self.capacity {
            while events.entries.len() > capacity {
                events.entries.pop_front();
            }
        }
        id
    }

    pub fn all(&self) -> Vec<TimelineEvent> {
        self.events.read().entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.events.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Render an elapsed time for the `duration` field
pub fn format_duration(elapsed: std::time::Duration) -> String {
    if elapsed.as_secs() >= 1 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else {
        format!("{}ms", elapsed.as_millis())
    }
}
