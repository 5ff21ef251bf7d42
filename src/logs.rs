//! Bounded in-memory log buffer
//!
//! Every component reports through a shared [`LogAggregator`]. Entries are
//! kept in arrival order and evicted oldest-first once the buffer is full.
//! Each entry is also mirrored to `tracing` so the process log carries the
//! same stream.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Default number of entries kept in memory
pub const DEFAULT_CAPACITY: usize = 1000;

/// Severity of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Component that produced a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    System,
    Api,
    Worker,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::System => "system",
            LogSource::Api => "api",
            LogSource::Worker => "worker",
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub source: LogSource,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_name: Option<String>,
}

struct Buffer {
    entries: VecDeque<LogEntry>,
    last_id: i64,
}

/// Thread-safe, bounded, append-only log buffer.
///
/// Reads take a shared lock and return owned copies, so callers never see
/// the internal buffer. Writes take the exclusive lock for the id
/// assignment, the push and the eviction together.
pub struct LogAggregator {
    buffer: RwLock<Buffer>,
    capacity: usize,
}

impl Default for LogAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LogAggregator {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: RwLock::new(Buffer {
                entries: VecDeque::with_capacity(capacity),
                last_id: 0,
            }),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append an entry and return its id.
    ///
    /// Ids come from the wall clock in nanoseconds; a clock that has not
    /// advanced (or went backwards) yields `previous + 1` instead.
    pub fn append(
        &self,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
        profile_id: Option<i64>,
        profile_name: Option<&str>,
    ) -> i64 {
        let message = message.into();
        mirror_to_tracing(level, source, &message, profile_id, profile_name);

        let timestamp = Utc::now();
        let mut buffer = self.buffer.write();
        let clock = timestamp.timestamp_nanos_opt().unwrap_or(i64::MAX);
        let id = clock.max(buffer.last_id.saturating_add(1));
        buffer.last_id = id;

        buffer.entries.push_back(LogEntry {
            id,
            timestamp,
            level,
            source,
            message,
            profile_id,
            profile_name: profile_name.map(str::to_string),
        });
        while buffer.entries.len() > self.capacity {
            buffer.entries.pop_front();
        }
        id
    }

    /// Append an entry with no profile attached
    pub fn record(&self, level: LogLevel, source: LogSource, message: impl Into<String>) -> i64 {
        self.append(level, source, message, None, None)
    }

    /// Append an entry attributed to a profile
    pub fn record_for(
        &self,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
        profile_id: i64,
        profile_name: &str,
    ) -> i64 {
        self.append(level, source, message, Some(profile_id), Some(profile_name))
    }

    pub fn all(&self) -> Vec<LogEntry> {
        self.buffer.read().entries.iter().cloned().collect()
    }

    /// The last `n` entries in arrival order, or everything if `n` covers the buffer
    pub fn recent(&self, n: usize) -> Vec<LogEntry> {
        let buffer = self.buffer.read();
        let skip = buffer.entries.len().saturating_sub(n);
        buffer.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries of one level; `"ALL"` matches everything. Case-insensitive.
    pub fn by_level(&self, level: &str) -> Vec<LogEntry> {
        let wanted = level.trim().to_ascii_uppercase();
        if wanted == "ALL" {
            return self.all();
        }
        self.buffer
            .read()
            .entries
            .iter()
            .filter(|e| e.level.as_str() == wanted)
            .cloned()
            .collect()
    }

    /// Entries of one source; `"all"` matches everything. Case-insensitive.
    pub fn by_source(&self, source: &str) -> Vec<LogEntry> {
        let wanted = source.trim().to_ascii_lowercase();
        if wanted == "all" {
            return self.all();
        }
        self.buffer
            .read()
            .entries
            .iter()
            .filter(|e| e.source.as_str() == wanted)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.buffer.write().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn mirror_to_tracing(
    level: LogLevel,
    source: LogSource,
    message: &str,
    profile_id: Option<i64>,
    profile_name: Option<&str>,
) {
    let source = source.as_str();
    match level {
        LogLevel::Debug => debug!(source, ?profile_id, ?profile_name, "{}", message),
        LogLevel::Info => info!(source, ?profile_id, ?profile_name, "{}", message),
        LogLevel::Warn => warn!(source, ?profile_id, ?profile_name, "{}", message),
        LogLevel::Error => error!(source, ?profile_id, ?profile_name, "{}", message),
    }
}

const ERROR_TOKENS: &[&str] = &["error", "failed", "fatal", "panic"];
const WARN_TOKENS: &[&str] = &["warn", "deprecated", "notice"];
const DEBUG_TOKENS: &[&str] = &["debug", "trace"];

/// Classify one line of worker output.
///
/// A JSON object with a string `level` field wins. Otherwise the line is
/// scanned case-insensitively for error, then warning, then debug tokens.
pub fn detect_log_level(line: &str) -> LogLevel {
    if let Ok(serde_json::Value::Object(record)) = serde_json::from_str(line) {
        if let Some(level) = record.get("level").and_then(|v| v.as_str()) {
            return match level.to_ascii_lowercase().as_str() {
                "debug" => LogLevel::Debug,
                "warn" | "warning" => LogLevel::Warn,
                "error" => LogLevel::Error,
                _ => LogLevel::Info,
            };
        }
    }

    let lower = line.to_ascii_lowercase();
    let has_any = |tokens: &[&str]| tokens.iter().any(|t| lower.contains(t));

    if has_any(ERROR_TOKENS) {
        LogLevel::Error
    } else if has_any(WARN_TOKENS) {
        LogLevel::Warn
    } else if has_any(DEBUG_TOKENS) {
        LogLevel::Debug
    } else {
        // Connection relay lines ("a <> b", established, closed) and the rest
        LogLevel::Info
    }
}
