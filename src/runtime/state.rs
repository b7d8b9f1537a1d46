//! Per-script runtime records: status, UI elements and the log ring.
//!
//! Records outlive the hosts that write them so the last error and the log
//! stay visible after a script stops. They are dropped only when the script
//! itself is deleted.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use super::protocol::LogLevel;
use super::ui::ScriptUiElement;

/// Marker appended to truncated log messages.
pub const TRUNCATION_MARKER: &str = " …[truncated]";

/// Lifecycle status of a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    /// Never started (or records reset).
    #[default]
    Idle,
    /// An Execution Host exists.
    Running,
    /// Clean exit or explicit stop.
    Stopped,
    /// Compile failure or uncaught error.
    Error,
}

/// Transient state of one script.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptRuntimeState {
    /// Current status.
    pub status: ScriptStatus,
    /// Last start, epoch milliseconds.
    pub started_at: Option<i64>,
    /// Last stop, epoch milliseconds.
    pub stopped_at: Option<i64>,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Elements declared by the running (or last) instance.
    pub ui: Vec<ScriptUiElement>,
    /// Incremented on every start; tags lifecycle notifications.
    pub instance_id: u64,
}

/// Who produced a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// `log.*` inside the script.
    Script,
    /// The runtime, on the script's behalf.
    Host,
}

/// One immutable log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptLogEntry {
    /// Monotonic per-script sequence number.
    pub id: u64,
    /// Epoch milliseconds.
    pub timestamp: i64,
    /// Severity.
    pub level: LogLevel,
    /// Producer.
    pub source: LogSource,
    /// Possibly truncated text.
    pub message: String,
}

/// Bounded log buffer; oldest entries are evicted first.
#[derive(Debug, Clone)]
pub struct LogRing {
    entries: VecDeque<ScriptLogEntry>,
    capacity: usize,
    next_id: u64,
}

impl LogRing {
    /// Empty ring holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
            next_id: 1,
        }
    }

    /// Append an entry, evicting the oldest one when full.
    pub fn push(&mut self, level: LogLevel, source: LogSource, message: String) -> &ScriptLogEntry {
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        let entry = ScriptLogEntry {
            id: self.next_id,
            timestamp: chrono::Utc::now().timestamp_millis(),
            level,
            source,
            message,
        };
        self.next_id += 1;
        self.entries.push_back(entry);
        &self.entries[self.entries.len() - 1]
    }

    /// Entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<ScriptLogEntry> {
        self.entries.iter().cloned().collect()
    }

    /// Number of entries held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry (ids keep counting).
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Cut `message` to `max_chars` characters plus [`TRUNCATION_MARKER`].
#[must_use]
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATION_MARKER}", &message[..cut]),
        None => message.to_string(),
    }
}

/// All per-script records, keyed by script id.
#[derive(Debug)]
pub struct RuntimeRecords {
    states: HashMap<String, ScriptRuntimeState>,
    logs: HashMap<String, LogRing>,
    max_log_entries: usize,
    max_log_message_len: usize,
}

impl RuntimeRecords {
    /// Empty records with the given log limits.
    #[must_use]
    pub fn new(max_log_entries: usize, max_log_message_len: usize) -> Self {
        Self {
            states: HashMap::new(),
            logs: HashMap::new(),
            max_log_entries,
            max_log_message_len,
        }
    }

    /// State for `id` (default `idle` when never started).
    #[must_use]
    pub fn state(&self, id: &str) -> ScriptRuntimeState {
        self.states.get(id).cloned().unwrap_or_default()
    }

    /// Mutable state for `id`, created on demand.
    pub fn state_mut(&mut self, id: &str) -> &mut ScriptRuntimeState {
        self.states.entry(id.to_string()).or_default()
    }

    /// Append a log line for `id`, truncating and mirroring it to the `log` facade.
    pub fn append_log(&mut self, id: &str, level: LogLevel, source: LogSource, message: &str) {
        let message = truncate_message(message, self.max_log_message_len);
        match source {
            LogSource::Script => log::log!(target: "script", level.as_log_level(), "[{id}] {message}"),
            LogSource::Host => log::log!(level.as_log_level(), "[runtime] [{id}] {message}"),
        }
        let capacity = self.max_log_entries;
        self.logs
            .entry(id.to_string())
            .or_insert_with(|| LogRing::new(capacity))
            .push(level, source, message);
    }

    /// Log entries for `id`, oldest first.
    #[must_use]
    pub fn logs(&self, id: &str) -> Vec<ScriptLogEntry> {
        self.logs.get(id).map(LogRing::entries).unwrap_or_default()
    }

    /// Clear the log ring of `id`.
    pub fn clear_logs(&mut self, id: &str) {
        if let Some(ring) = self.logs.get_mut(id) {
            ring.clear();
        }
    }

    /// Forget everything about `id`.
    pub fn purge(&mut self, id: &str) {
        self.states.remove(id);
        self.logs.remove(id);
    }

    /// Ids with any record.
    #[must_use]
    pub fn known_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.keys().chain(self.logs.keys()).cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Records shared between the manager, hosts and bridge handlers.
pub type SharedRecords = Arc<Mutex<RuntimeRecords>>;

/// Create shared records.
#[must_use]
pub fn new_shared_records(max_log_entries: usize, max_log_message_len: usize) -> SharedRecords {
    Arc::new(Mutex::new(RuntimeRecords::new(max_log_entries, max_log_message_len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_evicts_oldest() {
        let mut ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(LogLevel::Info, LogSource::Script, format!("m{i}"));
        }
        let entries = ring.entries();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "m2");
        assert_eq!(entries[2].id, 5);
    }

    #[test]
    fn test_truncate_message() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("abcdef", 3), format!("abc{TRUNCATION_MARKER}"));
        // Counts characters, not bytes.
        assert_eq!(truncate_message("ééé", 2), format!("éé{TRUNCATION_MARKER}"));
    }

    #[test]
    fn test_records_append_and_purge() {
        let mut records = RuntimeRecords::new(10, 5);
        records.append_log("a", LogLevel::Warn, LogSource::Host, "permissions changed");
        let logs = records.logs("a");
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, format!("permi{TRUNCATION_MARKER}"));
        assert_eq!(logs[0].source, LogSource::Host);

        records.state_mut("a").status = ScriptStatus::Running;
        assert_eq!(records.state("a").status, ScriptStatus::Running);
        assert_eq!(records.state("b").status, ScriptStatus::Idle);

        records.purge("a");
        assert!(records.logs("a").is_empty());
        assert!(records.known_ids().is_empty());
    }
}
