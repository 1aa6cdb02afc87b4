//! In-process read models for channels with no durable table.
//!
//! Typing sets, log rings, and the per-session registries (changed files,
//! tasks, branches, links) are populated by collaborators at runtime and die
//! with the process; their channels re-seed from empty snapshots.

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

use lab_protocol::views::{LogLine, LogsSnapshot};

/// Lines retained per (session, source) log ring.
const LOG_RING_CAPACITY: usize = 500;

/// Live, non-persisted channel state.
#[derive(Default)]
pub struct LiveStores {
    typing: DashMap<String, BTreeSet<String>>,
    logs: DashMap<String, BTreeMap<String, VecDeque<LogLine>>>,
    changed_files: DashMap<String, Vec<Value>>,
    tasks: DashMap<String, Vec<Value>>,
    branches: DashMap<String, Vec<Value>>,
    links: DashMap<String, Vec<Value>>,
    completed: DashMap<String, bool>,
}

impl LiveStores {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Apply a typing flag; returns the resulting user-id snapshot.
    pub fn set_typing(&self, session_id: &str, user_id: &str, typing: bool) -> Vec<String> {
        let mut entry = self.typing.entry(session_id.to_string()).or_default();
        if typing {
            entry.insert(user_id.to_string());
        } else {
            entry.remove(user_id);
        }
        entry.iter().cloned().collect()
    }

    pub fn typing_snapshot(&self, session_id: &str) -> Vec<String> {
        self.typing
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Logs
    // ------------------------------------------------------------------

    /// Append a log line, evicting the oldest when the ring is full.
    pub fn append_log(&self, session_id: &str, source: &str, line: impl Into<String>) -> LogLine {
        let log_line = LogLine {
            timestamp: Utc::now(),
            line: line.into(),
        };
        let mut sources = self.logs.entry(session_id.to_string()).or_default();
        let ring = sources.entry(source.to_string()).or_default();
        if ring.len() >= LOG_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(log_line.clone());
        log_line
    }

    pub fn logs_snapshot(&self, session_id: &str) -> LogsSnapshot {
        let Some(sources) = self.logs.get(session_id) else {
            return LogsSnapshot::default();
        };
        LogsSnapshot {
            sources: sources.keys().cloned().collect(),
            recent_logs: sources
                .iter()
                .map(|(source, ring)| (source.clone(), ring.iter().cloned().collect()))
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    pub fn changed_files(&self, session_id: &str) -> Vec<Value> {
        self.cloned(&self.changed_files, session_id)
    }

    pub fn tasks(&self, session_id: &str) -> Vec<Value> {
        self.cloned(&self.tasks, session_id)
    }

    pub fn branches(&self, session_id: &str) -> Vec<Value> {
        self.cloned(&self.branches, session_id)
    }

    pub fn links(&self, session_id: &str) -> Vec<Value> {
        self.cloned(&self.links, session_id)
    }

    pub fn set_changed_files(&self, session_id: &str, items: Vec<Value>) {
        self.changed_files.insert(session_id.to_string(), items);
    }

    pub fn set_tasks(&self, session_id: &str, items: Vec<Value>) {
        self.tasks.insert(session_id.to_string(), items);
    }

    pub fn set_branches(&self, session_id: &str, items: Vec<Value>) {
        self.branches.insert(session_id.to_string(), items);
    }

    pub fn set_links(&self, session_id: &str, items: Vec<Value>) {
        self.links.insert(session_id.to_string(), items);
    }

    fn cloned(&self, map: &DashMap<String, Vec<Value>>, session_id: &str) -> Vec<Value> {
        map.get(session_id)
            .map(|items| items.clone())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------

    pub fn set_completed(&self, session_id: &str, completed: bool) {
        self.completed.insert(session_id.to_string(), completed);
    }

    pub fn is_completed(&self, session_id: &str) -> bool {
        self.completed
            .get(session_id)
            .map(|flag| *flag)
            .unwrap_or(false)
    }

    /// Drop every live record for a session (teardown).
    pub fn forget_session(&self, session_id: &str) {
        self.typing.remove(session_id);
        self.logs.remove(session_id);
        self.changed_files.remove(session_id);
        self.tasks.remove(session_id);
        self.branches.remove(session_id);
        self.links.remove(session_id);
        self.completed.remove(session_id);
    }
}
