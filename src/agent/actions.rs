use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    Success,
    Failed,
    Timeout,
    Decided,
}

impl ActionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionStatus::Success => "success",
            ActionStatus::Failed => "failed",
            ActionStatus::Timeout => "timeout",
            ActionStatus::Decided => "decided",
        }
    }
}

/// One recorded task outcome or autonomous decision.
#[derive(Debug, Clone, Serialize)]
pub struct ActionEntry {
    pub name: String,
    pub at: DateTime<Utc>,
    pub status: ActionStatus,
    /// Error text for failures, decision text for decided entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ActionEntry {
    fn new(name: &str, status: ActionStatus, detail: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            at: Utc::now(),
            status,
            detail,
        }
    }

    pub fn success(name: &str) -> Self {
        Self::new(name, ActionStatus::Success, None)
    }

    pub fn failed(name: &str, error: &str) -> Self {
        Self::new(name, ActionStatus::Failed, Some(error.to_string()))
    }

    pub fn timeout(name: &str, limit: Duration) -> Self {
        Self::new(
            name,
            ActionStatus::Timeout,
            Some(format!("Task exceeded {}s timeout", limit.as_secs())),
        )
    }

    pub fn decided(name: &str, decision: &str) -> Self {
        Self::new(name, ActionStatus::Decided, Some(decision.to_string()))
    }
}

/// Bounded ring buffer of recent outcomes, oldest entries dropped first.
#[derive(Debug)]
pub struct ActionLog {
    entries: VecDeque<ActionEntry>,
    capacity: usize,
}

impl ActionLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(128)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, entry: ActionEntry) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Last `n` entries, oldest of them first.
    pub fn recent(&self, n: usize) -> Vec<ActionEntry> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
