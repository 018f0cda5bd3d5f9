//! Work-queue task envelope.
//!
//! Tasks are stored as JSON inside queue lists, so the field names are part of the wire
//! contract shared with other producers and consumers.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// One audit-trail entry: `{event, time, ...details}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub event: String,
    /// Unix seconds.
    pub time: i64,
    #[serde(flatten)]
    pub details: Map<String, Value>,
}

impl HistoryEntry {
    pub fn now(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            time: OffsetDateTime::now_utc().unix_timestamp(),
            details: Map::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    #[serde(default)]
    pub data: Value,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
    /// Required on the wire; tasks without one are rejected on delivery.
    pub id: String,
    #[serde(default)]
    pub in_progress_queue: Option<String>,
    #[serde(default)]
    pub in_progress_queue_exp: Option<u64>,
    #[serde(default)]
    pub success_queue: Option<String>,
    #[serde(default)]
    pub success_queue_exp: Option<u64>,
    #[serde(default)]
    pub failure_queue: Option<String>,
    #[serde(default)]
    pub failure_queue_exp: Option<u64>,
    #[serde(default)]
    pub retry_limit: u32,
    #[serde(rename = "_currentRetries", default)]
    pub current_retries: u32,
    #[serde(default)]
    pub return_limit: u32,
    #[serde(rename = "_currentReturns", default)]
    pub current_returns: u32,
    /// Milliseconds to pause after returning the task to its queue.
    #[serde(default)]
    pub sleep_after_return: u64,
    #[serde(rename = "_history", default)]
    pub history: VecDeque<HistoryEntry>,
    /// Empty when the producer did not set one; consumers fill in the prefix they popped from.
    #[serde(default)]
    pub queue_prefix: String,
}

impl Task {
    /// Appends to the audit trail, dropping the oldest entries beyond `limit`.
    pub fn record(&mut self, entry: HistoryEntry, limit: usize) {
        self.history.push_back(entry);
        let limit = limit.max(1);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }

    /// Value of a routable field, used by return predicates.
    pub fn field(&self, field: TaskField) -> &str {
        match field {
            TaskField::Id => self.id.as_str(),
            TaskField::Type => self.kind.as_deref().unwrap_or_default(),
            TaskField::To => self.to.as_deref().unwrap_or_default(),
            TaskField::From => self.from.as_deref().unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskField {
    Id,
    Type,
    To,
    From,
}

/// Producer-side settings applied when a payload is wrapped into a task.
/// Unset limits fall back to the queue configuration.
#[derive(Debug, Clone, Default)]
pub struct TaskOptions {
    pub kind: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub id: Option<String>,
    pub in_progress_queue: Option<String>,
    pub in_progress_queue_exp: Option<u64>,
    pub success_queue: Option<String>,
    pub success_queue_exp: Option<u64>,
    pub failure_queue: Option<String>,
    pub failure_queue_exp: Option<u64>,
    pub retry_limit: Option<u32>,
    pub return_limit: Option<u32>,
    pub sleep_after_return_ms: u64,
    pub queue_prefix: Option<String>,
}
