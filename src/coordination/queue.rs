//! Reliable work queues on key-value lists.
//!
//! Producers push serialized [`Task`] envelopes onto the tail of a list (its left end) and
//! consumers pop from the head (its right end), so a single queue is FIFO. Tasks a consumer
//! declines (see [`ReturnPredicate`]) go back to the tail, behind everything already waiting.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use regex::Regex;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::application::diagnostics::Diagnostics;
use crate::application::repos::{KeyValueStore, StoreError};
use crate::application::token::TokenSource;
use crate::domain::error::DomainError;
use crate::domain::keyed::Keyed;
use crate::domain::task::{HistoryEntry, Task, TaskField, TaskOptions};

use super::config::QueueConfig;

pub(crate) const METRIC_QUEUE_DELIVERY_TOTAL: &str = "larder_queue_delivery_total";

/// Result of pushing one task onto one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Unavailable,
    /// The store refused the push, e.g. the key holds something other than a list.
    Rejected,
    /// Queue length after the push.
    Length(u64),
}

impl PushOutcome {
    pub fn code(self) -> i64 {
        match self {
            Self::Unavailable => -1,
            Self::Rejected => 0,
            Self::Length(length) => i64::try_from(length).unwrap_or(i64::MAX),
        }
    }
}

impl Serialize for PushOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl From<Result<u64, StoreError>> for PushOutcome {
    fn from(result: Result<u64, StoreError>) -> Self {
        match result {
            Ok(length) => Self::Length(length),
            Err(StoreError::Unavailable(_)) => Self::Unavailable,
            Err(_) => Self::Rejected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryOutcome {
    Success,
    ReturnedToQueue,
    /// The task was returned more often than its limit allows; the caller owns it now.
    MaxReturns,
    InvalidFormat,
    TimedOut,
    NotInit,
    /// Pushing a declined task back failed; the caller owns it now.
    ReturnFailed,
}

impl DeliveryOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::ReturnedToQueue => "returned-to-queue",
            Self::MaxReturns => "max-returns",
            Self::InvalidFormat => "invalid-format",
            Self::TimedOut => "timed-out",
            Self::NotInit => "not-init",
            Self::ReturnFailed => "return-failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Delivery {
    pub outcome: DeliveryOutcome,
    pub task: Option<Task>,
    /// Queue name without prefix.
    pub queue: Option<String>,
    pub error: Option<String>,
}

impl Delivery {
    fn bare(outcome: DeliveryOutcome, error: Option<String>) -> Self {
        Self {
            outcome,
            task: None,
            queue: None,
            error,
        }
    }
}

/// Include/exclude patterns over one task field. A rule with no include patterns
/// accepts every value that no exclude pattern matches.
#[derive(Debug, Clone)]
pub struct FieldRule {
    pub field: TaskField,
    pub include: Vec<Regex>,
    pub exclude: Vec<Regex>,
}

impl FieldRule {
    pub fn matches(&self, task: &Task) -> bool {
        let value = task.field(self.field);
        (self.include.is_empty() || self.include.iter().any(|re| re.is_match(value)))
            && !self.exclude.iter().any(|re| re.is_match(value))
    }
}

type Matcher = Arc<dyn Fn(&Task) -> bool + Send + Sync>;

/// Decides which popped tasks a consumer hands back to the queue.
///
/// Every configured rule and the custom matcher must agree. An empty predicate
/// returns nothing.
#[derive(Clone, Default)]
pub struct ReturnPredicate {
    rules: Vec<FieldRule>,
    matcher: Option<Matcher>,
}

impl fmt::Debug for ReturnPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnPredicate")
            .field("rules", &self.rules)
            .field("matcher", &self.matcher.is_some())
            .finish()
    }
}

fn compile(patterns: &[&str]) -> Result<Vec<Regex>, DomainError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| DomainError::invalid_pattern(*pattern, err))
        })
        .collect()
}

fn patterns<'a>(entry: &'a Value, name: &str, key: &str) -> Result<Vec<&'a str>, DomainError> {
    match entry.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str().ok_or_else(|| {
                    DomainError::malformed_predicate(format!("`{name}.{key}` must hold strings"))
                })
            })
            .collect(),
        Some(_) => Err(DomainError::malformed_predicate(format!(
            "`{name}.{key}` must be a list"
        ))),
    }
}

impl ReturnPredicate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rule(
        mut self,
        field: TaskField,
        include: &[&str],
        exclude: &[&str],
    ) -> Result<Self, DomainError> {
        self.rules.push(FieldRule {
            field,
            include: compile(include)?,
            exclude: compile(exclude)?,
        });
        Ok(self)
    }

    pub fn with_matcher(mut self, matcher: impl Fn(&Task) -> bool + Send + Sync + 'static) -> Self {
        self.matcher = Some(Arc::new(matcher));
        self
    }

    /// Parses `{"type": {"include": [..], "exclude": [..]}, "id": {..}, ..}`.
    pub fn from_json(value: &Value) -> Result<Self, DomainError> {
        let Value::Object(fields) = value else {
            return Err(DomainError::malformed_predicate("return predicate must be an object"));
        };
        let mut predicate = Self::new();
        for (name, entry) in fields {
            let field = match name.as_str() {
                "id" => TaskField::Id,
                "type" => TaskField::Type,
                "to" => TaskField::To,
                "from" => TaskField::From,
                other => {
                    return Err(DomainError::malformed_predicate(format!(
                        "unknown task field `{other}`"
                    )));
                }
            };
            predicate = predicate.rule(
                field,
                &patterns(entry, name, "include")?,
                &patterns(entry, name, "exclude")?,
            )?;
        }
        Ok(predicate)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty() && self.matcher.is_none()
    }

    pub fn matches(&self, task: &Task) -> bool {
        !self.is_empty()
            && self.rules.iter().all(|rule| rule.matches(task))
            && self.matcher.as_ref().is_none_or(|matcher| matcher(task))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
    /// Defaults to the configured timeout. Zero checks once without waiting.
    pub timeout: Option<Duration>,
    pub queue_prefix: Option<String>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TaskResult {
    Success(Option<Value>),
    Failure(String),
}

/// Where a finished task was sent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Routed {
    pub queue: String,
    pub outcome: PushOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryOutcome {
    Requeued(PushOutcome),
    /// Out of retries; routed to the failure queue when the task names one.
    Exhausted(Option<Routed>),
}

pub struct WorkQueue {
    kv: Arc<dyn KeyValueStore>,
    tokens: Arc<dyn TokenSource>,
    config: QueueConfig,
}

impl WorkQueue {
    pub fn new(kv: Arc<dyn KeyValueStore>, tokens: Arc<dyn TokenSource>, config: QueueConfig) -> Self {
        Self { kv, tokens, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Wraps `payload` in a task envelope and pushes it onto every named queue.
    #[instrument(skip_all, fields(queues = queues.len()))]
    pub async fn enqueue(
        &self,
        queues: &[String],
        payload: Value,
        options: &TaskOptions,
        diagnostics: Diagnostics,
    ) -> Keyed<PushOutcome> {
        let mut task = self.build_task(payload, options);
        task.record(
            HistoryEntry::now("enqueue").with_detail("queues", queues.to_vec()),
            self.config.history_limit,
        );

        let mut outcomes = Keyed::new();
        let serialized = match serde_json::to_string(&task) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(error = %err, "failed to serialize task");
                for queue in queues {
                    outcomes.insert(queue.as_str(), PushOutcome::Rejected);
                }
                return outcomes;
            }
        };

        for queue in queues {
            let key = format!("{}{queue}", task.queue_prefix);
            let outcome = if diagnostics.test {
                debug!(key = %key, "dry run: skipping push");
                PushOutcome::Length(1)
            } else {
                PushOutcome::from(self.kv.push_left(&key, &serialized).await)
            };
            if diagnostics.verbose {
                info!(key = %key, task_id = %task.id, code = outcome.code(), "task enqueued");
            }
            outcomes.insert(queue.as_str(), outcome);
        }
        outcomes
    }

    fn build_task(&self, payload: Value, options: &TaskOptions) -> Task {
        Task {
            data: payload,
            kind: options.kind.clone(),
            from: options.from.clone(),
            to: options.to.clone(),
            id: options.id.clone().unwrap_or_else(|| self.tokens.token()),
            in_progress_queue: options.in_progress_queue.clone(),
            in_progress_queue_exp: options.in_progress_queue_exp,
            success_queue: options.success_queue.clone(),
            success_queue_exp: options.success_queue_exp,
            failure_queue: options.failure_queue.clone(),
            failure_queue_exp: options.failure_queue_exp,
            retry_limit: options.retry_limit.unwrap_or(self.config.retry_limit),
            current_retries: 0,
            return_limit: options.return_limit.unwrap_or(self.config.return_limit),
            current_returns: 0,
            sleep_after_return: options.sleep_after_return_ms,
            history: Default::default(),
            queue_prefix: options
                .queue_prefix
                .clone()
                .unwrap_or_else(|| self.config.prefix.clone()),
        }
    }

    /// Pops the next task from the first non-empty queue and applies the return predicate.
    #[instrument(skip_all, fields(queues = queues.len()))]
    pub async fn dequeue(
        &self,
        queues: &[String],
        predicate: &ReturnPredicate,
        options: &DequeueOptions,
    ) -> Delivery {
        let delivery = self.deliver(queues, predicate, options).await;
        counter!(METRIC_QUEUE_DELIVERY_TOTAL, "outcome" => delivery.outcome.label()).increment(1);
        if options.diagnostics.verbose {
            info!(
                outcome = delivery.outcome.label(),
                queue = delivery.queue.as_deref().unwrap_or_default(),
                "dequeue finished"
            );
        }
        delivery
    }

    async fn deliver(
        &self,
        queues: &[String],
        predicate: &ReturnPredicate,
        options: &DequeueOptions,
    ) -> Delivery {
        if options.diagnostics.test {
            return Delivery::bare(DeliveryOutcome::TimedOut, Some("dry run".to_string()));
        }

        let prefix = options
            .queue_prefix
            .as_deref()
            .unwrap_or(self.config.prefix.as_str());
        let keys: Vec<String> = queues.iter().map(|queue| format!("{prefix}{queue}")).collect();
        let timeout = options.timeout.unwrap_or_else(|| self.config.timeout());

        let (key, raw) = match self.kv.blocking_pop_right(&keys, timeout).await {
            Ok(Some(popped)) => popped,
            Ok(None) => return Delivery::bare(DeliveryOutcome::TimedOut, None),
            Err(err) => {
                warn!(error = %err, "queue store unavailable");
                return Delivery::bare(DeliveryOutcome::NotInit, Some(err.to_string()));
            }
        };
        let queue = key.strip_prefix(prefix).unwrap_or(&key).to_string();

        let mut task: Task = match serde_json::from_str(&raw) {
            Ok(task) => task,
            Err(err) => {
                warn!(key = %key, error = %err, "discarding malformed task");
                return Delivery {
                    queue: Some(queue),
                    ..Delivery::bare(DeliveryOutcome::InvalidFormat, Some(err.to_string()))
                };
            }
        };

        if task.id.trim().is_empty() {
            warn!(key = %key, "discarding task without an id");
            return Delivery {
                queue: Some(queue),
                ..Delivery::bare(
                    DeliveryOutcome::InvalidFormat,
                    Some("task has no id".to_string()),
                )
            };
        }
        if task.queue_prefix.is_empty() {
            task.queue_prefix = prefix.to_string();
        }

        if !predicate.matches(&task) {
            self.mark_in_progress(&mut task).await;
            return Delivery {
                outcome: DeliveryOutcome::Success,
                task: Some(task),
                queue: Some(queue),
                error: None,
            };
        }

        task.current_returns += 1;
        if task.current_returns > task.return_limit {
            debug!(task_id = %task.id, returns = task.current_returns, "task over its return limit");
            return Delivery {
                outcome: DeliveryOutcome::MaxReturns,
                task: Some(task),
                queue: Some(queue),
                error: None,
            };
        }

        task.record(
            HistoryEntry::now("return-to-queue").with_detail("queue", queue.as_str()),
            self.config.history_limit,
        );
        let pushed = match serde_json::to_string(&task) {
            Ok(serialized) => self.kv.push_left(&key, &serialized).await.map(|_| ()),
            Err(err) => Err(StoreError::query(err)),
        };
        if let Err(err) = pushed {
            warn!(key = %key, task_id = %task.id, error = %err, "failed to return task to queue");
            return Delivery {
                outcome: DeliveryOutcome::ReturnFailed,
                task: Some(task),
                queue: Some(queue),
                error: Some(err.to_string()),
            };
        }

        if task.sleep_after_return > 0 {
            tokio::time::sleep(Duration::from_millis(task.sleep_after_return)).await;
        }
        Delivery {
            outcome: DeliveryOutcome::ReturnedToQueue,
            task: Some(task),
            queue: Some(queue),
            error: None,
        }
    }

    /// Leaves a copy of a delivered task in its in-progress queue, if it names one.
    async fn mark_in_progress(&self, task: &mut Task) {
        let Some(queue) = task.in_progress_queue.clone() else {
            return;
        };
        task.record(
            HistoryEntry::now("in-progress").with_detail("queue", queue.as_str()),
            self.config.history_limit,
        );
        let outcome = self
            .push_task(task, &queue, task.in_progress_queue_exp)
            .await;
        if !matches!(outcome, PushOutcome::Length(_)) {
            warn!(task_id = %task.id, queue = %queue, "failed to record in-progress copy");
        }
    }

    /// Routes a finished task to its success or failure queue.
    pub async fn complete(
        &self,
        mut task: Task,
        result: TaskResult,
        diagnostics: Diagnostics,
    ) -> Option<Routed> {
        let (entry, queue, exp) = match result {
            TaskResult::Success(detail) => {
                let mut entry = HistoryEntry::now("success");
                if let Some(detail) = detail {
                    entry = entry.with_detail("result", detail);
                }
                (entry, task.success_queue.clone(), task.success_queue_exp)
            }
            TaskResult::Failure(error) => (
                HistoryEntry::now("failure").with_detail("error", error),
                task.failure_queue.clone(),
                task.failure_queue_exp,
            ),
        };
        task.record(entry, self.config.history_limit);
        let queue = queue?;
        self.route(&task, queue, exp, diagnostics).await
    }

    /// Puts a failed task back on `queue` while it has retries left; otherwise routes it
    /// to its failure queue.
    pub async fn retry(&self, mut task: Task, queue: &str, diagnostics: Diagnostics) -> RetryOutcome {
        task.current_retries += 1;
        if task.current_retries <= task.retry_limit {
            task.record(
                HistoryEntry::now("retry").with_detail("attempt", task.current_retries),
                self.config.history_limit,
            );
            let outcome = if diagnostics.test {
                PushOutcome::Length(1)
            } else {
                self.push_task(&task, queue, None).await
            };
            return RetryOutcome::Requeued(outcome);
        }

        task.record(
            HistoryEntry::now("retries-exhausted"),
            self.config.history_limit,
        );
        let routed = match task.failure_queue.clone() {
            Some(failure) => {
                let exp = task.failure_queue_exp;
                self.route(&task, failure, exp, diagnostics).await
            }
            None => None,
        };
        RetryOutcome::Exhausted(routed)
    }

    async fn route(
        &self,
        task: &Task,
        queue: String,
        exp: Option<u64>,
        diagnostics: Diagnostics,
    ) -> Option<Routed> {
        let outcome = if diagnostics.test {
            PushOutcome::Length(1)
        } else {
            self.push_task(task, &queue, exp).await
        };
        if diagnostics.verbose {
            info!(task_id = %task.id, queue = %queue, code = outcome.code(), "task routed");
        }
        Some(Routed { queue, outcome })
    }

    async fn push_task(&self, task: &Task, queue: &str, exp: Option<u64>) -> PushOutcome {
        let key = format!("{}{queue}", task.queue_prefix);
        let serialized = match serde_json::to_string(task) {
            Ok(serialized) => serialized,
            Err(err) => {
                warn!(task_id = %task.id, error = %err, "failed to serialize task");
                return PushOutcome::Rejected;
            }
        };
        let outcome = PushOutcome::from(self.kv.push_left(&key, &serialized).await);
        if let (PushOutcome::Length(_), Some(seconds)) = (outcome, exp.filter(|s| *s > 0)) {
            if let Err(err) = self.kv.expire(&key, Duration::from_secs(seconds)).await {
                warn!(key = %key, error = %err, "failed to set queue expiry");
            }
        }
        outcome
    }
}
