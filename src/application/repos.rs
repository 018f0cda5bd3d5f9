//! Contracts for the two stores the core runs against.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::condition::{ColumnCondition, ConditionSet, JoinMode};
use crate::domain::record::{Record, Scalar, key_part};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("key `{key}` holds a value of the wrong type")]
    WrongType { key: String },
    #[error("query failed: {0}")]
    Query(String),
    #[error("invalid identifier `{0}`")]
    InvalidIdentifier(String),
}

impl StoreError {
    pub fn unavailable(err: impl std::fmt::Display) -> Self {
        Self::Unavailable(err.to_string())
    }

    pub fn query(err: impl std::fmt::Display) -> Self {
        Self::Query(err.to_string())
    }
}

/// Filter tree handed to the relational store.
#[derive(Debug, Clone)]
pub enum Predicate {
    Condition(ColumnCondition),
    /// Batched tuple membership: a row matches when it equals any tuple on every
    /// constrained (`Some`) component.
    KeyTuples {
        columns: Vec<String>,
        tuples: Vec<Vec<Option<Scalar>>>,
    },
    Join {
        left: Box<Predicate>,
        right: Box<Predicate>,
        mode: JoinMode,
    },
}

impl Predicate {
    pub fn join(left: Predicate, right: Predicate, mode: JoinMode) -> Self {
        Self::Join {
            left: Box::new(left),
            right: Box::new(right),
            mode,
        }
    }

    /// Folds a condition set into a left-deep tree. `None` for an empty set.
    pub fn from_conditions(set: &ConditionSet) -> Option<Self> {
        let mut conditions = set.conditions.iter().cloned().map(Self::Condition);
        let first = conditions.next()?;
        Some(conditions.fold(first, |tree, next| Self::join(tree, next, set.mode)))
    }

    /// Evaluates the predicate against a record in process.
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Self::Condition(condition) => condition.evaluate(record),
            Self::KeyTuples { columns, tuples } => tuples.iter().any(|tuple| {
                columns.iter().zip(tuple).all(|(column, component)| {
                    let Some(expected) = component else {
                        return true;
                    };
                    let bare = column.rsplit_once('.').map_or(column.as_str(), |(_, b)| b);
                    match record.get(bare) {
                        Some(Value::Null) | None => expected.is_null(),
                        Some(actual) => !expected.is_null() && key_part(actual) == key_part(expected),
                    }
                })
            }),
            Self::Join { left, right, mode } => match mode {
                JoinMode::And => left.matches(record) && right.matches(record),
                JoinMode::Or => left.matches(record) || right.matches(record),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Asc => "ASC",
            Self::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct QueryWindow {
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub order_by: Vec<String>,
    pub direction: SortDirection,
}

/// A single-table select. An empty column list selects every column.
#[derive(Debug, Clone)]
pub struct TableQuery {
    pub table: String,
    pub columns: Vec<String>,
    pub predicate: Option<Predicate>,
    pub window: QueryWindow,
}

#[async_trait]
pub trait RelationalStore: Send + Sync {
    async fn execute_query(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Always,
    IfAbsent,
}

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// One slot per key, in request order.
    async fn multi_get(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError>;

    /// Returns whether the value was written. `ttl` of `None` means no expiry.
    async fn set(
        &self,
        key: &str,
        value: &str,
        mode: SetMode,
        ttl: Option<Duration>,
    ) -> Result<bool, StoreError>;

    /// Remaining lifetime; `None` when the key is missing or never expires.
    async fn ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn delete(&self, keys: &[String]) -> Result<u64, StoreError>;

    /// Pushes onto the head of a list, returning its new length.
    async fn push_left(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Pushes onto the tail of a list, returning its new length.
    async fn push_right(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Pops from the tail of the first non-empty list among `keys`, waiting up to
    /// `timeout`. A zero timeout checks once without waiting.
    async fn blocking_pop_right(
        &self,
        keys: &[String],
        timeout: Duration,
    ) -> Result<Option<(String, String)>, StoreError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn row(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn key_tuples_treat_padding_as_wildcard() {
        let predicate = Predicate::KeyTuples {
            columns: vec!["o.order_id".into(), "item_id".into()],
            tuples: vec![vec![Some(json!("42")), None]],
        };
        assert!(predicate.matches(&row(json!({"order_id": 42, "item_id": 1}))));
        assert!(!predicate.matches(&row(json!({"order_id": 41, "item_id": 1}))));
    }

    #[test]
    fn folds_conditions_by_mode() {
        let set = ConditionSet::from_json(&json!([["a", 1, "="], ["b", 2, "="], "OR"]))
            .expect("valid");
        let tree = Predicate::from_conditions(&set).expect("non-empty");
        assert!(tree.matches(&row(json!({"a": 0, "b": 2}))));
        assert!(Predicate::from_conditions(&ConditionSet::default()).is_none());
    }
}
