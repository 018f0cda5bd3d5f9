//! Relational store held in process: named tables of records.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::application::repos::{RelationalStore, SortDirection, StoreError, TableQuery};
use crate::domain::record::{Record, compare_scalars};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "infra::memory::tables";

/// In-memory tables evaluating predicate trees the way the Postgres adapter renders them.
///
/// Counts executed queries so callers can assert how often the store was hit.
#[derive(Default)]
pub struct MemoryTables {
    tables: RwLock<HashMap<String, Vec<Record>>>,
    offline: AtomicBool,
    queries: AtomicUsize,
}

impl MemoryTables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(self, name: &str, rows: Vec<Record>) -> Self {
        rw_write(&self.tables, SOURCE, "with_table").insert(name.to_string(), rows);
        self
    }

    pub fn insert(&self, table: &str, row: Record) {
        rw_write(&self.tables, SOURCE, "insert")
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Simulates an unreachable database.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

fn bare(column: &str) -> &str {
    column.rsplit_once('.').map_or(column, |(_, name)| name)
}

#[async_trait]
impl RelationalStore for MemoryTables {
    async fn execute_query(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("in-memory tables offline"));
        }
        self.queries.fetch_add(1, Ordering::SeqCst);

        let tables = rw_read(&self.tables, SOURCE, "execute_query");
        let rows = tables
            .get(&query.table)
            .ok_or_else(|| StoreError::query(format!("unknown table `{}`", query.table)))?;

        let mut matched: Vec<Record> = rows
            .iter()
            .filter(|row| {
                query
                    .predicate
                    .as_ref()
                    .is_none_or(|predicate| predicate.matches(row))
            })
            .cloned()
            .collect();
        drop(tables);

        let window = &query.window;
        matched.sort_by(|left, right| {
            let ordering = window
                .order_by
                .iter()
                .map(|column| {
                    let column = bare(column);
                    let null = serde_json::Value::Null;
                    compare_scalars(
                        left.get(column).unwrap_or(&null),
                        right.get(column).unwrap_or(&null),
                    )
                })
                .find(|ordering| ordering.is_ne())
                .unwrap_or(std::cmp::Ordering::Equal);
            match window.direction {
                SortDirection::Asc => ordering,
                SortDirection::Desc => ordering.reverse(),
            }
        });

        let offset = window.offset.unwrap_or(0) as usize;
        let limit = window.limit.map_or(usize::MAX, |limit| limit as usize);
        let selected: Vec<&str> = query.columns.iter().map(|column| bare(column)).collect();

        Ok(matched
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|mut row| {
                if !selected.is_empty() {
                    row.retain(|name, _| selected.contains(&name.as_str()));
                }
                row
            })
            .collect())
    }
}
