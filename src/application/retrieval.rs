//! Keyed retrieval: batched composite-key lookups against the relational store.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::application::diagnostics::Diagnostics;
use crate::application::repos::{
    Predicate, QueryWindow, RelationalStore, SortDirection, StoreError, TableQuery,
};
use crate::domain::condition::{ConditionSet, JoinMode};
use crate::domain::entry::Entry;
use crate::domain::error::DomainError;
use crate::domain::key::{DEFAULT_DELIMITER, KeyColumn, KeyTuple, check_grouping, identify};
use crate::domain::keyed::Keyed;
use crate::domain::record::{Record, project};

pub(crate) const METRIC_RETRIEVE_MS: &str = "larder_retrieve_ms";
pub(crate) const METRIC_STORE_ERROR_TOTAL: &str = "larder_store_error_total";

const DEFAULT_LIMIT: u64 = 1000;

static NULL: Value = Value::Null;

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    /// Row cap applied unless a call is explicitly uncapped.
    pub default_limit: u64,
    pub key_delimiter: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            key_delimiter: DEFAULT_DELIMITER.to_string(),
        }
    }
}

impl From<&crate::config::RetrievalSettings> for RetrievalConfig {
    fn from(settings: &crate::config::RetrievalSettings) -> Self {
        Self {
            default_limit: settings.default_limit.get(),
            key_delimiter: settings.key_delimiter.clone(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    /// Requested row limit; capped at the configured default unless `uncapped`.
    pub limit: Option<u64>,
    pub uncapped: bool,
    pub offset: Option<u64>,
    /// Defaults to the key columns.
    pub order_by: Vec<String>,
    pub direction: SortDirection,
    pub extra_conditions: ConditionSet,
    /// Columns folded into the identifier after the key columns, never filtered on.
    pub extra_key_columns: Vec<String>,
    pub delimiter: Option<String>,
    pub group_by_first: usize,
    pub fill_missing_with_null: bool,
    pub push_key_to_columns: bool,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetrieveError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Input(#[from] DomainError),
}

pub struct RetrievalEngine {
    store: Arc<dyn RelationalStore>,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(store: Arc<dyn RelationalStore>, config: RetrievalConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    pub fn delimiter<'a>(&'a self, options: &'a RetrieveOptions) -> &'a str {
        options
            .delimiter
            .as_deref()
            .unwrap_or(self.config.key_delimiter.as_str())
    }

    /// Fetches the rows for `keys` in one query and keys them by composite identifier.
    ///
    /// An empty `keys` slice applies no key filter. When keys were given but every one of
    /// them was malformed the store is not queried and the result is empty.
    #[instrument(skip_all, fields(table = table, keys = keys.len()))]
    pub async fn retrieve(
        &self,
        keys: &[Value],
        key_columns: &[KeyColumn],
        table: &str,
        columns: &[String],
        options: &RetrieveOptions,
    ) -> Result<Keyed<Entry>, RetrieveError> {
        if key_columns.is_empty() {
            return Err(DomainError::invalid_key_column("").into());
        }
        let extra_keys = KeyColumn::parse_all(&options.extra_key_columns)?;
        check_grouping(
            options.group_by_first,
            key_columns.len() + extra_keys.len(),
        )?;

        let tuples = self.normalize_keys(keys, key_columns.len(), options);
        if !keys.is_empty() && tuples.is_empty() {
            debug!("every key was malformed; skipping query");
            return Ok(Keyed::new());
        }

        let query = self.build_query(table, key_columns, &extra_keys, tuples, columns, options);

        let started_at = Instant::now();
        let rows = self.store.execute_query(&query).await;
        histogram!(METRIC_RETRIEVE_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        let rows = rows.inspect_err(|err| {
            counter!(METRIC_STORE_ERROR_TOTAL).increment(1);
            warn!(error = %err, "relational query failed");
        })?;

        debug!(rows = rows.len(), "relational query returned");
        Ok(self.fold_rows(rows, key_columns, &extra_keys, columns, options))
    }

    fn normalize_keys(
        &self,
        keys: &[Value],
        width: usize,
        options: &RetrieveOptions,
    ) -> Vec<Vec<Option<Value>>> {
        keys.iter()
            .filter_map(|key| {
                let tuple = KeyTuple::from_value(key)
                    .and_then(|tuple| tuple.fit(width, options.fill_missing_with_null));
                if tuple.is_none() && options.diagnostics.verbose {
                    info!(key = %key, width, "dropping malformed key");
                }
                tuple.map(|tuple| tuple.components().to_vec())
            })
            .collect()
    }

    fn build_query(
        &self,
        table: &str,
        key_columns: &[KeyColumn],
        extra_keys: &[KeyColumn],
        tuples: Vec<Vec<Option<Value>>>,
        columns: &[String],
        options: &RetrieveOptions,
    ) -> TableQuery {
        let keyed = !tuples.is_empty();
        let key_predicate = keyed.then(|| Predicate::KeyTuples {
            columns: key_columns.iter().map(KeyColumn::qualified).collect(),
            tuples,
        });
        let extra_predicate = Predicate::from_conditions(&options.extra_conditions);
        let predicate = match (key_predicate, extra_predicate) {
            (Some(keys), Some(extra)) => Some(Predicate::join(keys, extra, JoinMode::And)),
            (keys, extra) => keys.or(extra),
        };

        let mut selected = columns.to_vec();
        if !selected.is_empty() {
            for column in key_columns.iter().chain(extra_keys) {
                if !selected.iter().any(|existing| existing == column.name()) {
                    selected.push(column.name().to_string());
                }
            }
        }

        let order_by = if options.order_by.is_empty() {
            key_columns.iter().map(KeyColumn::qualified).collect()
        } else {
            options.order_by.clone()
        };

        TableQuery {
            table: table.to_string(),
            columns: selected,
            predicate,
            window: QueryWindow {
                limit: self.effective_limit(options, keyed),
                offset: options.offset,
                order_by,
                direction: options.direction,
            },
        }
    }

    fn fold_rows(
        &self,
        rows: Vec<Record>,
        key_columns: &[KeyColumn],
        extra_keys: &[KeyColumn],
        columns: &[String],
        options: &RetrieveOptions,
    ) -> Keyed<Entry> {
        let delimiter = self.delimiter(options);
        let mut keep: Vec<&str> = Vec::new();
        if options.push_key_to_columns {
            keep.extend(key_columns.iter().chain(extra_keys).map(KeyColumn::name));
        }

        let mut result = Keyed::new();
        for mut row in rows {
            let identity = {
                let values: Vec<&Value> = key_columns
                    .iter()
                    .chain(extra_keys)
                    .map(|column| row.get(column.name()).unwrap_or(&NULL))
                    .collect();
                identify(
                    &values,
                    options.group_by_first,
                    delimiter,
                    options.fill_missing_with_null,
                )
            };
            project(&mut row, columns, &keep);

            match identity.sub_key {
                None => result.insert(identity.id, Entry::Row(row)),
                Some(sub_key) => {
                    let entry =
                        result.get_or_insert_with(&identity.id, || Entry::Group(Keyed::new()));
                    if let Entry::Group(rows) = entry {
                        rows.insert(sub_key, row);
                    }
                }
            }
        }
        result
    }

    /// Explicit limits are capped unless uncapped. Key-filtered queries without an explicit
    /// limit are bounded by the keys themselves; unfiltered ones fall back to the cap.
    fn effective_limit(&self, options: &RetrieveOptions, keyed: bool) -> Option<u64> {
        let cap = self.config.default_limit;
        match (options.limit, options.uncapped) {
            (limit, true) => limit,
            (Some(limit), false) => Some(limit.min(cap)),
            (None, false) if keyed => None,
            (None, false) => Some(cap),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::infra::memory::MemoryTables;

    fn row(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            other => panic!("not an object: {other}"),
        }
    }

    fn orders() -> Arc<MemoryTables> {
        let rows = (1..=5)
            .rev()
            .map(|id| row(json!({"id": id, "status": "open", "total": id * 10})))
            .collect();
        Arc::new(MemoryTables::new().with_table("orders", rows))
    }

    fn id() -> Vec<KeyColumn> {
        vec![KeyColumn::new("id").expect("column")]
    }

    #[derive(Default)]
    struct RecordingStore {
        last: Mutex<Option<TableQuery>>,
    }

    #[async_trait]
    impl RelationalStore for RecordingStore {
        async fn execute_query(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
            *self.last.lock().expect("lock") = Some(query.clone());
            Ok(Vec::new())
        }
    }

    impl RecordingStore {
        fn limit(&self) -> Option<u64> {
            self.last
                .lock()
                .expect("lock")
                .as_ref()
                .expect("query issued")
                .window
                .limit
        }
    }

    #[tokio::test]
    async fn unfiltered_retrieve_honours_limit_and_default_order() {
        let engine = RetrievalEngine::new(orders(), RetrievalConfig::default());
        let options = RetrieveOptions {
            limit: Some(2),
            ..RetrieveOptions::default()
        };

        let result = engine
            .retrieve(&[], &id(), "orders", &[], &options)
            .await
            .expect("retrieve");

        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["1", "2"]);
        let first = result.get("1").expect("row").records()[0].clone();
        assert_eq!(first["total"], json!(10));
    }

    #[tokio::test]
    async fn composite_keys_group_by_prefix() {
        let items = vec![
            row(json!({"order_id": 42, "item_id": 1, "sku": "a"})),
            row(json!({"order_id": 42, "item_id": 2, "sku": "b"})),
            row(json!({"order_id": 43, "item_id": 1, "sku": "c"})),
        ];
        let store = Arc::new(MemoryTables::new().with_table("order_items", items));
        let engine = RetrievalEngine::new(store, RetrievalConfig::default());
        let keys = KeyColumn::parse_all(&["order_id", "item_id"]).expect("columns");
        let options = RetrieveOptions {
            group_by_first: 1,
            fill_missing_with_null: true,
            ..RetrieveOptions::default()
        };

        let result = engine
            .retrieve(&[json!([42])], &keys, "order_items", &[], &options)
            .await
            .expect("retrieve");

        assert_eq!(result.len(), 1);
        let Some(Entry::Group(group)) = result.get("42") else {
            panic!("expected a grouped entry");
        };
        assert_eq!(group.keys().collect::<Vec<_>>(), vec!["1", "2"]);
        assert_eq!(group.get("2").expect("item")["sku"], json!("b"));
    }

    #[tokio::test]
    async fn repeated_retrieves_return_the_same_map() {
        let items = vec![
            row(json!({"order_id": 42, "item_id": 1, "sku": "a", "qty": 3})),
            row(json!({"order_id": 42, "item_id": 2, "sku": "b", "qty": 1})),
            row(json!({"order_id": 43, "item_id": 1, "sku": "c", "qty": 5})),
            row(json!({"order_id": 44, "item_id": 1, "sku": "d", "qty": 0})),
        ];
        let store = Arc::new(MemoryTables::new().with_table("order_items", items));
        let engine = RetrievalEngine::new(store.clone(), RetrievalConfig::default());
        let keys = KeyColumn::parse_all(&["order_id", "item_id"]).expect("columns");
        let options = RetrieveOptions {
            group_by_first: 1,
            fill_missing_with_null: true,
            extra_conditions: ConditionSet::from_json(&json!([["qty", 0, ">"]]))
                .expect("conditions"),
            ..RetrieveOptions::default()
        };
        let targets = [json!([42]), json!([43]), json!([44])];
        let columns = vec!["sku".to_string()];

        let first = engine
            .retrieve(&targets, &keys, "order_items", &columns, &options)
            .await
            .expect("retrieve");
        let second = engine
            .retrieve(&targets, &keys, "order_items", &columns, &options)
            .await
            .expect("retrieve");

        assert_eq!(first, second);
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["42", "43"]);
        assert_eq!(store.query_count(), 2);
    }

    #[tokio::test]
    async fn composite_identifiers_use_the_delimiter() {
        let items = vec![row(json!({"order_id": 42, "item_id": 7, "sku": "a"}))];
        let store = Arc::new(MemoryTables::new().with_table("order_items", items));
        let engine = RetrievalEngine::new(store, RetrievalConfig::default());
        let keys = KeyColumn::parse_all(&["order_id", "item_id"]).expect("columns");

        let result = engine
            .retrieve(
                &[json!([42, 7]), json!([42, 8])],
                &keys,
                "order_items",
                &[],
                &RetrieveOptions::default(),
            )
            .await
            .expect("retrieve");

        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["42/7"]);
    }

    #[tokio::test]
    async fn malformed_keys_skip_the_store() {
        let store = orders();
        let engine = RetrievalEngine::new(store.clone(), RetrievalConfig::default());

        let result = engine
            .retrieve(
                &[json!([1, 2]), json!({"id": 1})],
                &id(),
                "orders",
                &[],
                &RetrieveOptions::default(),
            )
            .await
            .expect("retrieve");

        assert!(result.is_empty());
        assert_eq!(store.query_count(), 0);
    }

    #[tokio::test]
    async fn projection_keeps_keys_only_when_asked() {
        let engine = RetrievalEngine::new(orders(), RetrievalConfig::default());
        let columns = vec!["status".to_string()];

        let plain = engine
            .retrieve(&[json!(3)], &id(), "orders", &columns, &RetrieveOptions::default())
            .await
            .expect("retrieve");
        let record = plain.get("3").expect("row").records()[0].clone();
        assert_eq!(record.keys().collect::<Vec<_>>(), vec!["status"]);

        let options = RetrieveOptions {
            push_key_to_columns: true,
            ..RetrieveOptions::default()
        };
        let pushed = engine
            .retrieve(&[json!(3)], &id(), "orders", &columns, &options)
            .await
            .expect("retrieve");
        let record = pushed.get("3").expect("row").records()[0].clone();
        assert_eq!(record["id"], json!(3));
    }

    #[tokio::test]
    async fn extra_conditions_narrow_the_result() {
        let engine = RetrievalEngine::new(orders(), RetrievalConfig::default());
        let options = RetrieveOptions {
            extra_conditions: ConditionSet::from_json(&json!([["total", 30, ">="]]))
                .expect("conditions"),
            ..RetrieveOptions::default()
        };

        let result = engine
            .retrieve(&[json!(1), json!(4)], &id(), "orders", &[], &options)
            .await
            .expect("retrieve");

        assert_eq!(result.keys().collect::<Vec<_>>(), vec!["4"]);
    }

    #[tokio::test]
    async fn limits_are_capped_unless_uncapped() {
        let store = Arc::new(RecordingStore::default());
        let config = RetrievalConfig {
            default_limit: 100,
            ..RetrievalConfig::default()
        };
        let engine = RetrievalEngine::new(store.clone(), config);

        let run = |options: RetrieveOptions, keys: Vec<Value>| {
            let engine = &engine;
            async move {
                engine
                    .retrieve(&keys, &id(), "orders", &[], &options)
                    .await
                    .expect("retrieve");
            }
        };

        run(
            RetrieveOptions {
                limit: Some(500),
                ..RetrieveOptions::default()
            },
            Vec::new(),
        )
        .await;
        assert_eq!(store.limit(), Some(100));

        run(
            RetrieveOptions {
                limit: Some(500),
                uncapped: true,
                ..RetrieveOptions::default()
            },
            Vec::new(),
        )
        .await;
        assert_eq!(store.limit(), Some(500));

        run(RetrieveOptions::default(), Vec::new()).await;
        assert_eq!(store.limit(), Some(100));

        run(RetrieveOptions::default(), vec![json!(1)]).await;
        assert_eq!(store.limit(), None);
    }

    #[tokio::test]
    async fn invalid_grouping_and_store_failures_are_errors() {
        let store = orders();
        let engine = RetrievalEngine::new(store.clone(), RetrievalConfig::default());
        let options = RetrieveOptions {
            group_by_first: 1,
            ..RetrieveOptions::default()
        };
        let err = engine
            .retrieve(&[json!(1)], &id(), "orders", &[], &options)
            .await
            .expect_err("grouping by the whole key");
        assert!(matches!(err, RetrieveError::Input(DomainError::InvalidGrouping { .. })));

        store.set_offline(true);
        let err = engine
            .retrieve(&[json!(1)], &id(), "orders", &[], &RetrieveOptions::default())
            .await
            .expect_err("offline");
        assert!(matches!(err, RetrieveError::Store(StoreError::Unavailable(_))));
    }
}
