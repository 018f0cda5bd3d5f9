//! Cache-aside reads over the keyed retrieval engine.
//!
//! Each requested identifier is probed in the key-value cache first. Hits are validated
//! (shape, requested columns, conditions) before they are served; everything left over is
//! resolved with a single retrieval call and written back when it fits the size ceiling.

use std::sync::Arc;

use metrics::counter;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::application::diagnostics::Diagnostics;
use crate::application::repos::{KeyValueStore, SetMode, StoreError};
use crate::application::retrieval::{
    METRIC_STORE_ERROR_TOTAL, RetrievalEngine, RetrieveError, RetrieveOptions,
};
use crate::domain::condition::ConditionSet;
use crate::domain::entry::Entry;
use crate::domain::error::DomainError;
use crate::domain::key::{KeyColumn, KeyTuple, check_grouping, join_identifier};
use crate::domain::keyed::Keyed;
use crate::domain::record::{key_part, project};

use super::config::{CacheConfig, ConditionMissPolicy};

pub(crate) const METRIC_HIT_TOTAL: &str = "larder_cache_hit_total";
pub(crate) const METRIC_MISS_TOTAL: &str = "larder_cache_miss_total";
pub(crate) const METRIC_EXCLUDED_TOTAL: &str = "larder_cache_excluded_total";
pub(crate) const METRIC_OVERSIZED_TOTAL: &str = "larder_cache_oversized_total";

/// What to look up and where it lives.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Scalars or key tuples, as accepted by the retrieval engine.
    pub targets: Vec<Value>,
    pub key_columns: Vec<KeyColumn>,
    pub table: String,
    /// Prefix for cache keys. `None` disables caching for the call.
    pub namespace: Option<String>,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Overrides the configured default.
    pub use_cache: Option<bool>,
    pub get_from_cache: bool,
    pub update_cache: bool,
    /// Reset the TTL of every hit. Defaults to `update_cache`.
    pub extend_ttl: Option<bool>,
    /// Checked against cache hits and grouped store results. Ungrouped fetches push them
    /// down to the store when no hit was checked.
    pub conditions: ConditionSet,
    pub translate_in_reversed: bool,
    /// Overrides the configured policy.
    pub condition_miss_policy: Option<ConditionMissPolicy>,
    /// Window and identifier options for the store fetch. Its `extra_conditions` are
    /// replaced by `conditions` when those are pushed down.
    pub retrieve: RetrieveOptions,
    pub diagnostics: Diagnostics,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            use_cache: None,
            get_from_cache: true,
            update_cache: true,
            extend_ttl: None,
            conditions: ConditionSet::default(),
            translate_in_reversed: false,
            condition_miss_policy: None,
            retrieve: RetrieveOptions::default(),
            diagnostics: Diagnostics::default(),
        }
    }
}

/// Resolution of one identifier.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    Found(Entry),
    /// Absent from both the cache and the store.
    NotFound,
    /// The store could not be asked. Never to be read as absence.
    StoreUnreachable,
}

impl Lookup {
    pub const NOT_FOUND: i64 = 1;
    pub const STORE_UNREACHABLE: i64 = -1;

    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Found(_) => None,
            Self::NotFound => Some(Self::NOT_FOUND),
            Self::StoreUnreachable => Some(Self::STORE_UNREACHABLE),
        }
    }

    pub fn entry(&self) -> Option<&Entry> {
        match self {
            Self::Found(entry) => Some(entry),
            _ => None,
        }
    }
}

impl Serialize for Lookup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Found(entry) => entry.serialize(serializer),
            other => serializer.serialize_i64(other.code().unwrap_or_default()),
        }
    }
}

#[derive(Debug)]
struct Target {
    /// Identifier of the full tuple.
    id: String,
    /// Identifier the result and the cache entry live under.
    group_id: String,
    /// Key handed to the retrieval engine.
    key: Value,
}

enum Probe {
    Valid(Entry),
    Excluded,
    Invalid(&'static str),
}

/// Whether a store result under `found` settles the target `target`.
fn covers(found: &str, target: &str, delimiter: &str) -> bool {
    if found == target {
        return true;
    }
    if delimiter.is_empty() {
        return false;
    }
    let nested = |outer: &str, inner: &str| {
        inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with(delimiter))
    };
    nested(found, target) || nested(target, found)
}

/// `columns` widened with every column the conditions read. Empty means all columns.
fn with_condition_columns(columns: &[String], conditions: &ConditionSet) -> Vec<String> {
    let mut widened = columns.to_vec();
    if widened.is_empty() {
        return widened;
    }
    for condition in &conditions.conditions {
        let name = condition.bare_column();
        if !widened.iter().any(|column| column == name) {
            widened.push(name.to_string());
        }
    }
    widened
}

pub struct CacheAside {
    engine: Arc<RetrievalEngine>,
    kv: Arc<dyn KeyValueStore>,
    config: CacheConfig,
}

impl CacheAside {
    pub fn new(engine: Arc<RetrievalEngine>, kv: Arc<dyn KeyValueStore>, config: CacheConfig) -> Self {
        Self { engine, kv, config }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Resolves every target from the cache or, failing that, from the store.
    ///
    /// Only input errors fail the call; store trouble is reported per identifier.
    #[instrument(skip_all, fields(table = %request.table, targets = request.targets.len()))]
    pub async fn get_or_fetch(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
    ) -> Result<Keyed<Lookup>, DomainError> {
        let retrieve = &options.retrieve;
        let delimiter = self.engine.delimiter(retrieve).to_string();
        let extra_keys = KeyColumn::parse_all(&retrieve.extra_key_columns)?;
        check_grouping(
            retrieve.group_by_first,
            request.key_columns.len() + extra_keys.len(),
        )?;

        let grouped = retrieve.group_by_first > 0;
        let targets = self.normalize_targets(request, options, &delimiter);
        let namespace = request.namespace.as_deref().unwrap_or_default();
        let caching =
            request.namespace.is_some() && options.use_cache.unwrap_or(self.config.use_cache);

        let mut resolved: Keyed<Lookup> = Keyed::new();
        let mut excluded: Vec<String> = Vec::new();
        let mut cache_filtered = false;

        if caching && options.get_from_cache && !targets.is_empty() {
            cache_filtered = self
                .probe(
                    request,
                    options,
                    &targets,
                    namespace,
                    &mut resolved,
                    &mut excluded,
                )
                .await;
        }

        let mut outstanding: Vec<&Target> = targets
            .iter()
            .filter(|target| {
                !resolved.contains_key(&target.group_id) && !excluded.contains(&target.group_id)
            })
            .collect();

        if !outstanding.is_empty() {
            let mut misses: Vec<&str> = outstanding.iter().map(|t| t.group_id.as_str()).collect();
            misses.sort_unstable();
            misses.dedup();
            counter!(METRIC_MISS_TOTAL).increment(misses.len() as u64);

            let mut keys: Vec<Value> = Vec::new();
            let mut seen: Vec<&str> = Vec::new();
            for target in &outstanding {
                let dedupe_on = if grouped { &target.group_id } else { &target.id };
                if !seen.contains(&dedupe_on.as_str()) {
                    seen.push(dedupe_on);
                    keys.push(target.key.clone());
                }
            }

            let mut store_options = retrieve.clone();
            store_options.diagnostics = options.diagnostics;
            if grouped {
                store_options.fill_missing_with_null = true;
            }
            // Pushed-down conditions would leave partial groups in the cache.
            let push_down = !grouped && !cache_filtered && !options.conditions.is_empty();
            let filter_in_process = !push_down && !options.conditions.is_empty();
            if push_down {
                store_options.extra_conditions = if options.translate_in_reversed {
                    options.conditions.translate_in_reversed()
                } else {
                    options.conditions.clone()
                };
            }
            let fetch_columns = if filter_in_process {
                with_condition_columns(&request.columns, &options.conditions)
            } else {
                request.columns.clone()
            };
            let keep: Vec<&str> = if retrieve.push_key_to_columns {
                request
                    .key_columns
                    .iter()
                    .chain(&extra_keys)
                    .map(KeyColumn::name)
                    .collect()
            } else {
                Vec::new()
            };

            let fetched = self
                .engine
                .retrieve(
                    &keys,
                    &request.key_columns,
                    &request.table,
                    &fetch_columns,
                    &store_options,
                )
                .await;

            match fetched {
                Err(RetrieveError::Input(err)) => return Err(err),
                Err(RetrieveError::Store(err)) => {
                    debug!(error = %err, "store fetch failed; reporting targets unreachable");
                    for target in outstanding.drain(..) {
                        resolved.insert(target.group_id.clone(), Lookup::StoreUnreachable);
                    }
                }
                Ok(rows) => {
                    for (id, mut entry) in rows {
                        if caching && options.update_cache {
                            self.write_back(namespace, &id, &entry, options.diagnostics)
                                .await;
                        }
                        if filter_in_process {
                            if !entry.retain_records(|record| options.conditions.evaluate(record)) {
                                continue;
                            }
                            entry.for_each_record_mut(|record| {
                                project(record, &request.columns, &keep)
                            });
                        }
                        outstanding.retain(|target| !covers(&id, &target.id, &delimiter));
                        resolved.insert(id, Lookup::Found(entry));
                    }
                }
            }

            for target in outstanding {
                if !resolved.contains_key(&target.group_id) {
                    resolved.insert(target.group_id.clone(), Lookup::NotFound);
                }
            }
        }

        Ok(resolved.into_reordered(targets.iter().map(|target| target.group_id.as_str())))
    }

    /// Deletes cached entries for `ids` under `namespace`, returning how many existed.
    pub async fn invalidate(
        &self,
        namespace: &str,
        ids: &[String],
        diagnostics: Diagnostics,
    ) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        if diagnostics.test {
            debug!(ids = ids.len(), "dry run: skipping cache invalidation");
            return Ok(0);
        }
        let keys: Vec<String> = ids.iter().map(|id| format!("{namespace}{id}")).collect();
        self.kv.delete(&keys).await.inspect_err(|err| {
            counter!(METRIC_STORE_ERROR_TOTAL).increment(1);
            warn!(error = %err, "cache invalidation failed");
        })
    }

    fn normalize_targets(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
        delimiter: &str,
    ) -> Vec<Target> {
        let width = request.key_columns.len();
        let group = options.retrieve.group_by_first;
        let pad = options.retrieve.fill_missing_with_null || group > 0;

        request
            .targets
            .iter()
            .filter_map(|raw| {
                let Some(tuple) = KeyTuple::from_value(raw).and_then(|t| t.fit(width, pad)) else {
                    if options.diagnostics.verbose {
                        info!(target_key = %raw, "dropping malformed target");
                    }
                    return None;
                };
                let present: Vec<Value> = tuple.components().iter().flatten().cloned().collect();
                let parts: Vec<String> = present.iter().map(key_part).collect();
                if parts.len() < group {
                    if options.diagnostics.verbose {
                        info!(target_key = %raw, group, "target shorter than its group prefix");
                    }
                    return None;
                }

                let id = join_identifier(&parts, delimiter);
                let (group_id, key) = if group > 0 {
                    (
                        join_identifier(&parts[..group], delimiter),
                        Value::Array(present[..group].to_vec()),
                    )
                } else {
                    (id.clone(), Value::Array(present))
                };
                Some(Target { id, group_id, key })
            })
            .collect()
    }

    /// Probes the cache for every target group. Returns whether any hit was checked
    /// against the conditions.
    async fn probe(
        &self,
        request: &FetchRequest,
        options: &FetchOptions,
        targets: &[Target],
        namespace: &str,
        resolved: &mut Keyed<Lookup>,
        excluded: &mut Vec<String>,
    ) -> bool {
        let mut groups: Vec<&str> = Vec::new();
        for target in targets {
            if !groups.contains(&target.group_id.as_str()) {
                groups.push(&target.group_id);
            }
        }
        let keys: Vec<String> = groups.iter().map(|id| format!("{namespace}{id}")).collect();

        let values = match self.kv.multi_get(&keys).await {
            Ok(values) => values,
            Err(err) => {
                counter!(METRIC_STORE_ERROR_TOTAL).increment(1);
                warn!(error = %err, "cache probe failed; treating every target as a miss");
                return false;
            }
        };

        let grouped = options.retrieve.group_by_first > 0;
        let mut filtered = false;
        let mut hits: Vec<&str> = Vec::new();
        for ((id, key), raw) in groups.iter().zip(&keys).zip(values) {
            let Some(raw) = raw else {
                continue;
            };
            filtered |= !options.conditions.is_empty();
            match self.check_hit(&raw, grouped, request, options) {
                Probe::Valid(entry) => {
                    counter!(METRIC_HIT_TOTAL).increment(1);
                    resolved.insert(*id, Lookup::Found(entry));
                    hits.push(key.as_str());
                }
                Probe::Excluded => {
                    counter!(METRIC_EXCLUDED_TOTAL).increment(1);
                    if options.diagnostics.verbose {
                        info!(id, "cached entry failed conditions; excluded");
                    }
                    excluded.push(id.to_string());
                }
                Probe::Invalid(reason) => {
                    if options.diagnostics.verbose {
                        info!(id, reason, "cached entry invalid; falling back to store");
                    }
                }
            }
        }

        let extend = options.extend_ttl.unwrap_or(options.update_cache);
        if extend && !hits.is_empty() {
            self.extend_ttl(&hits, options.diagnostics).await;
        }
        filtered
    }

    fn check_hit(
        &self,
        raw: &str,
        grouped: bool,
        request: &FetchRequest,
        options: &FetchOptions,
    ) -> Probe {
        let Ok(mut entry) = Entry::decode(raw, grouped) else {
            return Probe::Invalid("undecodable");
        };

        let columns = &request.columns;
        if !columns.is_empty() && self.config.compare_columns {
            let complete = entry
                .records()
                .iter()
                .all(|record| columns.iter().all(|column| record.contains_key(column)));
            if !complete {
                return Probe::Invalid("missing columns");
            }
        }

        if !options.conditions.is_empty() {
            let readable = entry.records().iter().all(|record| {
                options
                    .conditions
                    .conditions
                    .iter()
                    .all(|condition| record.contains_key(condition.bare_column()))
            });
            if !readable {
                return Probe::Invalid("missing condition columns");
            }

            let before = entry.len();
            let any_left = entry.retain_records(|record| options.conditions.evaluate(record));
            let all_passed = any_left && entry.len() == before;
            let policy = options
                .condition_miss_policy
                .unwrap_or(self.config.condition_miss_policy);
            match policy {
                _ if all_passed => {}
                ConditionMissPolicy::Exclude if any_left => {}
                ConditionMissPolicy::Exclude => return Probe::Excluded,
                ConditionMissPolicy::Refetch => return Probe::Invalid("failed conditions"),
            }
        }

        let keep: Vec<&str> = if options.retrieve.push_key_to_columns {
            request.key_columns.iter().map(KeyColumn::name).collect()
        } else {
            Vec::new()
        };
        entry.for_each_record_mut(|record| project(record, columns, &keep));
        Probe::Valid(entry)
    }

    async fn extend_ttl(&self, keys: &[&str], diagnostics: Diagnostics) {
        let Some(ttl) = self.config.ttl() else {
            return;
        };
        if diagnostics.test {
            debug!(keys = keys.len(), "dry run: skipping ttl refresh");
            return;
        }
        for key in keys {
            if let Err(err) = self.kv.expire(key, ttl).await {
                counter!(METRIC_STORE_ERROR_TOTAL).increment(1);
                warn!(key, error = %err, "failed to refresh cache ttl");
            }
        }
    }

    async fn write_back(&self, namespace: &str, id: &str, entry: &Entry, diagnostics: Diagnostics) {
        let encoded = match entry.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!(id, error = %err, "failed to serialize entry for cache");
                return;
            }
        };

        let ceiling = self.config.ceiling_for(entry.len());
        if encoded.len() >= ceiling {
            counter!(METRIC_OVERSIZED_TOTAL).increment(1);
            if diagnostics.verbose {
                info!(id, bytes = encoded.len(), ceiling, "entry over size ceiling; not cached");
            }
            return;
        }
        if diagnostics.test {
            if diagnostics.verbose {
                info!(id, "dry run: skipping cache write");
            }
            return;
        }

        let key = format!("{namespace}{id}");
        if let Err(err) = self
            .kv
            .set(&key, &encoded, SetMode::Always, self.config.ttl())
            .await
        {
            counter!(METRIC_STORE_ERROR_TOTAL).increment(1);
            warn!(key = %key, error = %err, "cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::application::retrieval::RetrievalConfig;
    use crate::domain::record::Record;
    use crate::infra::memory::{MemoryKv, MemoryTables};

    fn row(value: Value) -> Record {
        value.as_object().cloned().expect("object")
    }

    fn orders() -> Vec<Record> {
        vec![
            row(json!({"id": 41, "status": "open", "total": 10})),
            row(json!({"id": 42, "status": "paid", "total": 25})),
        ]
    }

    fn items() -> Vec<Record> {
        vec![
            row(json!({"order_id": 42, "item_id": 1, "sku": "a"})),
            row(json!({"order_id": 42, "item_id": 2, "sku": "b"})),
            row(json!({"order_id": 43, "item_id": 1, "sku": "c"})),
        ]
    }

    struct Harness {
        tables: Arc<MemoryTables>,
        kv: Arc<MemoryKv>,
        cache: CacheAside,
    }

    fn harness(config: CacheConfig) -> Harness {
        let tables = Arc::new(
            MemoryTables::new()
                .with_table("orders", orders())
                .with_table("order_items", items()),
        );
        let kv = Arc::new(MemoryKv::new());
        let engine = Arc::new(RetrievalEngine::new(
            tables.clone(),
            RetrievalConfig::default(),
        ));
        let cache = CacheAside::new(engine, kv.clone(), config);
        Harness { tables, kv, cache }
    }

    fn request(targets: Value) -> FetchRequest {
        FetchRequest {
            targets: targets.as_array().cloned().expect("array"),
            key_columns: vec![KeyColumn::new("id").expect("column")],
            table: "orders".into(),
            namespace: Some("cache:orders:".into()),
            columns: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cold_cache_is_populated_and_then_served() {
        let h = harness(CacheConfig::default());
        let first = h
            .cache
            .get_or_fetch(&request(json!(["42"])), &FetchOptions::default())
            .await
            .expect("lookup");

        let entry = first.get("42").and_then(Lookup::entry).expect("found");
        assert_eq!(entry.records()[0]["status"], json!("paid"));
        let cached = h.kv.get("cache:orders:42").await.expect("kv").expect("written");
        assert_eq!(
            serde_json::from_str::<Value>(&cached).expect("json"),
            json!({"id": 42, "status": "paid", "total": 25})
        );
        assert_eq!(h.tables.query_count(), 1);

        let second = h
            .cache
            .get_or_fetch(&request(json!(["42"])), &FetchOptions::default())
            .await
            .expect("lookup");
        assert_eq!(second, first);
        assert_eq!(h.tables.query_count(), 1);
    }

    #[tokio::test]
    async fn absent_and_unreachable_are_distinct_codes() {
        let h = harness(CacheConfig::default());
        let result = h
            .cache
            .get_or_fetch(&request(json!([99])), &FetchOptions::default())
            .await
            .expect("lookup");
        assert_eq!(result.get("99").and_then(Lookup::code), Some(Lookup::NOT_FOUND));

        h.tables.set_offline(true);
        let result = h
            .cache
            .get_or_fetch(&request(json!([41])), &FetchOptions::default())
            .await
            .expect("lookup");
        assert_eq!(
            result.get("41").and_then(Lookup::code),
            Some(Lookup::STORE_UNREACHABLE)
        );
        assert_eq!(h.kv.get("cache:orders:41").await.expect("kv"), None);
    }

    #[tokio::test]
    async fn oversized_entries_are_never_written() {
        let h = harness(CacheConfig {
            max_entry_bytes: 8,
            ..CacheConfig::default()
        });
        let result = h
            .cache
            .get_or_fetch(&request(json!([42])), &FetchOptions::default())
            .await
            .expect("lookup");
        assert!(result.get("42").and_then(Lookup::entry).is_some());
        assert_eq!(h.kv.get("cache:orders:42").await.expect("kv"), None);
        assert_eq!(h.kv.write_count(), 0);
    }

    async fn seed(kv: &MemoryKv, key: &str, value: Value) {
        kv.set(key, &value.to_string(), SetMode::Always, None)
            .await
            .expect("seed");
    }

    fn status_is(status: &str) -> ConditionSet {
        ConditionSet::from_json(&json!([["status", status, "="]])).expect("conditions")
    }

    #[tokio::test]
    async fn failed_conditions_exclude_without_store_fallback() {
        let h = harness(CacheConfig::default());
        seed(&h.kv, "cache:orders:42", json!({"id": 42, "status": "open"})).await;

        let options = FetchOptions {
            conditions: status_is("paid"),
            ..FetchOptions::default()
        };
        let result = h
            .cache
            .get_or_fetch(&request(json!([42])), &options)
            .await
            .expect("lookup");
        assert!(result.is_empty());
        assert_eq!(h.tables.query_count(), 0);
    }

    #[tokio::test]
    async fn refetch_policy_resolves_failed_conditions_from_store() {
        let h = harness(CacheConfig::default());
        seed(&h.kv, "cache:orders:42", json!({"id": 42, "status": "open"})).await;

        let options = FetchOptions {
            conditions: status_is("paid"),
            condition_miss_policy: Some(ConditionMissPolicy::Refetch),
            ..FetchOptions::default()
        };
        let result = h
            .cache
            .get_or_fetch(&request(json!([42, 41])), &options)
            .await
            .expect("lookup");

        let entry = result.get("42").and_then(Lookup::entry).expect("refetched");
        assert_eq!(entry.records()[0]["status"], json!("paid"));
        // 41 is open in the store and filtered in process after the cache check.
        assert_eq!(result.get("41").and_then(Lookup::code), Some(Lookup::NOT_FOUND));
        assert_eq!(h.tables.query_count(), 1);
    }

    #[tokio::test]
    async fn conditions_are_pushed_down_when_nothing_was_cached() {
        let h = harness(CacheConfig::default());
        let options = FetchOptions {
            conditions: status_is("paid"),
            ..FetchOptions::default()
        };
        let result = h
            .cache
            .get_or_fetch(&request(json!([41, 42])), &options)
            .await
            .expect("lookup");
        assert_eq!(result.get("41").and_then(Lookup::code), Some(Lookup::NOT_FOUND));
        assert!(result.get("42").and_then(Lookup::entry).is_some());
        assert_eq!(h.kv.get("cache:orders:41").await.expect("kv"), None);
    }

    #[tokio::test]
    async fn hits_missing_requested_columns_fall_back_and_extra_columns_are_trimmed() {
        let h = harness(CacheConfig::default());
        seed(&h.kv, "cache:orders:42", json!({"id": 42})).await;
        seed(
            &h.kv,
            "cache:orders:41",
            json!({"id": 41, "status": "open", "total": 10}),
        )
        .await;

        let mut req = request(json!([42, 41]));
        req.columns = vec!["status".into()];
        let result = h
            .cache
            .get_or_fetch(&req, &FetchOptions::default())
            .await
            .expect("lookup");

        assert_eq!(h.tables.query_count(), 1);
        let trimmed = result.get("41").and_then(Lookup::entry).expect("hit");
        assert_eq!(
            serde_json::to_value(trimmed).expect("json"),
            json!({"status": "open"})
        );
        let refetched = result.get("42").and_then(Lookup::entry).expect("fetched");
        assert_eq!(refetched.records()[0]["status"], json!("paid"));
    }

    #[tokio::test]
    async fn grouped_results_settle_every_target_in_the_group() {
        let h = harness(CacheConfig::default());
        let req = FetchRequest {
            targets: vec![json!(42), json!([42, 1])],
            key_columns: vec![
                KeyColumn::new("order_id").expect("column"),
                KeyColumn::new("item_id").expect("column"),
            ],
            table: "order_items".into(),
            namespace: Some("cache:items:".into()),
            columns: Vec::new(),
        };
        let options = FetchOptions {
            retrieve: RetrieveOptions {
                group_by_first: 1,
                ..RetrieveOptions::default()
            },
            ..FetchOptions::default()
        };

        let result = h.cache.get_or_fetch(&req, &options).await.expect("lookup");
        assert_eq!(result.len(), 1);
        let Some(Lookup::Found(Entry::Group(rows))) = result.get("42") else {
            panic!("expected grouped entry, got {result:?}");
        };
        assert_eq!(rows.keys().collect::<Vec<_>>(), ["1", "2"]);
        assert!(h.kv.get("cache:items:42").await.expect("kv").is_some());

        let again = h.cache.get_or_fetch(&req, &options).await.expect("lookup");
        assert_eq!(again, result);
        assert_eq!(h.tables.query_count(), 1);
    }

    #[tokio::test]
    async fn conditions_read_columns_outside_the_projection() {
        let h = harness(CacheConfig::default());
        seed(
            &h.kv,
            "cache:orders:42",
            json!({"id": 42, "status": "paid", "total": 25}),
        )
        .await;

        let mut req = request(json!([42]));
        req.columns = vec!["total".into()];
        let cached = FetchOptions {
            conditions: status_is("paid"),
            ..FetchOptions::default()
        };
        let from_cache = h.cache.get_or_fetch(&req, &cached).await.expect("lookup");
        assert_eq!(h.tables.query_count(), 0);

        let uncached = FetchOptions {
            use_cache: Some(false),
            ..cached.clone()
        };
        let from_store = h.cache.get_or_fetch(&req, &uncached).await.expect("lookup");

        assert_eq!(
            serde_json::to_value(&from_cache).expect("json"),
            json!({"42": {"total": 25}})
        );
        assert_eq!(from_cache, from_store);
    }

    #[tokio::test]
    async fn store_rows_filtered_in_process_keep_condition_columns_until_checked() {
        let h = harness(CacheConfig::default());
        seed(
            &h.kv,
            "cache:orders:41",
            json!({"id": 41, "status": "open", "total": 10}),
        )
        .await;

        let mut req = request(json!([41, 42]));
        req.columns = vec!["total".into()];
        let options = FetchOptions {
            conditions: status_is("paid"),
            ..FetchOptions::default()
        };
        let result = h.cache.get_or_fetch(&req, &options).await.expect("lookup");

        assert_eq!(
            serde_json::to_value(&result).expect("json"),
            json!({"42": {"total": 25}})
        );
        let written = h.kv.get("cache:orders:42").await.expect("kv").expect("written");
        let written: Value = serde_json::from_str(&written).expect("json");
        assert_eq!(written["status"], json!("paid"));
    }

    #[tokio::test]
    async fn hits_without_condition_columns_are_refetched() {
        let h = harness(CacheConfig::default());
        seed(&h.kv, "cache:orders:42", json!({"id": 42, "total": 25})).await;

        let mut req = request(json!([42]));
        req.columns = vec!["total".into()];
        let options = FetchOptions {
            conditions: status_is("paid"),
            ..FetchOptions::default()
        };
        let result = h.cache.get_or_fetch(&req, &options).await.expect("lookup");

        assert_eq!(h.tables.query_count(), 1);
        assert_eq!(
            serde_json::to_value(&result).expect("json"),
            json!({"42": {"total": 25}})
        );
    }

    #[tokio::test]
    async fn grouped_fetch_with_conditions_caches_the_whole_group() {
        let h = harness(CacheConfig::default());
        let req = FetchRequest {
            targets: vec![json!(42)],
            key_columns: vec![
                KeyColumn::new("order_id").expect("column"),
                KeyColumn::new("item_id").expect("column"),
            ],
            table: "order_items".into(),
            namespace: Some("cache:items:".into()),
            columns: Vec::new(),
        };
        let grouped = RetrieveOptions {
            group_by_first: 1,
            ..RetrieveOptions::default()
        };
        let filtered = FetchOptions {
            conditions: ConditionSet::from_json(&json!([["sku", "a", "="]])).expect("conditions"),
            retrieve: grouped.clone(),
            ..FetchOptions::default()
        };

        let result = h.cache.get_or_fetch(&req, &filtered).await.expect("lookup");
        let Some(Lookup::Found(Entry::Group(rows))) = result.get("42") else {
            panic!("expected grouped entry, got {result:?}");
        };
        assert_eq!(rows.keys().collect::<Vec<_>>(), ["1"]);

        let plain = FetchOptions {
            retrieve: grouped,
            ..FetchOptions::default()
        };
        let result = h.cache.get_or_fetch(&req, &plain).await.expect("lookup");
        let Some(Lookup::Found(Entry::Group(rows))) = result.get("42") else {
            panic!("expected grouped entry, got {result:?}");
        };
        assert_eq!(rows.keys().collect::<Vec<_>>(), ["1", "2"]);
        assert_eq!(h.tables.query_count(), 1);
    }

    #[tokio::test]
    async fn dry_run_performs_no_writes() {
        let h = harness(CacheConfig::default());
        let options = FetchOptions {
            diagnostics: Diagnostics::dry_run(),
            ..FetchOptions::default()
        };
        let result = h
            .cache
            .get_or_fetch(&request(json!([41, 42])), &options)
            .await
            .expect("lookup");
        assert_eq!(result.len(), 2);
        assert_eq!(h.kv.write_count(), 0);
        assert_eq!(
            h.cache
                .invalidate("cache:orders:", &["41".into()], Diagnostics::dry_run())
                .await,
            Ok(0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn hits_refresh_their_ttl() {
        let h = harness(CacheConfig::default());
        let options = FetchOptions::default();
        h.cache
            .get_or_fetch(&request(json!([42])), &options)
            .await
            .expect("lookup");

        tokio::time::advance(Duration::from_secs(3000)).await;
        let before = h.kv.ttl("cache:orders:42").await.expect("kv").expect("ttl");
        assert!(before <= Duration::from_secs(600));

        h.cache
            .get_or_fetch(&request(json!([42])), &options)
            .await
            .expect("lookup");
        let after = h.kv.ttl("cache:orders:42").await.expect("kv").expect("ttl");
        assert_eq!(after, Duration::from_secs(3600));

        let no_extend = FetchOptions {
            extend_ttl: Some(false),
            ..FetchOptions::default()
        };
        tokio::time::advance(Duration::from_secs(100)).await;
        h.cache
            .get_or_fetch(&request(json!([42])), &no_extend)
            .await
            .expect("lookup");
        let untouched = h.kv.ttl("cache:orders:42").await.expect("kv").expect("ttl");
        assert_eq!(untouched, Duration::from_secs(3500));
    }

    #[tokio::test]
    async fn invalidate_drops_entries() {
        let h = harness(CacheConfig::default());
        h.cache
            .get_or_fetch(&request(json!([41, 42])), &FetchOptions::default())
            .await
            .expect("lookup");
        let removed = h
            .cache
            .invalidate(
                "cache:orders:",
                &["41".into(), "42".into(), "99".into()],
                Diagnostics::default(),
            )
            .await
            .expect("delete");
        assert_eq!(removed, 2);
        assert_eq!(h.kv.get("cache:orders:41").await.expect("kv"), None);
    }

    #[tokio::test]
    async fn unreachable_cache_degrades_to_store_reads() {
        let h = harness(CacheConfig::default());
        h.kv.set_offline(true);
        let result = h
            .cache
            .get_or_fetch(&request(json!([42])), &FetchOptions::default())
            .await
            .expect("lookup");
        assert!(result.get("42").and_then(Lookup::entry).is_some());
    }

    #[test]
    fn covers_matches_nested_identifiers() {
        assert!(covers("42", "42", "/"));
        assert!(covers("42", "42/1", "/"));
        assert!(covers("42/1", "42", "/"));
        assert!(!covers("4", "42", "/"));
        assert!(!covers("42", "421", ""));
    }
}
