//! Postgres-backed relational store.

mod sql;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::debug;

use crate::application::repos::{RelationalStore, StoreError, TableQuery};
use crate::domain::record::Record;

#[derive(Clone)]
pub struct PostgresStore {
    pool: Arc<PgPool>,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1")
            .execute(self.pool())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl RelationalStore for PostgresStore {
    async fn execute_query(&self, query: &TableQuery) -> Result<Vec<Record>, StoreError> {
        let mut qb = sql::build_select(query)?;
        debug!(sql = qb.sql(), "executing table query");

        let rows: Vec<Value> = qb
            .build_query_scalar::<Value>()
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| match row {
                Value::Object(record) => Ok(record),
                other => Err(StoreError::query(format!(
                    "expected a row object, got `{other}`"
                ))),
            })
            .collect()
    }
}
