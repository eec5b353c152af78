//! Postgres-backed document store.
//!
//! DESIGN
//! ======
//! One `documents` table holds every collection. `body` is the full JSONB
//! record; `(collection, id)` is the primary key so lookups by record id
//! never scan. `read` uses JSON containment (`@>`) for filters and `update`
//! merges fields with `||`, so callers only ever touch the fields they name.

use sqlx::PgPool;

use super::{DocumentStore, Record, StoreError, record_id};

#[derive(Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl DocumentStore for PgDocumentStore {
    async fn read(&self, collection: &str, filter: &Record) -> Result<Vec<Record>, StoreError> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT body FROM documents WHERE collection = $1 AND body @> $2 ORDER BY created_at",
        )
        .bind(collection)
        .bind(serde_json::Value::Object(filter.clone()))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|body| match body {
                serde_json::Value::Object(record) => Some(record),
                _ => None,
            })
            .collect())
    }

    async fn write(&self, collection: &str, record: &Record) -> Result<u64, StoreError> {
        let id = record_id(record)?;
        let result = sqlx::query("INSERT INTO documents (collection, id, body) VALUES ($1, $2, $3)")
            .bind(collection)
            .bind(id)
            .bind(serde_json::Value::Object(record.clone()))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn update(&self, collection: &str, id: &str, fields: &Record) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE documents SET body = body || $3, updated_at = now() WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(serde_json::Value::Object(fields.clone()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;
