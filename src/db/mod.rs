//! Document store — the persistence collaborator.
//!
//! SYSTEM CONTEXT
//! ==============
//! The sync core treats persistence as an opaque document store: records
//! are JSON objects keyed by their `id` field and grouped by collection
//! name. Startup picks an implementation: Postgres when `DATABASE_URL` is
//! configured, otherwise the process-local [`MemoryStore`].
//!
//! ERROR HANDLING
//! ==============
//! Every operation returns `Result`; callers decide whether a failure means
//! "use defaults" (reads at startup) or "log and move on" (deferred writes).
//! Nothing here panics on an unreachable backend.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

pub use memory::MemoryStore;
pub use postgres::PgDocumentStore;

/// Collection holding the main drawing record.
pub const DRAWINGS: &str = "drawings";

/// Collection holding sticky-note records.
pub const STICKY_NOTES: &str = "stickyNotes";

/// A stored document. Always carries a string `id` field.
pub type Record = serde_json::Map<String, serde_json::Value>;

const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;

// =============================================================================
// ERROR
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unreachable")]
    Unreachable,
    #[error("record has no string id")]
    MissingId,
    #[error("record already exists: {collection}/{id}")]
    Conflict { collection: String, id: String },
}

impl crate::frame::ErrorCode for StoreError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Database(_) => "E_DATABASE",
            Self::Unreachable => "E_STORE_UNREACHABLE",
            Self::MissingId => "E_MISSING_ID",
            Self::Conflict { .. } => "E_CONFLICT",
        }
    }
}

// =============================================================================
// TRAIT
// =============================================================================

/// Collection-scoped CRUD over JSON documents. Enables mocking in tests.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    /// Return every record in `collection` whose fields contain `filter`.
    /// An empty filter matches all records.
    async fn read(&self, collection: &str, filter: &Record) -> Result<Vec<Record>, StoreError>;

    /// Insert a record. Returns the number of records written.
    async fn write(&self, collection: &str, record: &Record) -> Result<u64, StoreError>;

    /// Set the named `fields` on the record matching `id`. Returns the number
    /// of records matched.
    async fn update(&self, collection: &str, id: &str, fields: &Record) -> Result<u64, StoreError>;

    /// Delete the record matching `id`. Returns the number of records removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<u64, StoreError>;
}

pub(crate) fn record_id(record: &Record) -> Result<&str, StoreError> {
    record
        .get("id")
        .and_then(serde_json::Value::as_str)
        .ok_or(StoreError::MissingId)
}

// =============================================================================
// POOL
// =============================================================================

fn db_max_connections() -> u32 {
    crate::config::env_parse("DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS)
}

/// Initialize the `PostgreSQL` connection pool and run migrations.
///
/// # Errors
///
/// Returns an error if the connection or migrations fail.
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(db_max_connections())
        .connect(database_url)
        .await?;

    sqlx::migrate!("src/db/migrations").run(&pool).await?;

    Ok(pool)
}

/// Build a pool that connects on first use. Used when the database is down
/// at startup so later operations can retry instead of the process exiting.
///
/// # Errors
///
/// Returns an error only if `database_url` is not a valid connection string.
pub fn lazy_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(db_max_connections())
        .connect_lazy(database_url)
}

/// Pick the document store. Postgres when configured, falling back to a
/// lazily connecting pool if it is down at startup and to memory if the
/// URL cannot be used at all. Memory when unconfigured.
pub async fn open_store(database_url: Option<&str>) -> Arc<dyn DocumentStore> {
    let Some(url) = database_url else {
        tracing::warn!("DATABASE_URL not set; using in-memory store");
        return Arc::new(MemoryStore::new());
    };

    match init_pool(url).await {
        Ok(pool) => {
            tracing::info!("database connected and migrated");
            Arc::new(PgDocumentStore::new(pool))
        }
        Err(e) => {
            tracing::error!(error = %e, "database init failed; continuing with lazy reconnect");
            match lazy_pool(url) {
                Ok(pool) => Arc::new(PgDocumentStore::new(pool)),
                Err(e) => {
                    tracing::error!(error = %e, "DATABASE_URL unusable; using in-memory store");
                    Arc::new(MemoryStore::new())
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
