//! In-process document store.
//!
//! Backs the server when no database is configured and stands in for
//! Postgres in tests. Records live in insertion order per collection.
//! `set_unreachable` makes every call fail the way a dead backend would.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{DocumentStore, Record, StoreError, record_id};

/// Per-operation call counters, including failed calls.
#[cfg(test)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounts {
    pub reads: u64,
    pub writes: u64,
    pub updates: u64,
    pub deletes: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<Record>>>,
    unreachable: AtomicBool,
    reads: AtomicU64,
    writes: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    #[cfg(test)]
    #[must_use]
    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            reads: self.reads.load(Ordering::SeqCst),
            writes: self.writes.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    /// Snapshot of every record in a collection.
    #[cfg(test)]
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.lock().get(collection).cloned().unwrap_or_default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Record>>> {
        self.collections
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StoreError::Unreachable);
        }
        Ok(())
    }
}

fn matches_filter(record: &Record, filter: &Record) -> bool {
    filter
        .iter()
        .all(|(key, value)| record.get(key) == Some(value))
}

fn same_id(record: &Record, id: &str) -> bool {
    record.get("id").and_then(serde_json::Value::as_str) == Some(id)
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, collection: &str, filter: &Record) -> Result<Vec<Record>, StoreError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self
            .lock()
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| matches_filter(r, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn write(&self, collection: &str, record: &Record) -> Result<u64, StoreError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let id = record_id(record)?;
        let mut collections = self.lock();
        let records = collections.entry(collection.to_owned()).or_default();
        if records.iter().any(|r| same_id(r, id)) {
            return Err(StoreError::Conflict { collection: collection.to_owned(), id: id.to_owned() });
        }
        records.push(record.clone());
        Ok(1)
    }

    async fn update(&self, collection: &str, id: &str, fields: &Record) -> Result<u64, StoreError> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let mut collections = self.lock();
        let Some(record) = collections
            .get_mut(collection)
            .and_then(|records| records.iter_mut().find(|r| same_id(r, id)))
        else {
            return Ok(0);
        };
        for (key, value) in fields {
            record.insert(key.clone(), value.clone());
        }
        Ok(1)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<u64, StoreError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        let mut collections = self.lock();
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| !same_id(r, id));
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;
