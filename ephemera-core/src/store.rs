//! The persistent-store seam.
//!
//! The core only ever reads through [`Store`]. Records are loose JSON objects
//! with named fields; each cache converts them into its typed form once, at
//! this boundary. [`MemoryStore`] is the in-process implementation used by the
//! headless front end and the test harness.

use crate::id::ObjectId;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};
use thiserror::Error;
use tracing::trace;

/// Errors raised by a store implementation.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Request for {key} failed: {reason}")]
    RequestFailed { key: String, reason: String },
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Which slice of an object's data a record holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    /// Per-kind metadata (character assets, variable values, computed sources).
    Meta,
    /// One asset's overlay of the object (its appearances).
    Asset(String),
    /// Stored ancestry edges of a graph node.
    Ancestry,
    /// Stored descent edges of a graph node.
    Descent,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Category::Meta => write!(f, "Meta"),
            Category::Asset(asset) => write!(f, "ASSET#{asset}"),
            Category::Ancestry => write!(f, "Ancestry"),
            Category::Descent => write!(f, "Descent"),
        }
    }
}

/// Address of one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey {
    pub id: ObjectId,
    pub category: Category,
}

impl StoreKey {
    pub fn new(id: ObjectId, category: Category) -> Self {
        Self { id, category }
    }

    pub fn meta(id: ObjectId) -> Self {
        Self::new(id, Category::Meta)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.id, self.category)
    }
}

/// A record returned from a batched read.
#[derive(Debug, Clone)]
pub struct StoreRecord {
    pub key: StoreKey,
    pub value: Value,
}

/// Read access to the system of record.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read one record, `None` if it does not exist.
    async fn get_item(&self, id: &ObjectId, category: &Category) -> StoreResult<Option<Value>>;

    /// Read many records in one round trip. Absent records are omitted.
    async fn batch_get_item(&self, keys: &[StoreKey]) -> StoreResult<Vec<StoreRecord>>;
}

/// Call counters kept by [`MemoryStore`].
#[derive(Debug, Default)]
pub struct StoreStats {
    get_item: AtomicUsize,
    batch_get_item: AtomicUsize,
}

impl StoreStats {
    pub fn get_item_calls(&self) -> usize {
        self.get_item.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_get_item.load(Ordering::SeqCst)
    }

    /// Total round trips of either kind.
    pub fn round_trips(&self) -> usize {
        self.get_item_calls() + self.batch_calls()
    }
}

/// An in-memory [`Store`].
///
/// Every read yields to the scheduler once, so concurrent requests interleave
/// the way they would against a real backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<StoreKey, Value>>,
    failing: RwLock<HashSet<StoreKey>>,
    batches: Mutex<Vec<Vec<StoreKey>>>,
    stats: StoreStats,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn put_item(&self, key: StoreKey, value: Value) {
        self.records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, value);
    }

    /// Make every read touching `key` fail until [`heal`](Self::heal) is called.
    pub fn fail_key(&self, key: StoreKey) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key);
    }

    pub fn heal(&self, key: &StoreKey) {
        self.failing
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// The key lists of every batched read so far, in call order.
    pub fn batch_log(&self) -> Vec<Vec<StoreKey>> {
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn check(&self, key: &StoreKey) -> StoreResult<()> {
        let failing = self.failing.read().unwrap_or_else(PoisonError::into_inner);
        if failing.contains(key) {
            return Err(StoreError::RequestFailed {
                key: key.to_string(),
                reason: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_item(&self, id: &ObjectId, category: &Category) -> StoreResult<Option<Value>> {
        self.stats.get_item.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;

        let key = StoreKey::new(id.clone(), category.clone());
        self.check(&key)?;
        trace!(%key, "get_item");
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(records.get(&key).cloned())
    }

    async fn batch_get_item(&self, keys: &[StoreKey]) -> StoreResult<Vec<StoreRecord>> {
        self.stats.batch_get_item.fetch_add(1, Ordering::SeqCst);
        self.batches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(keys.to_vec());
        tokio::task::yield_now().await;

        for key in keys {
            self.check(key)?;
        }
        trace!(keys = keys.len(), "batch_get_item");
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        Ok(keys
            .iter()
            .filter_map(|key| {
                records.get(key).map(|value| StoreRecord {
                    key: key.clone(),
                    value: value.clone(),
                })
            })
            .collect())
    }
}
