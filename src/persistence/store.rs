//! Key-value/document store boundary.
//!
//! Everything this crate persists goes through [`DocumentStore`]: daily records,
//! summaries, ledger entries, and the ledger's secondary index. Documents are
//! `serde_json::Value`s; typed access goes through [`get_json`] and [`put_json`],
//! which is where stored documents are decoded and validated.

use std::collections::BTreeMap;
use std::io;
use std::sync::{PoisonError, RwLock};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error in a file-backed store.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The backend cannot serve requests (poisoned lock, closed connection).
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl<T> From<PoisonError<T>> for StoreError {
    fn from(e: PoisonError<T>) -> Self {
        StoreError::Unavailable(e.to_string())
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of [`DocumentStore::insert_new`].
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The key was absent and now holds the new value.
    Inserted,
    /// The key already existed; the stored value is returned untouched.
    AlreadyExists(Value),
}

/// A key-value/document store.
///
/// Keys are `/`-separated paths; [`query_prefix`](DocumentStore::query_prefix)
/// returns matches in ascending key order, so keys ending in a sortable
/// timestamp double as a chronological index.
pub trait DocumentStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>>;

    fn put(&self, key: &str, value: Value) -> Result<()>;

    /// Atomically stores `value` under `key` only if the key is absent.
    fn insert_new(&self, key: &str, value: Value) -> Result<InsertOutcome>;

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>>;
}

/// A stored document that does not decode into its expected type.
#[derive(Debug, Error)]
#[error("corrupt document at {key}: {source}")]
pub struct CorruptDocument {
    pub key: String,
    #[source]
    pub source: serde_json::Error,
}

/// Error from the typed helpers: either the store failed or the document is corrupt.
#[derive(Debug, Error)]
pub enum TypedError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Corrupt(#[from] CorruptDocument),
}

/// Reads and decodes a document.
pub fn get_json<T: DeserializeOwned>(
    store: &dyn DocumentStore,
    key: &str,
) -> std::result::Result<Option<T>, TypedError> {
    match store.get(key)? {
        Some(value) => Ok(Some(decode(key, value)?)),
        None => Ok(None),
    }
}

/// Encodes and writes a document.
pub fn put_json<T: Serialize>(store: &dyn DocumentStore, key: &str, value: &T) -> Result<()> {
    store.put(key, serde_json::to_value(value)?)
}

/// Decodes a document read under `key`.
pub fn decode<T: DeserializeOwned>(
    key: &str,
    value: Value,
) -> std::result::Result<T, CorruptDocument> {
    serde_json::from_value(value).map_err(|source| CorruptDocument {
        key: key.to_string(),
        source,
    })
}

/// In-memory store backed by an ordered map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<BTreeMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.docs.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DocumentStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.docs.read()?.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        self.docs.write()?.insert(key.to_string(), value);
        Ok(())
    }

    fn insert_new(&self, key: &str, value: Value) -> Result<InsertOutcome> {
        let mut docs = self.docs.write()?;
        if let Some(existing) = docs.get(key) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        docs.insert(key.to_string(), value);
        Ok(InsertOutcome::Inserted)
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let docs = self.docs.read()?;
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
