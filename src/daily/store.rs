//! Per-(user, date) record storage.

use std::sync::{Arc, Mutex};

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, warn};

use crate::persistence::{CorruptDocument, DocumentStore, StoreError, TypedError, keys};
use crate::persistence::store::{decode, get_json, put_json};
use crate::types::{DailyRecord, RecordError, UserId};

use super::merge::{MergeError, merge};

#[derive(Debug, Error)]
pub enum DailyStoreError {
    #[error("merge failed: {0}")]
    Merge(#[from] MergeError),

    #[error("invalid record: {0}")]
    Invalid(#[from] RecordError),

    #[error("day {date} for {user} is finalized")]
    Frozen { user: UserId, date: NaiveDate },

    #[error("no record for {user} on {date}")]
    NotFound { user: UserId, date: NaiveDate },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Corrupt(#[from] CorruptDocument),
}

impl From<TypedError> for DailyStoreError {
    fn from(e: TypedError) -> Self {
        match e {
            TypedError::Store(e) => DailyStoreError::Store(e),
            TypedError::Corrupt(e) => DailyStoreError::Corrupt(e),
        }
    }
}

/// Result type for daily store operations.
pub type Result<T> = std::result::Result<T, DailyStoreError>;

/// Holds one [`DailyRecord`] per (user, date).
///
/// Readings from several sources for the same day are max-merged on upsert.
///
/// `upsert` and `finalize` read, modify and write back. They are serialized
/// across this store and its clones. Separate instances over the same backing
/// store, or separate processes, are not coordinated: callers running more
/// than one must route each (user, date) through a single instance.
#[derive(Clone)]
pub struct DailyRecordStore {
    store: Arc<dyn DocumentStore>,

    /// Held for the duration of every read-modify-write.
    writes: Arc<Mutex<()>>,
}

impl DailyRecordStore {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        DailyRecordStore {
            store,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// Stores a reading, merging it into any existing record for the same day.
    ///
    /// Returns the record as stored. Fails with [`DailyStoreError::Frozen`] if
    /// the day has been finalized.
    pub fn upsert(&self, record: DailyRecord) -> Result<DailyRecord> {
        record.validate()?;
        let key = keys::daily(&record.user_id, record.date);
        let _writing = self.writes.lock().map_err(StoreError::from)?;

        let stored = match get_json::<DailyRecord>(self.store.as_ref(), &key)? {
            Some(existing) if existing.is_final => {
                warn!(
                    user = %record.user_id,
                    date = %record.date,
                    source = %record.source,
                    "Rejecting upsert onto finalized day"
                );
                return Err(DailyStoreError::Frozen {
                    user: record.user_id,
                    date: record.date,
                });
            }
            Some(existing) => {
                let merged = merge(&existing, &record)?;
                debug!(
                    user = %record.user_id,
                    date = %record.date,
                    existing_source = %existing.source,
                    incoming_source = %record.source,
                    steps = merged.steps,
                    "Merged reading into daily record"
                );
                merged
            }
            None => record,
        };

        put_json(self.store.as_ref(), &key, &stored)?;
        Ok(stored)
    }

    /// The stored record for `user` on `date`.
    pub fn get(&self, user: &UserId, date: NaiveDate) -> Result<Option<DailyRecord>> {
        Ok(get_json(self.store.as_ref(), &keys::daily(user, date))?)
    }

    /// Records for `user` with `start <= date <= end`, in date order.
    pub fn get_range(
        &self,
        user: &UserId,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<DailyRecord>> {
        if start > end {
            return Ok(vec![]);
        }
        let first = keys::daily(user, start);
        let last = keys::daily(user, end);

        self.store
            .query_prefix(&keys::daily_prefix(user))?
            .into_iter()
            .filter(|(k, _)| k.as_str() >= first.as_str() && k.as_str() <= last.as_str())
            .map(|(k, v)| decode(&k, v).map_err(DailyStoreError::from))
            .collect()
    }

    /// Freezes a day and returns the frozen record.
    ///
    /// Finalizing twice is allowed and returns the same record.
    pub fn finalize(&self, user: &UserId, date: NaiveDate) -> Result<DailyRecord> {
        let key = keys::daily(user, date);
        let _writing = self.writes.lock().map_err(StoreError::from)?;
        let mut record = get_json::<DailyRecord>(self.store.as_ref(), &key)?.ok_or_else(|| {
            DailyStoreError::NotFound {
                user: user.clone(),
                date,
            }
        })?;
        if !record.is_final {
            record.is_final = true;
            put_json(self.store.as_ref(), &key, &record)?;
            debug!(user = %user, date = %date, steps = record.steps, "Finalized day");
        }
        Ok(record)
    }
}
