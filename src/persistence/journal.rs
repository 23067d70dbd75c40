//! Append-only journal store with crash-safe replay.
//!
//! Every `put` is appended to a JSON Lines file (one JSON object per line) and
//! applied to an in-memory map. On open, the journal is replayed to rebuild the
//! map; later records for a key win. Nothing is ever rewritten in place, so the
//! file doubles as an audit trail of every ledger transition.
//!
//! # Recovery
//!
//! - A final line that does not parse (crash mid-write) is truncated.
//! - A record whose sequence number is not strictly greater than its
//!   predecessor's is treated as corruption; the file is truncated there.
//!
//! # fsync Strategy
//!
//! - [`SyncPolicy::EveryWrite`]: `sync_all()` after each appended record
//! - [`SyncPolicy::Manual`]: no fsync; the caller batches and calls [`JournalStore::sync`]

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::store::{DocumentStore, InsertOutcome, Result};

/// When appended records are flushed to disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SyncPolicy {
    #[default]
    EveryWrite,
    Manual,
}

/// One line of the journal.
///
/// Example JSON:
/// ```json
/// {"seq":7,"ts":"2024-01-15T10:00:00Z","key":"summary/alice","value":{...}}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    pub key: String,
    pub value: Value,
}

struct Inner {
    file: File,
    next_seq: u64,
    docs: BTreeMap<String, Value>,
}

/// A [`DocumentStore`] persisted as an append-only JSON Lines journal.
pub struct JournalStore {
    path: PathBuf,
    policy: SyncPolicy,
    inner: Mutex<Inner>,
}

impl JournalStore {
    /// Opens (or creates) the journal at `path`, replaying any existing records.
    pub fn open(path: impl AsRef<Path>, policy: SyncPolicy) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (records, next_seq) = replay(&path)?;

        let mut docs = BTreeMap::new();
        for record in records {
            docs.insert(record.key, record.value);
        }
        debug!(path = %path.display(), docs = docs.len(), next_seq, "Journal replayed");

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;

        Ok(JournalStore {
            path,
            policy,
            inner: Mutex::new(Inner {
                file,
                next_seq,
                docs,
            }),
        })
    }

    /// Forces fsync of the journal file.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock()?;
        inner.file.sync_all()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the sequence number the next record will get.
    pub fn next_seq(&self) -> Result<u64> {
        Ok(self.inner.lock()?.next_seq)
    }

    fn append(&self, inner: &mut Inner, key: &str, value: Value) -> Result<()> {
        let policy = self.policy;
        append_with(inner, key, value, |file| match policy {
            SyncPolicy::EveryWrite => file.sync_all(),
            SyncPolicy::Manual => Ok(()),
        })
    }
}

/// Writes one record, then runs `sync` on the file.
///
/// Once the line is written the record is live: its sequence number is
/// consumed and the map updated even if `sync` fails, so the next record never
/// reuses a sequence number already on disk. A sync error only means the
/// record's durability is unconfirmed.
fn append_with(
    inner: &mut Inner,
    key: &str,
    value: Value,
    sync: impl FnOnce(&File) -> io::Result<()>,
) -> Result<()> {
    let record = JournalRecord {
        seq: inner.next_seq,
        ts: Utc::now(),
        key: key.to_string(),
        value,
    };

    let json = serde_json::to_string(&record)?;
    writeln!(inner.file, "{}", json)?;
    inner.next_seq += 1;
    inner.docs.insert(record.key, record.value);

    if let Err(e) = sync(&inner.file) {
        warn!(seq = record.seq, error = %e, "Journal fsync failed after write");
        return Err(e.into());
    }
    Ok(())
}

impl DocumentStore for JournalStore {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.inner.lock()?.docs.get(key).cloned())
    }

    fn put(&self, key: &str, value: Value) -> Result<()> {
        let mut inner = self.inner.lock()?;
        self.append(&mut inner, key, value)
    }

    fn insert_new(&self, key: &str, value: Value) -> Result<InsertOutcome> {
        let mut inner = self.inner.lock()?;
        if let Some(existing) = inner.docs.get(key) {
            return Ok(InsertOutcome::AlreadyExists(existing.clone()));
        }
        self.append(&mut inner, key, value)?;
        Ok(InsertOutcome::Inserted)
    }

    fn query_prefix(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Replays a journal file, truncating any invalid tail.
///
/// Returns `(records, next_seq)`. A missing or empty file yields `(vec![], 0)`.
pub fn replay(path: &Path) -> Result<(Vec<JournalRecord>, u64)> {
    if !path.exists() {
        return Ok((vec![], 0));
    }

    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut records = Vec::new();
    let mut last_valid_pos = 0u64;
    let mut current_pos = 0u64;
    let mut max_seq: Option<u64> = None;

    loop {
        let mut line = String::new();
        let bytes_read = match reader.read_line(&mut line) {
            Ok(n) => n,
            // Torn multi-byte sequence at EOF
            Err(e) if e.kind() == io::ErrorKind::InvalidData => break,
            Err(e) => return Err(e.into()),
        };
        if bytes_read == 0 {
            break;
        }

        let line_start = current_pos;
        current_pos += bytes_read as u64;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            last_valid_pos = current_pos;
            continue;
        }

        match serde_json::from_str::<JournalRecord>(trimmed) {
            Ok(record) if max_seq.is_some_and(|prev| record.seq <= prev) => {
                last_valid_pos = line_start;
                break;
            }
            Ok(record) => {
                max_seq = Some(record.seq);
                records.push(record);
                last_valid_pos = current_pos;
            }
            Err(_) => {
                last_valid_pos = line_start;
                break;
            }
        }
    }

    if last_valid_pos < file_len {
        warn!(
            path = %path.display(),
            kept_bytes = last_valid_pos,
            dropped_bytes = file_len - last_valid_pos,
            "Truncating invalid journal tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(last_valid_pos)?;
        file.sync_all()?;
    }

    let next_seq = max_seq.map(|s| s + 1).unwrap_or(0);
    Ok((records, next_seq))
}
