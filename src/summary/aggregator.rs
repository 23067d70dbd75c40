//! Lifetime rollups over finalized days.
//!
//! Two operations mutate a summary: `commit_day`, once per date when the day
//! rolls over, and `increment_today`, for same-day corrections before the day
//! is committed. Under [`CommitPolicy::Trusting`] the aggregator does not track
//! which dates were committed and a repeated commit counts twice; callers must
//! guarantee at most one commit per date. [`CommitPolicy::Idempotent`] records
//! committed dates on the summary and turns a repeat into a no-op.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{NaiveDate, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::persistence::store::{get_json, put_json};
use crate::persistence::{CorruptDocument, DocumentStore, StoreError, TypedError, keys};
use crate::types::{DailyRecord, SummaryRecord, UserId};

#[derive(Debug, Error)]
pub enum SummaryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Corrupt(#[from] CorruptDocument),
}

impl From<TypedError> for SummaryError {
    fn from(e: TypedError) -> Self {
        match e {
            TypedError::Store(e) => SummaryError::Store(e),
            TypedError::Corrupt(e) => SummaryError::Corrupt(e),
        }
    }
}

/// Result type for summary operations.
pub type Result<T> = std::result::Result<T, SummaryError>;

/// How repeated commits of the same date are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Every commit counts.
    #[default]
    Trusting,
    /// Each date counts once; repeats are ignored.
    Idempotent,
}

impl FromStr for CommitPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trusting" => Ok(CommitPolicy::Trusting),
            "idempotent" => Ok(CommitPolicy::Idempotent),
            other => Err(format!("unknown commit policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SummaryConfig {
    pub commit_policy: CommitPolicy,
}

/// Totals of one finished day.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DayTotals {
    pub steps: u64,
    pub distance_km: f64,
    pub calories: u64,
    pub active_minutes: u64,
}

impl From<&DailyRecord> for DayTotals {
    fn from(r: &DailyRecord) -> Self {
        DayTotals {
            steps: r.steps,
            distance_km: r.distance_km,
            calories: u64::from(r.calories),
            active_minutes: u64::from(r.active_minutes),
        }
    }
}

/// Signed same-day corrections.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TotalsDelta {
    pub steps: i64,
    pub distance_km: f64,
    pub calories: i64,
    pub active_minutes: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(SummaryRecord),
    /// Only under [`CommitPolicy::Idempotent`]: the date was already counted.
    AlreadyCommitted(SummaryRecord),
}

impl CommitOutcome {
    pub fn summary(&self) -> &SummaryRecord {
        match self {
            CommitOutcome::Committed(s) | CommitOutcome::AlreadyCommitted(s) => s,
        }
    }
}

fn add_signed(total: u64, delta: i64) -> u64 {
    if delta >= 0 {
        total.saturating_add(delta.unsigned_abs())
    } else {
        total.saturating_sub(delta.unsigned_abs())
    }
}

/// Maintains one [`SummaryRecord`] per user.
///
/// Mutations are read-modify-write on the user's summary. They are serialized
/// across this aggregator and its clones; separate instances over the same
/// store are not coordinated, so each user must be routed through one.
#[derive(Clone)]
pub struct SummaryAggregator {
    store: Arc<dyn DocumentStore>,
    config: SummaryConfig,

    /// Held for the duration of every read-modify-write.
    writes: Arc<Mutex<()>>,
}

impl SummaryAggregator {
    pub fn new(store: Arc<dyn DocumentStore>, config: SummaryConfig) -> Self {
        SummaryAggregator {
            store,
            config,
            writes: Arc::new(Mutex::new(())),
        }
    }

    /// The stored summary, if the user has one.
    pub fn get(&self, user: &UserId) -> Result<Option<SummaryRecord>> {
        Ok(get_json(self.store.as_ref(), &keys::summary(user))?)
    }

    fn load_or_empty(&self, user: &UserId) -> Result<SummaryRecord> {
        Ok(self
            .get(user)?
            .unwrap_or_else(|| SummaryRecord::empty(user.clone(), Utc::now())))
    }

    /// Adds a finished day to the lifetime totals and counts it as a tracked day.
    pub fn commit_day(
        &self,
        user: &UserId,
        totals: DayTotals,
        date: NaiveDate,
    ) -> Result<CommitOutcome> {
        let _writing = self.writes.lock().map_err(StoreError::from)?;
        let mut summary = self.load_or_empty(user)?;

        if self.config.commit_policy == CommitPolicy::Idempotent
            && !summary.committed_dates.insert(date)
        {
            info!(user = %user, date = %date, "Day already committed, ignoring");
            return Ok(CommitOutcome::AlreadyCommitted(summary));
        }

        summary.total_days += 1;
        summary.total_steps = summary.total_steps.saturating_add(totals.steps);
        summary.total_distance_km += totals.distance_km;
        summary.total_calories = summary.total_calories.saturating_add(totals.calories);
        summary.total_active_minutes = summary
            .total_active_minutes
            .saturating_add(totals.active_minutes);
        summary.first_tracking_date = Some(match summary.first_tracking_date {
            Some(first) => first.min(date),
            None => date,
        });
        summary.last_updated = Utc::now();

        put_json(self.store.as_ref(), &keys::summary(user), &summary)?;
        debug!(
            user = %user,
            date = %date,
            total_days = summary.total_days,
            total_steps = summary.total_steps,
            "Committed day"
        );
        Ok(CommitOutcome::Committed(summary))
    }

    /// Commits a finalized daily record.
    pub fn commit_record(&self, record: &DailyRecord) -> Result<CommitOutcome> {
        self.commit_day(&record.user_id, DayTotals::from(record), record.date)
    }

    /// Adjusts the running totals without counting a day.
    ///
    /// Totals saturate at zero.
    pub fn increment_today(&self, user: &UserId, delta: TotalsDelta) -> Result<SummaryRecord> {
        let _writing = self.writes.lock().map_err(StoreError::from)?;
        let mut summary = self.load_or_empty(user)?;

        summary.total_steps = add_signed(summary.total_steps, delta.steps);
        summary.total_distance_km = (summary.total_distance_km + delta.distance_km).max(0.0);
        summary.total_calories = add_signed(summary.total_calories, delta.calories);
        summary.total_active_minutes =
            add_signed(summary.total_active_minutes, delta.active_minutes);
        summary.last_updated = Utc::now();

        put_json(self.store.as_ref(), &keys::summary(user), &summary)?;
        Ok(summary)
    }
}
