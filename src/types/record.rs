//! Per-day step records and their source tags.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::UserId;

/// Where a reading came from.
///
/// `Hybrid` is never reported by a sensor; it marks a record produced by merging
/// readings from more than one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    /// The phone's built-in step counter.
    Pedometer,
    /// The platform health store.
    Health,
    /// A manual correction.
    Manual,
    /// Merged from several sources.
    Hybrid,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Pedometer => "pedometer",
            Source::Health => "health",
            Source::Manual => "manual",
            Source::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record that violates a field constraint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecordError {
    #[error("distance must be a finite non-negative number, got {0}")]
    InvalidDistance(f64),

    #[error("hourly breakdown has hour {0}, expected 0..=23")]
    InvalidHour(u8),
}

/// One record per (user, UTC calendar date).
///
/// Mutated throughout the day by merging readings, frozen once the day is
/// finalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord {
    pub user_id: UserId,
    pub date: NaiveDate,
    pub steps: u64,
    pub distance_km: f64,
    pub calories: u32,
    pub active_minutes: u32,
    pub source: Source,

    /// Sparse hour (0..=23) to steps breakdown.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hourly: BTreeMap<u8, u64>,

    pub is_synced: bool,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub synced_at: Option<DateTime<Utc>>,

    /// Set once the day has rolled over; a final record rejects further upserts.
    #[serde(default)]
    pub is_final: bool,
}

impl DailyRecord {
    /// Creates an empty, unsynced record for the given user and date.
    pub fn new(user_id: UserId, date: NaiveDate, source: Source, created_at: DateTime<Utc>) -> Self {
        DailyRecord {
            user_id,
            date,
            steps: 0,
            distance_km: 0.0,
            calories: 0,
            active_minutes: 0,
            source,
            hourly: BTreeMap::new(),
            is_synced: false,
            created_at,
            synced_at: None,
            is_final: false,
        }
    }

    /// The calendar date a UTC timestamp belongs to.
    pub fn date_for(timestamp: DateTime<Utc>) -> NaiveDate {
        timestamp.date_naive()
    }

    /// Average speed over the active minutes, in km/h.
    ///
    /// Returns `None` when there are no active minutes.
    pub fn average_speed_kmh(&self) -> Option<f64> {
        if self.active_minutes == 0 {
            return None;
        }
        Some(self.distance_km / (self.active_minutes as f64 / 60.0))
    }

    /// Checks the field constraints that the type system cannot express.
    pub fn validate(&self) -> Result<(), RecordError> {
        if !self.distance_km.is_finite() || self.distance_km < 0.0 {
            return Err(RecordError::InvalidDistance(self.distance_km));
        }
        if let Some(&hour) = self.hourly.keys().find(|&&h| h > 23) {
            return Err(RecordError::InvalidHour(hour));
        }
        Ok(())
    }
}
