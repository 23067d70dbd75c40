//! Runtime configuration.
//!
//! Every knob has a default, and [`Config::from_env`] overrides them from
//! `STEPSYNC_*` environment variables. A variable that is unset or does not
//! parse leaves the default in place.
//!
//! | Variable | Default |
//! |---|---|
//! | `STEPSYNC_MAX_STEPS_PER_SYNC` | 10000 |
//! | `STEPSYNC_MAX_STEPS_PER_MINUTE` | 200 |
//! | `STEPSYNC_DISTANCE_TOLERANCE` | 1.1 |
//! | `STEPSYNC_MAX_SPEED_KMH` | 20 |
//! | `STEPSYNC_ID_BUCKET_SECS` | 60 |
//! | `STEPSYNC_BACKOFF_INITIAL_MS` | 500 |
//! | `STEPSYNC_BACKOFF_MAX_MS` | 8000 |
//! | `STEPSYNC_COMMIT_POLICY` | `trusting` |
//! | `STEPSYNC_SUBMIT_TIMEOUT_MS` | 5000 |

use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::ledger::LedgerConfig;
use crate::summary::SummaryConfig;
use crate::validation::ValidatorConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Config {
    pub validator: ValidatorConfig,
    pub ledger: LedgerConfig,
    pub summary: SummaryConfig,
    pub worker: WorkerConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds a config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();

        if let Some(v) = parse(&lookup, "STEPSYNC_MAX_STEPS_PER_SYNC") {
            config.validator.max_steps_per_sync = v;
        }
        if let Some(v) = parse_positive(&lookup, "STEPSYNC_MAX_STEPS_PER_MINUTE") {
            config.validator.max_steps_per_minute = v;
        }
        if let Some(v) = parse_positive(&lookup, "STEPSYNC_DISTANCE_TOLERANCE") {
            config.validator.distance_tolerance = v;
        }
        if let Some(v) = parse_positive(&lookup, "STEPSYNC_MAX_SPEED_KMH") {
            config.validator.max_speed_kmh = v;
        }
        if let Some(secs) = parse::<i64>(&lookup, "STEPSYNC_ID_BUCKET_SECS").filter(|s| *s > 0) {
            config.ledger.id_bucket = chrono::Duration::seconds(secs);
        }
        if let Some(ms) = parse::<u64>(&lookup, "STEPSYNC_BACKOFF_INITIAL_MS") {
            config.ledger.backoff.initial_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = parse::<u64>(&lookup, "STEPSYNC_BACKOFF_MAX_MS") {
            config.ledger.backoff.max_delay = Duration::from_millis(ms);
        }
        if let Some(policy) = parse(&lookup, "STEPSYNC_COMMIT_POLICY") {
            config.summary.commit_policy = policy;
        }
        if let Some(ms) = parse::<u64>(&lookup, "STEPSYNC_SUBMIT_TIMEOUT_MS").filter(|ms| *ms > 0)
        {
            config.worker.submit_timeout = Duration::from_millis(ms);
        }

        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(variable = name, value = %raw, "Ignoring unparseable setting");
            None
        }
    }
}

fn parse_positive(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<f64> {
    parse::<f64>(lookup, name).filter(|v| v.is_finite() && *v > 0.0)
}
