//! Stepsync - step-count synchronization and race-attribution ledger.
//!
//! Ingests daily step readings from several sources, reconciles them into one
//! record per user and day, rolls finished days into lifetime summaries, and
//! attributes step deltas to races through an auditable, idempotent ledger.
//! Geohash utilities support proximity queries for race discovery.
//!
//! This is a library: the synchronization service embedding it owns any wire
//! protocol, authentication and scheduling.

pub mod config;
pub mod daily;
pub mod geo;
pub mod ledger;
pub mod persistence;
pub mod summary;
pub mod telemetry;
pub mod types;
pub mod validation;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use config::Config;
