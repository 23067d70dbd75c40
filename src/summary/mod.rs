//! Lifetime summary aggregation.

pub mod aggregator;

pub use aggregator::{
    CommitOutcome, CommitPolicy, DayTotals, SummaryAggregator, SummaryConfig, SummaryError,
    TotalsDelta,
};
