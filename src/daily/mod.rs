//! Daily record storage and multi-source merge.

pub mod merge;
pub mod store;

pub use merge::{MergeError, merge};
pub use store::{DailyRecordStore, DailyStoreError};
