//! Plausibility validation for incoming deltas.
//!
//! Rejects sensor glitches, clock skew, and obvious spoofing with configurable
//! thresholds. Errors block a ledger apply; warnings are advisory only.

pub mod integrity;
pub mod result;

pub use integrity::{
    DistanceCheck, IntegrityValidator, SpeedCheck, ValidationInput, ValidatorConfig,
};
pub use result::{Remediation, Severity, ValidationReport, ValidationResult};
