//! Validation outcome values.
//!
//! Validation never fails with an error type: implausible data is reported as a
//! [`ValidationResult`] with [`Severity::Error`], and the caller decides whether
//! to reject, clamp, or flag it.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Ok,
    /// Advisory only; never blocks an apply.
    Warning,
    /// Blocks a ledger apply.
    Error,
}

/// What the caller may do about a non-ok result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Remediation {
    /// The counter restarted; count the new reading from zero.
    TreatAsReset,
    /// Accept at most this many steps.
    ClampTo(u64),
    /// Discard the reading.
    Reject,
    /// Keep the reading but queue it for manual review.
    FlagForReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub severity: Severity,
    pub message: String,
    pub remediation: Option<Remediation>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        ValidationResult {
            severity: Severity::Ok,
            message: String::new(),
            remediation: None,
        }
    }

    pub fn warning(message: impl Into<String>, remediation: Option<Remediation>) -> Self {
        ValidationResult {
            severity: Severity::Warning,
            message: message.into(),
            remediation,
        }
    }

    pub fn error(message: impl Into<String>, remediation: Option<Remediation>) -> Self {
        ValidationResult {
            severity: Severity::Error,
            message: message.into(),
            remediation,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }

    pub fn is_warning(&self) -> bool {
        self.severity == Severity::Warning
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.severity {
            Severity::Ok => write!(f, "ok"),
            Severity::Warning => write!(f, "warning: {}", self.message),
            Severity::Error => write!(f, "error: {}", self.message),
        }
    }
}

/// The non-ok subset of a batch of checks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    /// Builds a report, dropping ok results.
    pub fn from_results(results: impl IntoIterator<Item = ValidationResult>) -> Self {
        ValidationReport {
            results: results.into_iter().filter(|r| !r.is_ok()).collect(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.results.is_empty()
    }

    pub fn has_errors(&self) -> bool {
        self.results.iter().any(ValidationResult::is_error)
    }

    pub fn has_warnings(&self) -> bool {
        self.results.iter().any(ValidationResult::is_warning)
    }

    pub fn error_messages(&self) -> Vec<String> {
        self.messages(Severity::Error)
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.messages(Severity::Warning)
    }

    /// Remediations suggested by results of the given severity.
    pub fn remediations(&self, severity: Severity) -> impl Iterator<Item = Remediation> + '_ {
        self.results
            .iter()
            .filter(move |r| r.severity == severity)
            .filter_map(|r| r.remediation)
    }

    fn messages(&self, severity: Severity) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.severity == severity)
            .map(|r| r.message.clone())
            .collect()
    }
}
