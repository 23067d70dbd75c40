//! Per-(user, race) attribution worker.
//!
//! A worker owns the ordering point for one pair: every ledger transition for
//! the pair happens on its task, one request at a time. For each request it
//! validates the reading, records a ledger entry, publishes the new total to
//! the [`ProgressSink`], and settles the entry:
//!
//! ```text
//! settle open entries ─► validate ─► create ─┬─ duplicate ─────────────────────────► Duplicate
//!                                             ├─ validation errors ─► rollback ─────► RolledBack
//!                                             └─ publish ─┬─ ok ─► apply ───────────► Applied
//!                                                         └─ err ─► fail ─┬─ retries left: backoff, retry, publish again
//!                                                                         └─ exhausted ─► Exhausted
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::ledger::{LedgerError, NewTransaction, TransactionLedger, event_id};
use crate::types::{LedgerEntry, RaceId, Source, TransactionId, UserId};
use crate::validation::{
    DistanceCheck, IntegrityValidator, Remediation, Severity, SpeedCheck, ValidationInput,
    ValidationReport,
};

use super::message::WorkerMessage;

/// The ordering key: all requests for one pair go through one worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PairKey {
    pub user_id: UserId,
    pub race_id: RaceId,
}

impl PairKey {
    pub fn new(user_id: UserId, race_id: RaceId) -> Self {
        PairKey { user_id, race_id }
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.race_id, self.user_id)
    }
}

/// A step-counter reading to attribute to a race.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionRequest {
    pub user_id: UserId,
    pub race_id: RaceId,
    pub source: Source,
    /// Counter value at the previous sync.
    pub previous_steps: u64,
    /// Counter value now.
    pub new_steps: u64,
    /// Time since the previous sync.
    pub elapsed: Duration,
    /// When the reading was taken.
    pub occurred_at: DateTime<Utc>,
    /// Server-side race total to start from when the pair has no history.
    pub baseline_total: i64,
    pub distance: Option<DistanceCheck>,
    pub speed: Option<SpeedCheck>,
    pub metadata: BTreeMap<String, String>,
}

impl AttributionRequest {
    /// The pair this reading is attributed to.
    pub fn key(&self) -> PairKey {
        PairKey::new(self.user_id.clone(), self.race_id.clone())
    }
}

/// What a request resolved to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributionOutcome {
    Applied(LedgerEntry),
    /// Validation errors withdrew the entry.
    RolledBack(LedgerEntry),
    /// Retries ran out; the entry is finalized as failed and awaits reconciliation.
    Exhausted(LedgerEntry),
    /// The event was already recorded and settled; the stored entry is returned as-is.
    Duplicate(LedgerEntry),
    /// Shutdown interrupted a backoff. The entry is failed with retries left
    /// and the pair's next request resumes it. If it belongs to an earlier
    /// reading, the current reading was not recorded and must be resubmitted.
    Deferred(LedgerEntry),
}

impl AttributionOutcome {
    /// The ledger entry the request resolved to.
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            AttributionOutcome::Applied(e)
            | AttributionOutcome::RolledBack(e)
            | AttributionOutcome::Exhausted(e)
            | AttributionOutcome::Duplicate(e)
            | AttributionOutcome::Deferred(e) => e,
        }
    }
}

/// The new race total for a pair, as handed to the race-scoring collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub user_id: UserId,
    pub race_id: RaceId,
    pub transaction_id: TransactionId,
    pub steps_delta: i64,
    pub total: i64,
}

/// A publish the sink could not complete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("progress sink rejected update: {0}")]
pub struct SinkError(pub String);

/// Receives race totals once an entry is ready to apply.
///
/// A publish failure fails the ledger entry, which is retried with backoff.
pub trait ProgressSink: Send + Sync + 'static {
    fn publish(
        &self,
        update: &ProgressUpdate,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// A sink that accepts every update.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    async fn publish(&self, _update: &ProgressUpdate) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Validation verdict and the delta it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributionPlan {
    pub report: ValidationReport,
    pub steps_delta: i64,
}

impl AttributionPlan {
    /// Validates a request and derives the delta to attribute.
    ///
    /// A counter that went backwards with the reset warning restarted from
    /// zero, so the whole new reading counts.
    pub fn for_request(validator: &IntegrityValidator, request: &AttributionRequest) -> Self {
        let report = validator.validate_all(&ValidationInput {
            previous_steps: request.previous_steps,
            new_steps: request.new_steps,
            elapsed: request.elapsed,
            distance: request.distance,
            speed: request.speed,
        });

        let was_reset = request.new_steps < request.previous_steps
            && report
                .remediations(Severity::Warning)
                .any(|r| r == Remediation::TreatAsReset);

        let steps_delta = if was_reset {
            to_i64(request.new_steps)
        } else {
            to_i64(request.new_steps) - to_i64(request.previous_steps)
        };

        AttributionPlan {
            report,
            steps_delta,
        }
    }

    /// The ledger id this plan records under.
    pub fn transaction_id(
        &self,
        request: &AttributionRequest,
        ledger: &TransactionLedger,
    ) -> TransactionId {
        event_id(
            &request.user_id,
            &request.race_id,
            request.source,
            request.previous_steps,
            request.new_steps,
            request.occurred_at,
            ledger.config().id_bucket,
        )
    }
}

fn to_i64(steps: u64) -> i64 {
    i64::try_from(steps).unwrap_or(i64::MAX)
}

/// Serial attribution for one (user, race) pair.
pub struct PairWorker<S> {
    key: PairKey,
    ledger: TransactionLedger,
    validator: IntegrityValidator,
    sink: Arc<S>,
}

impl<S: ProgressSink> PairWorker<S> {
    /// Creates the worker for `key`. It does nothing until [`run`](Self::run).
    pub fn new(
        key: PairKey,
        ledger: TransactionLedger,
        validator: IntegrityValidator,
        sink: Arc<S>,
    ) -> Self {
        PairWorker {
            key,
            ledger,
            validator,
            sink,
        }
    }

    /// The pair this worker serializes.
    pub fn key(&self) -> &PairKey {
        &self.key
    }

    /// Runs the event loop until shutdown.
    #[instrument(skip_all, fields(pair = %self.key))]
    pub async fn run(self, mut rx: mpsc::Receiver<WorkerMessage>, shutdown: CancellationToken) {
        info!("Worker event loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping worker");
                    break;
                }

                msg = rx.recv() => {
                    match msg {
                        Some(WorkerMessage::Attribute { request, reply }) => {
                            let outcome = self.attribute(request, &shutdown).await;
                            if reply.send(outcome).is_err() {
                                debug!("Submitter stopped waiting; outcome is in the ledger");
                            }
                        }
                        Some(WorkerMessage::Shutdown) => {
                            info!("Shutdown message received");
                            break;
                        }
                        None => {
                            info!("Channel closed, stopping worker");
                            break;
                        }
                    }
                }
            }
        }

        info!("Worker event loop stopped");
    }

    /// Attributes one reading.
    ///
    /// Entries the pair left open (a crash, a caller timeout, a shutdown during
    /// backoff) are settled first, oldest first. A redelivered reading whose
    /// entry is still open resumes that entry instead of reporting a duplicate.
    #[instrument(skip_all, fields(source = %request.source, new_steps = request.new_steps))]
    pub async fn attribute(
        &self,
        request: AttributionRequest,
        shutdown: &CancellationToken,
    ) -> Result<AttributionOutcome, LedgerError> {
        let plan = AttributionPlan::for_request(&self.validator, &request);
        for warning in plan.report.warning_messages() {
            warn!(warning = %warning, "Validator warning on reading");
        }

        let user = &self.key.user_id;
        let race = &self.key.race_id;
        let id = plan.transaction_id(&request, &self.ledger);

        for open in self.ledger.open_entries(user, race)? {
            let own = open.transaction_id == id;
            info!(
                transaction_id = %open.transaction_id.short(),
                status = %open.status,
                retry_count = open.retry_count,
                redelivered = own,
                "Resuming open ledger entry"
            );
            let outcome = if own {
                self.settle(open, &plan.report, shutdown).await?
            } else {
                self.settle(open, &ValidationReport::default(), shutdown)
                    .await?
            };
            if own || matches!(outcome, AttributionOutcome::Deferred(_)) {
                return Ok(outcome);
            }
        }

        let before = self
            .ledger
            .applied_total(user, race)?
            .unwrap_or(request.baseline_total);

        let created = self.ledger.create(NewTransaction {
            user_id: request.user_id,
            race_id: request.race_id,
            source: request.source,
            previous_steps: request.previous_steps,
            new_steps: request.new_steps,
            steps_delta: plan.steps_delta,
            server_steps_before: before,
            occurred_at: request.occurred_at,
            metadata: request.metadata,
        })?;
        if created.is_duplicate() {
            return Ok(AttributionOutcome::Duplicate(created.into_entry()));
        }

        self.settle(created.into_entry(), &plan.report, shutdown)
            .await
    }

    /// Drives a pending or retryable entry to its outcome.
    async fn settle(
        &self,
        entry: LedgerEntry,
        report: &ValidationReport,
        shutdown: &CancellationToken,
    ) -> Result<AttributionOutcome, LedgerError> {
        let id = entry.transaction_id.clone();

        if report.has_errors() {
            let messages = report.error_messages();
            warn!(
                transaction_id = %id.short(),
                errors = ?messages,
                "Validation errors, withdrawing entry"
            );
            let rolled = self.ledger.rollback(&id, &messages.join("; "))?;
            return Ok(AttributionOutcome::RolledBack(rolled));
        }

        let entry = if entry.should_retry() {
            self.ledger.retry(&id)?
        } else {
            entry
        };

        // Pending entries are not in the race total yet.
        let published_before = self
            .ledger
            .race_total(&entry.user_id, &entry.race_id)?
            .unwrap_or(entry.server_steps_before);
        let update = ProgressUpdate {
            user_id: entry.user_id.clone(),
            race_id: entry.race_id.clone(),
            transaction_id: id.clone(),
            steps_delta: entry.steps_delta,
            total: published_before.saturating_add(entry.steps_delta),
        };
        let after = entry.server_steps_before.saturating_add(entry.steps_delta);
        let backoff = self.ledger.config().backoff;

        loop {
            match self.sink.publish(&update).await {
                Ok(()) => {
                    let applied = self.ledger.apply_validated(&id, after, report)?;
                    return Ok(AttributionOutcome::Applied(applied));
                }
                Err(e) => {
                    let failed = self.ledger.fail(&id, &e.to_string())?;
                    if !failed.should_retry() {
                        return Ok(AttributionOutcome::Exhausted(failed));
                    }

                    let delay = backoff.delay_with_jitter(failed.retry_count - 1, &id);
                    debug!(
                        transaction_id = %id.short(),
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            info!(transaction_id = %id.short(), "Shutdown during backoff, leaving entry failed");
                            return Ok(AttributionOutcome::Deferred(failed));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    self.ledger.retry(&id)?;
                }
            }
        }
    }
}
