//! Routing attribution requests to per-pair workers.
//!
//! The dispatcher spawns one worker task per (user, race) pair, lazily on the
//! first request for the pair. Requests for different pairs run concurrently;
//! requests for the same pair are serialized by that pair's worker.
//!
//! ```text
//!                           ┌── pair (r1, alice) queue ──► worker ─┐
//! submit ──► dispatch ──────┤                                      ├──► ledger
//!     ▲      by pair        └── pair (r1, bob)   queue ──► worker ─┘
//!     │
//!     └── Completed(outcome) | Unknown { transaction_id } after the timeout
//! ```
//!
//! # Timeouts
//!
//! `submit` waits at most the given timeout. On expiry the outcome is
//! *unknown*: the worker may still record it. Callers must re-read the entry
//! with [`TransactionLedger::get`] before resubmitting, though a resubmission
//! of the same event is harmless: it collides on the transaction id, and if
//! the entry is still open the pair's worker resumes it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::ledger::{LedgerError, TransactionLedger};
use crate::types::TransactionId;
use crate::validation::IntegrityValidator;

use super::message::WorkerMessage;
use super::worker::{
    AttributionOutcome, AttributionPlan, AttributionRequest, PairKey, PairWorker, ProgressSink,
};

/// Default buffer of each worker's channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 100;

/// Default time `submit` waits for an outcome.
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from routing a request to its worker.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("failed to send message to worker: channel closed")]
    ChannelClosed,

    #[error("worker for {0} stopped before replying")]
    WorkerGone(PairKey),

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// Tunables for [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Requests buffered per worker before `submit` waits for room.
    pub channel_capacity: usize,

    /// How long [`Dispatcher::submit`] waits for an outcome.
    pub submit_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
        }
    }
}

/// Result of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Completed(AttributionOutcome),
    /// No reply within the timeout. Re-read this entry before deciding to retry.
    Unknown { transaction_id: TransactionId },
}

/// Handle to a running worker task.
struct WorkerHandle {
    /// Channel for sending requests to the worker.
    tx: mpsc::Sender<WorkerMessage>,

    /// The spawned task. Kept so the task is owned by the dispatcher.
    #[allow(dead_code)]
    task: JoinHandle<()>,

    /// Cancels only this worker; a child of the dispatcher's token.
    cancel: CancellationToken,
}

/// Routes attribution requests to per-pair workers.
///
/// Workers are spawned on a pair's first request and live until
/// [`remove_worker`](Self::remove_worker) or [`shutdown_all`](Self::shutdown_all).
pub struct Dispatcher<S> {
    /// Shared by every worker.
    ledger: TransactionLedger,

    validator: IntegrityValidator,

    /// Where workers publish new race totals.
    sink: Arc<S>,

    config: WorkerConfig,

    /// Active workers, keyed by pair.
    workers: RwLock<HashMap<PairKey, WorkerHandle>>,

    /// Parent of every worker's cancellation token.
    shutdown: CancellationToken,
}

impl<S: ProgressSink> Dispatcher<S> {
    /// Creates a dispatcher with no workers running.
    pub fn new(
        ledger: TransactionLedger,
        validator: IntegrityValidator,
        sink: Arc<S>,
        config: WorkerConfig,
    ) -> Self {
        info!(
            channel_capacity = config.channel_capacity,
            submit_timeout_ms = config.submit_timeout.as_millis() as u64,
            "Creating dispatcher"
        );
        Dispatcher {
            ledger,
            validator,
            sink,
            config,
            workers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// The ledger the workers write to.
    pub fn ledger(&self) -> &TransactionLedger {
        &self.ledger
    }

    /// Token cancelled by [`shutdown_all`](Self::shutdown_all), for callers
    /// that tie their own tasks to the dispatcher's lifetime.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Submits with the configured default timeout.
    pub async fn submit(&self, request: AttributionRequest) -> Result<SubmitOutcome> {
        self.submit_with_timeout(request, self.config.submit_timeout)
            .await
    }

    /// Routes a request to its pair's worker and waits up to `timeout` for the outcome.
    #[instrument(skip(self, request), fields(pair = %request.key()))]
    pub async fn submit_with_timeout(
        &self,
        request: AttributionRequest,
        timeout: Duration,
    ) -> Result<SubmitOutcome> {
        if self.shutdown.is_cancelled() {
            return Err(DispatchError::ShuttingDown);
        }

        let key = request.key();
        let transaction_id = AttributionPlan::for_request(&self.validator, &request)
            .transaction_id(&request, &self.ledger);
        let tx = self.get_or_spawn_worker(&key).await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        let exchange = async {
            tx.send(WorkerMessage::Attribute {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DispatchError::ChannelClosed)?;
            let outcome = reply_rx
                .await
                .map_err(|_| DispatchError::WorkerGone(key.clone()))?;
            Ok::<_, DispatchError>(outcome?)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => Ok(SubmitOutcome::Completed(outcome?)),
            Err(_) => {
                warn!(
                    transaction_id = %transaction_id.short(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Submission timed out, outcome unknown"
                );
                Ok(SubmitOutcome::Unknown { transaction_id })
            }
        }
    }

    /// Returns the sender for `key`'s worker, spawning the worker if needed.
    async fn get_or_spawn_worker(&self, key: &PairKey) -> Result<mpsc::Sender<WorkerMessage>> {
        {
            let workers = self.workers.read().await;
            if let Some(handle) = workers.get(key) {
                return Ok(handle.tx.clone());
            }
        }

        let mut workers = self.workers.write().await;

        // Another submitter may have spawned it while we waited for the write lock.
        if let Some(handle) = workers.get(key) {
            return Ok(handle.tx.clone());
        }

        debug!(pair = %key, "Spawning new worker task");
        let worker = PairWorker::new(
            key.clone(),
            self.ledger.clone(),
            self.validator,
            Arc::clone(&self.sink),
        );

        // The handle keeps the same token the task watches, so remove_worker
        // cancels the right one.
        let (tx, rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(worker.run(rx, cancel.clone()));

        workers.insert(
            key.clone(),
            WorkerHandle {
                tx: tx.clone(),
                task,
                cancel,
            },
        );
        Ok(tx)
    }

    /// Number of running workers.
    pub async fn worker_count(&self) -> usize {
        self.workers.read().await.len()
    }

    /// Whether `key` has a running worker.
    pub async fn has_worker(&self, key: &PairKey) -> bool {
        self.workers.read().await.contains_key(key)
    }

    /// Stops and forgets one pair's worker. The next request respawns it.
    pub async fn remove_worker(&self, key: &PairKey) -> bool {
        let mut workers = self.workers.write().await;
        if let Some(handle) = workers.remove(key) {
            handle.cancel.cancel();
            let _ = handle.tx.send(WorkerMessage::Shutdown).await;
            true
        } else {
            false
        }
    }

    /// Signals every worker to stop. Later submissions fail with `ShuttingDown`.
    pub async fn shutdown_all(&self) {
        info!("Shutting down all workers");
        self.shutdown.cancel();

        let workers = self.workers.read().await;
        for (key, handle) in workers.iter() {
            trace!(pair = %key, "Sending shutdown to worker");
            let _ = handle.tx.try_send(WorkerMessage::Shutdown);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{BackoffPolicy, LedgerConfig};
    use crate::persistence::MemoryStore;
    use crate::types::{MAX_RETRIES, RaceId, Source, TransactionStatus, UserId};
    use crate::validation::ValidatorConfig;
    use crate::worker::worker::{NullSink, ProgressUpdate, SinkError};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Records every update; fails the first `failures` publishes.
    #[derive(Default)]
    struct RecordingSink {
        failures: AtomicU32,
        published: Mutex<Vec<ProgressUpdate>>,
    }

    impl RecordingSink {
        fn failing(times: u32) -> Self {
            RecordingSink {
                failures: AtomicU32::new(times),
                published: Mutex::new(Vec::new()),
            }
        }

        fn published(&self) -> Vec<ProgressUpdate> {
            self.published.lock().unwrap().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        async fn publish(&self, update: &ProgressUpdate) -> std::result::Result<(), SinkError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(SinkError("scoring service unavailable".to_string()));
            }
            self.published.lock().unwrap().push(update.clone());
            Ok(())
        }
    }

    /// Never finishes publishing.
    struct StalledSink;

    impl ProgressSink for StalledSink {
        async fn publish(&self, _update: &ProgressUpdate) -> std::result::Result<(), SinkError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn dispatcher<S: ProgressSink>(sink: Arc<S>) -> Dispatcher<S> {
        let ledger = TransactionLedger::new(
            Arc::new(MemoryStore::new()),
            LedgerConfig {
                backoff: BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
                ..LedgerConfig::default()
            },
        );
        Dispatcher::new(
            ledger,
            IntegrityValidator::new(ValidatorConfig::default()),
            sink,
            WorkerConfig::default(),
        )
    }

    fn request(user: &str, previous: u64, new: u64, minute: i64) -> AttributionRequest {
        AttributionRequest {
            user_id: UserId::new(user).unwrap(),
            race_id: RaceId::new("city-marathon").unwrap(),
            source: Source::Pedometer,
            previous_steps: previous,
            new_steps: new,
            elapsed: chrono::Duration::minutes(10),
            occurred_at: Utc::now() + chrono::Duration::minutes(minute),
            baseline_total: 0,
            distance: None,
            speed: None,
            metadata: BTreeMap::new(),
        }
    }

    fn completed(outcome: SubmitOutcome) -> AttributionOutcome {
        match outcome {
            SubmitOutcome::Completed(o) => o,
            SubmitOutcome::Unknown { transaction_id } => {
                panic!("unexpected timeout for {transaction_id}")
            }
        }
    }

    #[tokio::test]
    async fn serializes_requests_per_pair() {
        let d = Arc::new(dispatcher(Arc::new(NullSink)));
        let handles: Vec<_> = (0..10u64)
            .map(|i| {
                let d = Arc::clone(&d);
                tokio::spawn(async move {
                    d.submit(request("alice", i * 100, i * 100 + 100, i as i64))
                        .await
                })
            })
            .collect();
        for handle in handles {
            let outcome = completed(handle.await.unwrap().unwrap());
            assert!(matches!(outcome, AttributionOutcome::Applied(_)));
        }

        let user = UserId::new("alice").unwrap();
        let race = RaceId::new("city-marathon").unwrap();
        let report = d.ledger().audit(&user, &race).unwrap();
        assert_eq!(report.applied, 10);
        assert_eq!(report.replayed_total, Some(1000));
        assert!(report.is_consistent());
        assert_eq!(report.first_divergence, None);
        assert_eq!(d.worker_count().await, 1);
    }

    #[tokio::test]
    async fn pairs_get_separate_workers() {
        let d = dispatcher(Arc::new(NullSink));
        d.submit(request("alice", 0, 100, 0)).await.unwrap();
        d.submit(request("bob", 0, 100, 0)).await.unwrap();
        assert_eq!(d.worker_count().await, 2);
        assert!(d.has_worker(&request("bob", 0, 0, 0).key()).await);
    }

    #[tokio::test]
    async fn duplicate_submission_yields_one_row() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::clone(&sink));
        let req = request("alice", 0, 250, 0);

        let first = completed(d.submit(req.clone()).await.unwrap());
        let second = completed(d.submit(req.clone()).await.unwrap());
        let third = completed(d.submit(req).await.unwrap());

        assert!(matches!(first, AttributionOutcome::Applied(_)));
        assert!(matches!(second, AttributionOutcome::Duplicate(ref e) if e.status == TransactionStatus::Applied));
        assert!(matches!(third, AttributionOutcome::Duplicate(_)));
        assert_eq!(sink.published().len(), 1);

        let user = UserId::new("alice").unwrap();
        let race = RaceId::new("city-marathon").unwrap();
        assert_eq!(d.ledger().entries_for(&user, &race).unwrap().len(), 1);
        assert_eq!(d.ledger().applied_total(&user, &race).unwrap(), Some(250));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_sink_failure_is_retried() {
        let sink = Arc::new(RecordingSink::failing(2));
        let d = dispatcher(Arc::clone(&sink));
        let outcome = completed(d.submit(request("alice", 0, 400, 0)).await.unwrap());

        let AttributionOutcome::Applied(entry) = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(entry.retry_count, 2);
        assert_eq!(entry.server_steps_after, Some(400));
        assert_eq!(sink.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_sink_failure_exhausts_retries() {
        let sink = Arc::new(RecordingSink::failing(u32::MAX));
        let d = dispatcher(Arc::clone(&sink));
        let outcome = completed(d.submit(request("alice", 0, 400, 0)).await.unwrap());

        let AttributionOutcome::Exhausted(entry) = outcome else {
            panic!("expected exhausted, got {outcome:?}");
        };
        assert_eq!(entry.status, TransactionStatus::Failed);
        assert_eq!(entry.retry_count, MAX_RETRIES);
        assert!(entry.is_finalized());

        let user = UserId::new("alice").unwrap();
        let race = RaceId::new("city-marathon").unwrap();
        let exhausted = d.ledger().exhausted_for(&user, &race).unwrap();
        assert_eq!(exhausted, vec![entry]);
        assert_eq!(d.ledger().applied_total(&user, &race).unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_reading_is_rolled_back() {
        let sink = Arc::new(RecordingSink::default());
        let d = dispatcher(Arc::clone(&sink));
        let mut req = request("alice", 0, 15_000, 0);
        req.elapsed = chrono::Duration::minutes(5);

        let outcome = completed(d.submit(req).await.unwrap());
        let AttributionOutcome::RolledBack(entry) = outcome else {
            panic!("expected rollback, got {outcome:?}");
        };
        assert_eq!(entry.status, TransactionStatus::RolledBack);
        assert!(entry.error_message.is_some());
        assert!(sink.published().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_reports_unknown_with_transaction_id() {
        let d = dispatcher(Arc::new(StalledSink));
        let outcome = d
            .submit_with_timeout(request("alice", 0, 100, 0), Duration::from_millis(50))
            .await
            .unwrap();

        let SubmitOutcome::Unknown { transaction_id } = outcome else {
            panic!("expected unknown, got {outcome:?}");
        };
        let entry = d.ledger().get(&transaction_id).unwrap().unwrap();
        assert_eq!(entry.status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn equal_deltas_within_one_bucket_both_apply() {
        let d = dispatcher(Arc::new(NullSink));
        let mut first = request("alice", 0, 100, 0);
        first.occurred_at = chrono::DateTime::from_timestamp(1_714_550_410, 0).unwrap();
        let mut second = request("alice", 100, 200, 0);
        second.occurred_at = first.occurred_at + chrono::Duration::seconds(30);

        let a = completed(d.submit(first).await.unwrap());
        let b = completed(d.submit(second).await.unwrap());
        assert!(matches!(a, AttributionOutcome::Applied(_)));
        assert!(matches!(b, AttributionOutcome::Applied(_)));

        let user = UserId::new("alice").unwrap();
        let race = RaceId::new("city-marathon").unwrap();
        assert_eq!(d.ledger().applied_total(&user, &race).unwrap(), Some(200));
    }

    #[tokio::test(start_paused = true)]
    async fn resubmission_after_shutdown_resumes_failed_entry() {
        let d = dispatcher(Arc::new(RecordingSink::failing(u32::MAX)));
        let req = request("alice", 0, 300, 0);
        let outcome = d
            .submit_with_timeout(req.clone(), Duration::from_millis(50))
            .await
            .unwrap();
        let SubmitOutcome::Unknown { transaction_id } = outcome else {
            panic!("expected unknown, got {outcome:?}");
        };
        d.shutdown_all().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let stranded = d.ledger().get(&transaction_id).unwrap().unwrap();
        assert_eq!(stranded.status, TransactionStatus::Failed);
        assert!(stranded.should_retry());

        let sink = Arc::new(RecordingSink::default());
        let restarted = Dispatcher::new(
            d.ledger().clone(),
            IntegrityValidator::new(ValidatorConfig::default()),
            Arc::clone(&sink),
            WorkerConfig::default(),
        );
        let outcome = completed(restarted.submit(req).await.unwrap());
        let AttributionOutcome::Applied(entry) = outcome else {
            panic!("expected applied, got {outcome:?}");
        };
        assert_eq!(entry.transaction_id, transaction_id);
        assert_eq!(sink.published().len(), 1);

        let user = UserId::new("alice").unwrap();
        let race = RaceId::new("city-marathon").unwrap();
        assert_eq!(restarted.ledger().applied_total(&user, &race).unwrap(), Some(300));
        assert!(restarted.ledger().audit(&user, &race).unwrap().is_consistent());
    }

    #[tokio::test]
    async fn submissions_after_shutdown_are_refused() {
        let d = dispatcher(Arc::new(NullSink));
        let token = d.shutdown_token();
        d.submit(request("alice", 0, 100, 0)).await.unwrap();
        d.shutdown_all().await;
        assert!(token.is_cancelled());
        assert!(matches!(
            d.submit(request("alice", 100, 200, 1)).await,
            Err(DispatchError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn removed_worker_respawns() {
        let d = dispatcher(Arc::new(NullSink));
        let key = request("alice", 0, 0, 0).key();
        d.submit(request("alice", 0, 100, 0)).await.unwrap();
        assert!(d.remove_worker(&key).await);
        assert!(!d.has_worker(&key).await);
        d.submit(request("alice", 100, 200, 1)).await.unwrap();
        assert!(d.has_worker(&key).await);
    }
}
