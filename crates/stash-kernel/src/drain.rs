//! Transactional drain engine.
//!
//! A commit signal names a transaction queue. The engine empties that queue
//! with one watcher chain and a self-replicating set of workers: every claim,
//! by the watcher or a worker, spawns one more single-shot worker pull before
//! its own apply runs, so parallelism grows with the backlog and collapses to
//! zero once pulls come back empty. Only the watcher finalizes, and it does so
//! only after a full round observed the queue empty with nothing in flight.

use std::{sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::{
    broker::{Acknowledge, Broker, BrokerError, Delivery, QueueDeletion, COMMIT_KIND, QUEUE_HEADER},
    metrics::{WorkerEvent, WorkerMetrics},
    operation::{OperationError, PutObjectOperation, StagedOperation},
    store::{IndexStore, ObjectStore, PutObject, StoreError},
};

/// Requeue delay used when a failing store gives no hint.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct DrainConfig {
    pub default_retry_delay: Duration,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            default_retry_delay: DEFAULT_RETRY_DELAY,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DrainError {
    #[error("draining transaction queue '{queue}' failed: {source}")]
    Broker {
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("rejecting signal failed: {0}")]
    Reject(#[source] BrokerError),
}

/// A validated commit for one transaction queue.
#[derive(Debug)]
pub struct CommitSignal {
    queue: String,
    delivery: Delivery,
}

/// A top-level message that is not a usable commit.
#[derive(Debug)]
pub struct RejectedSignal {
    pub delivery: Delivery,
    pub reason: OperationError,
}

impl CommitSignal {
    pub fn from_delivery(delivery: Delivery) -> Result<Self, RejectedSignal> {
        let reason = match delivery.kind() {
            Some(COMMIT_KIND) => match delivery.header_str(QUEUE_HEADER) {
                Some(queue) if !queue.is_empty() => {
                    return Ok(Self {
                        queue: queue.to_string(),
                        delivery,
                    })
                }
                _ => OperationError::MissingHeader(QUEUE_HEADER),
            },
            Some(other) => OperationError::Unsupported(other.to_string()),
            None => OperationError::MissingKind,
        };
        Err(RejectedSignal { delivery, reason })
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }
}

/// How a single claimed operation was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// A store failed; the operation goes back to the queue after a delay.
    Requeued,
    /// Dropped without requeue: unparseable, or refused for good by a store.
    Rejected,
    /// Stores were written but the broker refused the ack; it will redeliver.
    Unsettled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    pub queue: String,
    pub applied: u64,
    pub requeued: u64,
    pub rejected: u64,
    pub unsettled: u64,
    pub rounds: u32,
    pub deletion: QueueDeletion,
}

#[derive(Debug, Default)]
struct Tally {
    applied: u64,
    requeued: u64,
    rejected: u64,
    unsettled: u64,
}

impl Tally {
    fn record(&mut self, outcome: ApplyOutcome) {
        match outcome {
            ApplyOutcome::Applied => self.applied += 1,
            ApplyOutcome::Requeued => self.requeued += 1,
            ApplyOutcome::Rejected => self.rejected += 1,
            ApplyOutcome::Unsettled => self.unsettled += 1,
        }
    }
}

/// Result of routing one top-level signal.
#[derive(Debug)]
pub enum SignalOutcome {
    Drained(DrainReport),
    Rejected(OperationError),
}

/// Held by every task that can still change the queue during a round; the
/// round is settled once all clones are dropped. Workers report their pull
/// failures through it as well.
type RoundTracker = mpsc::UnboundedSender<Result<ApplyOutcome, BrokerError>>;

pub struct DrainEngine<B, O, I>
where
    B: Broker,
    O: ObjectStore,
    I: IndexStore,
{
    broker: Arc<B>,
    objects: Arc<O>,
    index: Arc<I>,
    config: DrainConfig,
    metrics: Arc<WorkerMetrics>,
}

impl<B, O, I> Clone for DrainEngine<B, O, I>
where
    B: Broker,
    O: ObjectStore,
    I: IndexStore,
{
    fn clone(&self) -> Self {
        Self {
            broker: self.broker.clone(),
            objects: self.objects.clone(),
            index: self.index.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<B, O, I> DrainEngine<B, O, I>
where
    B: Broker,
    O: ObjectStore,
    I: IndexStore,
{
    pub fn new(
        broker: Arc<B>,
        objects: Arc<O>,
        index: Arc<I>,
        config: DrainConfig,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        Self {
            broker,
            objects,
            index,
            config,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<WorkerMetrics> {
        &self.metrics
    }

    /// Routes a message from the commit queue: commits are drained, anything
    /// else is rejected without requeue.
    pub async fn handle_signal(&self, delivery: Delivery) -> Result<SignalOutcome, DrainError> {
        match CommitSignal::from_delivery(delivery) {
            Ok(commit) => self.drain(commit).await.map(SignalOutcome::Drained),
            Err(RejectedSignal { delivery, reason }) => {
                error!(error = %reason, "rejecting transaction signal");
                delivery.nack(false).await.map_err(DrainError::Reject)?;
                Ok(SignalOutcome::Rejected(reason))
            }
        }
    }

    /// Drains the commit's queue and finalizes the transaction. Consuming the
    /// signal makes finalization happen at most once.
    #[instrument(skip_all, fields(queue = %commit.queue))]
    pub async fn drain(&self, commit: CommitSignal) -> Result<DrainReport, DrainError> {
        let queue: Arc<str> = Arc::from(commit.queue.as_str());
        let broker_err = |source| DrainError::Broker {
            queue: commit.queue.clone(),
            source,
        };

        self.broker.declare_queue(&queue).await.map_err(broker_err)?;

        let mut tally = Tally::default();
        let mut rounds = 0u32;
        loop {
            rounds += 1;
            let (tracker, mut settled) = mpsc::unbounded_channel();
            let mut claimed = 0u64;

            while let Some(delivery) = self.broker.pull(&queue).await.map_err(broker_err)? {
                claimed += 1;
                self.spawn_worker(queue.clone(), tracker.clone());
                tally.record(self.apply(&queue, delivery, &tracker).await);
            }

            drop(tracker);
            while let Some(outcome) = settled.recv().await {
                claimed += 1;
                tally.record(outcome.map_err(broker_err)?);
            }

            if claimed == 0 {
                break;
            }
            debug!(round = rounds, claimed, "round settled; checking queue again");
        }

        let deletion = self.finalize(commit).await?;
        let report = DrainReport {
            queue: queue.to_string(),
            applied: tally.applied,
            requeued: tally.requeued,
            rejected: tally.rejected,
            unsettled: tally.unsettled,
            rounds,
            deletion,
        };
        info!(
            applied = report.applied,
            requeued = report.requeued,
            rejected = report.rejected,
            rounds = report.rounds,
            "transaction finalized"
        );
        Ok(report)
    }

    async fn finalize(&self, commit: CommitSignal) -> Result<QueueDeletion, DrainError> {
        let CommitSignal { queue, delivery } = commit;
        let broker_err = |source| DrainError::Broker {
            queue: queue.clone(),
            source,
        };

        delivery.ack().await.map_err(broker_err)?;
        self.metrics.incr(WorkerEvent::TransactionFinalized);

        let deletion = self
            .broker
            .delete_queue_if_empty(&queue)
            .await
            .map_err(broker_err)?;
        if let QueueDeletion::NotEmpty { messages } = deletion {
            self.metrics.incr(WorkerEvent::TransactionOrphaned);
            warn!(
                queue = %queue,
                messages,
                "transaction queue received operations after commit; left in place for reconciliation"
            );
        }
        Ok(deletion)
    }

    /// Single-shot pull. A claim spawns the next worker before applying; an
    /// empty pull ends the chain and a failed one is handed to the watcher.
    fn spawn_worker(&self, queue: Arc<str>, tracker: RoundTracker) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.broker.pull(&queue).await {
                Ok(Some(delivery)) => {
                    engine.spawn_worker(queue.clone(), tracker.clone());
                    let outcome = engine.apply(&queue, delivery, &tracker).await;
                    let _ = tracker.send(Ok(outcome));
                }
                Ok(None) => {}
                Err(err) => {
                    error!(queue = %queue, error = %err, "worker pull failed");
                    let _ = tracker.send(Err(err));
                }
            }
        });
    }

    async fn apply(&self, queue: &str, delivery: Delivery, tracker: &RoundTracker) -> ApplyOutcome {
        let operation = match StagedOperation::from_delivery(&delivery) {
            Ok(operation) => operation,
            Err(err) => {
                error!(queue, kind = ?delivery.kind(), error = %err, "rejecting staged operation");
                return self.reject(queue, delivery).await;
            }
        };

        let StagedOperation::PutObject(op) = operation;
        match self.put_object(&op, &delivery.body).await {
            Ok(()) => match delivery.ack().await {
                Ok(()) => {
                    self.metrics.incr(WorkerEvent::OperationApplied);
                    ApplyOutcome::Applied
                }
                Err(err) => {
                    warn!(queue, name = %op.name, error = %err, "stored object but ack failed; expecting redelivery");
                    ApplyOutcome::Unsettled
                }
            },
            Err(err) if err.is_permanent() => {
                error!(queue, key = %op.key(), error = %err, "staged operation can never apply; rejecting");
                self.reject(queue, delivery).await
            }
            Err(err) => {
                let delay = err.retry_after().unwrap_or(self.config.default_retry_delay);
                warn!(
                    queue,
                    key = %op.key(),
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "apply failed; requeueing"
                );
                self.metrics.incr(WorkerEvent::OperationRequeued);
                requeue_after(delivery.handle(), delay, tracker.clone());
                ApplyOutcome::Requeued
            }
        }
    }

    async fn reject(&self, queue: &str, delivery: Delivery) -> ApplyOutcome {
        self.metrics.incr(WorkerEvent::OperationRejected);
        if let Err(err) = delivery.nack(false).await {
            warn!(queue, error = %err, "failed to reject staged operation");
        }
        ApplyOutcome::Rejected
    }

    async fn put_object(&self, op: &PutObjectOperation, body: &[u8]) -> Result<(), StoreError> {
        let key = op.key();
        self.objects
            .put_object(PutObject {
                key: &key,
                content_length: op.size,
                acl: op.acl.as_deref(),
                body,
            })
            .await?;
        self.index.upsert_object(&op.index_write()).await
    }
}

/// Returns the message to the queue once `delay` has passed. The tracker keeps
/// the round open until the message is back.
fn requeue_after(handle: Arc<dyn Acknowledge>, delay: Duration, tracker: RoundTracker) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if let Err(err) = handle.nack(true).await {
            warn!(error = %err, "failed to requeue staged operation");
        }
        drop(tracker);
    });
}

impl DrainReport {
    pub fn orphaned(&self) -> bool {
        matches!(self.deletion, QueueDeletion::NotEmpty { .. })
    }
}
