//! Worker counters.
//!
//! Each event is recorded on an OpenTelemetry instrument, which the worker's
//! meter provider exports over OTLP, and in a local tally that `/metrics` and
//! tests read back without an exporter.

use std::{collections::BTreeMap, fmt};

use opentelemetry::{
    global,
    metrics::{Counter, Meter, UpDownCounter},
};
use parking_lot::Mutex;

/// Meter name used when no meter is handed in.
pub const METER_NAME: &str = "stash-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WorkerEvent {
    TransactionFinalized,
    TransactionOrphaned,
    OperationApplied,
    OperationRequeued,
    OperationRejected,
    PurgeBatch,
    PurgedUrl,
    PurgeFailure,
}

impl WorkerEvent {
    pub const ALL: [WorkerEvent; 8] = [
        WorkerEvent::TransactionFinalized,
        WorkerEvent::TransactionOrphaned,
        WorkerEvent::OperationApplied,
        WorkerEvent::OperationRequeued,
        WorkerEvent::OperationRejected,
        WorkerEvent::PurgeBatch,
        WorkerEvent::PurgedUrl,
        WorkerEvent::PurgeFailure,
    ];

    pub fn metric_name(self) -> &'static str {
        match self {
            WorkerEvent::TransactionFinalized => "stash.transactions.finalized",
            WorkerEvent::TransactionOrphaned => "stash.transactions.orphaned",
            WorkerEvent::OperationApplied => "stash.operations.applied",
            WorkerEvent::OperationRequeued => "stash.operations.requeued",
            WorkerEvent::OperationRejected => "stash.operations.rejected",
            WorkerEvent::PurgeBatch => "stash.purge.batches",
            WorkerEvent::PurgedUrl => "stash.purge.urls",
            WorkerEvent::PurgeFailure => "stash.purge.failures",
        }
    }

    fn description(self) -> &'static str {
        match self {
            WorkerEvent::TransactionFinalized => "Commit signals acknowledged after a full drain",
            WorkerEvent::TransactionOrphaned => "Transaction queues left behind non-empty",
            WorkerEvent::OperationApplied => "Staged operations written and acknowledged",
            WorkerEvent::OperationRequeued => "Staged operations returned to their queue",
            WorkerEvent::OperationRejected => "Staged operations dropped without requeue",
            WorkerEvent::PurgeBatch => "CDN purge calls issued",
            WorkerEvent::PurgedUrl => "URLs confirmed purged by the CDN",
            WorkerEvent::PurgeFailure => "CDN purge calls that failed",
        }
    }
}

/// Point-in-time copy of the local tally.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub counters: BTreeMap<&'static str, u64>,
    pub invalidation_cursor: i64,
}

#[derive(Debug, Default)]
struct Tally {
    counts: BTreeMap<WorkerEvent, u64>,
    cursor: i64,
}

pub struct WorkerMetrics {
    counters: BTreeMap<WorkerEvent, Counter<u64>>,
    cursor: UpDownCounter<i64>,
    tally: Mutex<Tally>,
}

impl WorkerMetrics {
    pub fn new(meter: &Meter) -> Self {
        let counters = WorkerEvent::ALL
            .into_iter()
            .map(|event| {
                let counter = meter
                    .u64_counter(event.metric_name())
                    .with_description(event.description())
                    .init();
                (event, counter)
            })
            .collect();
        let cursor = meter
            .i64_up_down_counter("stash.invalidation.cursor")
            .with_description("lastUpdated value the invalidation walker has purged up to")
            .init();
        Self {
            counters,
            cursor,
            tally: Mutex::new(Tally::default()),
        }
    }

    pub fn incr(&self, event: WorkerEvent) {
        self.record(event, 1);
    }

    pub fn record(&self, event: WorkerEvent, count: u64) {
        if let Some(counter) = self.counters.get(&event) {
            counter.add(count, &[]);
        }
        *self.tally.lock().counts.entry(event).or_default() += count;
    }

    /// The cursor is exported as an up-down counter, so only the change since
    /// the last call is added.
    pub fn set_invalidation_cursor(&self, cursor: i64) {
        let delta = {
            let mut tally = self.tally.lock();
            let delta = cursor - tally.cursor;
            tally.cursor = cursor;
            delta
        };
        if delta != 0 {
            self.cursor.add(delta, &[]);
        }
    }

    pub fn total(&self, event: WorkerEvent) -> u64 {
        self.tally.lock().counts.get(&event).copied().unwrap_or(0)
    }

    pub fn invalidation_cursor(&self) -> i64 {
        self.tally.lock().cursor
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let tally = self.tally.lock();
        MetricsSnapshot {
            counters: WorkerEvent::ALL
                .into_iter()
                .map(|event| {
                    let value = tally.counts.get(&event).copied().unwrap_or(0);
                    (event.metric_name(), value)
                })
                .collect(),
            invalidation_cursor: tally.cursor,
        }
    }
}

impl Default for WorkerMetrics {
    /// Records on the globally installed meter provider (a no-op until one is set).
    fn default() -> Self {
        Self::new(&global::meter(METER_NAME))
    }
}

impl fmt::Debug for WorkerMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerMetrics")
            .field("tally", &*self.tally.lock())
            .finish()
    }
}
