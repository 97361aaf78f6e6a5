//! Core of the stash transaction worker.
//!
//! Two independent loops live here. The drain engine finalizes staged
//! transactions: it empties a per-transaction broker queue, writing each staged
//! upload to the blob store and the object index, then acknowledges the commit
//! and removes the queue. The invalidation walker follows the same index in
//! `lastUpdated` order and asks the CDN to purge every row it passes.
//!
//! External systems are reached through the traits in [`broker`], [`store`] and
//! [`invalidation`]; [`memory`] carries in-process implementations.

pub mod broker;
pub mod drain;
pub mod invalidation;
pub mod memory;
pub mod metrics;
pub mod operation;
pub mod rate;
pub mod store;

pub use broker::{Acknowledge, Broker, BrokerError, Delivery, Headers, QueueDeletion};
pub use drain::{
    ApplyOutcome, CommitSignal, DrainConfig, DrainEngine, DrainError, DrainReport, SignalOutcome,
};
pub use invalidation::{
    InvalidationCursor, InvalidationWalker, Iteration, PurgeClient, PurgeError, WalkerConfig,
};
pub use metrics::{MetricsSnapshot, WorkerEvent, WorkerMetrics};
pub use operation::{OperationError, PutObjectOperation, StagedOperation};
pub use rate::{RateLimitConfig, RateLimiter};
pub use store::{IndexStore, ObjectStore, PutObject, StoreError};
