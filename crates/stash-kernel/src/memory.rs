//! In-memory collaborators for tests and local experiments.
//!
//! `MemoryBroker` follows the claim semantics of an AMQP `basic.get`: a pulled
//! message is invisible to other pullers until it is acked or nacked.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use stash_db::{ChangedObject, ObjectOwner, ObjectRecord, ObjectWrite};
use tokio::time::Instant;

use crate::{
    broker::{Acknowledge, Broker, BrokerError, Delivery, Headers, QueueDeletion},
    invalidation::{PurgeClient, PurgeError},
    store::{IndexStore, ObjectStore, PutObject, StoreError},
};

#[derive(Debug, Clone)]
struct StoredMessage {
    kind: Option<String>,
    headers: Headers,
    body: Vec<u8>,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

/// Settlement recorded by the broker, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Acked { queue: String, kind: Option<String> },
    Requeued { queue: String, kind: Option<String> },
    Rejected { queue: String, kind: Option<String> },
    Deleted { queue: String },
    DeleteSkipped { queue: String, messages: u32 },
}

#[derive(Debug, Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    events: Vec<BrokerEvent>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a message, creating the queue when needed.
    pub fn publish(&self, queue: &str, kind: &str, headers: Headers, body: Vec<u8>) {
        let mut state = self.state.lock();
        state
            .queues
            .entry(queue.to_string())
            .or_default()
            .ready
            .push_back(StoredMessage {
                kind: Some(kind.to_string()),
                headers,
                body,
            });
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.state.lock().queues.contains_key(queue)
    }

    /// Ready plus unacknowledged messages.
    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0)
    }

    pub fn events(&self) -> Vec<BrokerEvent> {
        self.state.lock().events.clone()
    }

    fn settle(&self, queue: &str, tag: u64, settlement: Settlement) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        let message = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.unacked.remove(&tag))
            .ok_or_else(|| BrokerError::Acknowledge(format!("unknown delivery tag {tag} on '{queue}'")))?;

        let kind = message.kind.clone();
        let event = match settlement {
            Settlement::Ack => BrokerEvent::Acked {
                queue: queue.to_string(),
                kind,
            },
            Settlement::Requeue => {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_front(message);
                }
                BrokerEvent::Requeued {
                    queue: queue.to_string(),
                    kind,
                }
            }
            Settlement::Reject => BrokerEvent::Rejected {
                queue: queue.to_string(),
                kind,
            },
        };
        state.events.push(event);
        Ok(())
    }
}

enum Settlement {
    Ack,
    Requeue,
    Reject,
}

struct MemoryAck {
    broker: MemoryBroker,
    queue: String,
    tag: u64,
}

#[async_trait]
impl Acknowledge for MemoryAck {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.broker.settle(&self.queue, self.tag, Settlement::Ack)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        let settlement = if requeue {
            Settlement::Requeue
        } else {
            Settlement::Reject
        };
        self.broker.settle(&self.queue, self.tag, settlement)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError> {
        self.state.lock().queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(
        &self,
        queue: &str,
        kind: &str,
        headers: Headers,
        body: Vec<u8>,
    ) -> Result<(), BrokerError> {
        MemoryBroker::publish(self, queue, kind, headers, body);
        Ok(())
    }

    async fn pull(&self, queue: &str) -> Result<Option<Delivery>, BrokerError> {
        let claimed = {
            let mut state = self.state.lock();
            state.next_tag += 1;
            let tag = state.next_tag;
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::queue("pull", queue, "no such queue"))?;
            q.ready.pop_front().map(|message| {
                q.unacked.insert(tag, message.clone());
                (tag, message)
            })
        };

        Ok(claimed.map(|(tag, message)| {
            Delivery::new(
                message.kind,
                message.headers,
                message.body,
                Arc::new(MemoryAck {
                    broker: self.clone(),
                    queue: queue.to_string(),
                    tag,
                }),
            )
        }))
    }

    async fn delete_queue_if_empty(&self, queue: &str) -> Result<QueueDeletion, BrokerError> {
        let mut state = self.state.lock();
        let messages = state
            .queues
            .get(queue)
            .map(|q| q.ready.len() + q.unacked.len())
            .unwrap_or(0);
        let (outcome, event) = if messages == 0 {
            state.queues.remove(queue);
            (
                QueueDeletion::Deleted,
                BrokerEvent::Deleted {
                    queue: queue.to_string(),
                },
            )
        } else {
            let messages = messages as u32;
            (
                QueueDeletion::NotEmpty { messages },
                BrokerEvent::DeleteSkipped {
                    queue: queue.to_string(),
                    messages,
                },
            )
        };
        state.events.push(event);
        Ok(outcome)
    }
}

#[derive(Debug, Default)]
struct Failures {
    remaining: u32,
    retry_after: Option<Duration>,
    permanent: bool,
}

#[derive(Debug, Default)]
struct ObjectStoreState {
    objects: BTreeMap<String, (Option<String>, Vec<u8>)>,
    puts: u64,
    in_flight: usize,
    max_in_flight: usize,
    failures: Failures,
}

/// Blob store keeping the last written body per key.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    state: Mutex<ObjectStoreState>,
    latency: Duration,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every put takes `latency`, which makes overlapping puts observable.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    /// The next `count` puts fail, advertising `retry_after`.
    pub fn fail_next(&self, count: u32, retry_after: Option<Duration>) {
        self.state.lock().failures = Failures {
            remaining: count,
            retry_after,
            permanent: false,
        };
    }

    /// The next `count` puts are refused as unretryable.
    pub fn refuse_next(&self, count: u32) {
        self.state.lock().failures = Failures {
            remaining: count,
            retry_after: None,
            permanent: true,
        };
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().objects.get(key).map(|(_, body)| body.clone())
    }

    pub fn acl(&self, key: &str) -> Option<String> {
        self.state.lock().objects.get(key).and_then(|(acl, _)| acl.clone())
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn puts(&self) -> u64 {
        self.state.lock().puts
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().max_in_flight
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put_object(&self, request: PutObject<'_>) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            state.puts += 1;
            if state.failures.remaining > 0 {
                state.failures.remaining -= 1;
                if state.failures.permanent {
                    return Err(StoreError::Refused {
                        key: request.key.to_string(),
                        error: anyhow!("injected refusal"),
                    });
                }
                return Err(StoreError::Object {
                    key: request.key.to_string(),
                    retry_after: state.failures.retry_after,
                    error: anyhow!("injected object store failure"),
                });
            }
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let mut state = self.state.lock();
        state.in_flight -= 1;
        state.objects.insert(
            request.key.to_string(),
            (request.acl.map(str::to_string), request.body.to_vec()),
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
struct IndexState {
    rows: BTreeMap<(i64, String), ObjectRecord>,
    prefixes: HashMap<String, i64>,
    clock: Option<i64>,
    failures: u32,
}

/// Object index with the same upsert rules as the PostgreSQL store.
#[derive(Debug, Default)]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_prefix(&self, prefix: &str, user_id: i64) {
        self.state.lock().prefixes.insert(prefix.to_string(), user_id);
    }

    /// Pins the timestamp used by upserts; `None` goes back to wall-clock time.
    pub fn set_clock(&self, millis: Option<i64>) {
        self.state.lock().clock = millis;
    }

    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures = count;
    }

    /// Writes a row directly, bypassing upsert rules.
    pub fn insert_row(&self, user_id: i64, name: &str, last_updated: i64) {
        self.state.lock().rows.insert(
            (user_id, name.to_string()),
            ObjectRecord {
                user_id,
                name: name.to_string(),
                size: 0,
                acl: None,
                auth_key: None,
                last_updated,
            },
        );
    }

    pub fn get(&self, user_id: i64, name: &str) -> Option<ObjectRecord> {
        self.state.lock().rows.get(&(user_id, name.to_string())).cloned()
    }

    pub fn len(&self) -> usize {
        self.state.lock().rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn upsert_object(&self, write: &ObjectWrite) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if state.failures > 0 {
            state.failures -= 1;
            return Err(StoreError::Index(anyhow!("injected index failure")));
        }

        let stamp = state.clock.unwrap_or_else(|| Utc::now().timestamp_millis());
        let (user_id, acl, auth_key) = match &write.owner {
            ObjectOwner::User {
                user_id,
                acl,
                auth_key,
            } => (*user_id, Some(acl.clone()), Some(auth_key.clone())),
            ObjectOwner::Prefix(prefix) => {
                let user_id = *state
                    .prefixes
                    .get(prefix)
                    .ok_or_else(|| StoreError::UnknownPrefix(prefix.clone()))?;
                (user_id, None, None)
            }
        };

        let key = (user_id, write.name.clone());
        let previous = state.rows.get(&key).cloned();
        let record = ObjectRecord {
            user_id,
            name: write.name.clone(),
            size: write.size,
            acl: acl.unwrap_or_else(|| previous.as_ref().and_then(|row| row.acl.clone())),
            auth_key: auth_key
                .unwrap_or_else(|| previous.as_ref().and_then(|row| row.auth_key.clone())),
            last_updated: stamp,
        };
        state.rows.insert(key, record);
        Ok(())
    }

    async fn changed_since(
        &self,
        since: i64,
        limit: u32,
    ) -> Result<Vec<ChangedObject>, StoreError> {
        let state = self.state.lock();
        let mut rows: Vec<ChangedObject> = state
            .rows
            .values()
            .filter(|row| row.last_updated >= since)
            .map(|row| ChangedObject {
                user_id: row.user_id,
                name: row.name.clone(),
                last_updated: row.last_updated,
            })
            .collect();
        rows.sort_by(|a, b| (a.last_updated, &a.name).cmp(&(b.last_updated, &b.name)));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
struct PurgerState {
    batches: Vec<(Instant, Vec<String>)>,
    failures: u32,
}

/// Purge client that records every call.
#[derive(Debug, Default)]
pub struct RecordingPurger {
    state: Mutex<PurgerState>,
}

impl RecordingPurger {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next `count` calls are rejected (after being recorded).
    pub fn fail_next(&self, count: u32) {
        self.state.lock().failures = count;
    }

    pub fn batches(&self) -> Vec<Vec<String>> {
        self.state
            .lock()
            .batches
            .iter()
            .map(|(_, urls)| urls.clone())
            .collect()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.state.lock().batches.iter().map(|(at, _)| *at).collect()
    }
}

#[async_trait]
impl PurgeClient for RecordingPurger {
    async fn purge_urls(&self, urls: &[String]) -> Result<(), PurgeError> {
        let mut state = self.state.lock();
        state.batches.push((Instant::now(), urls.to_vec()));
        if state.failures > 0 {
            state.failures -= 1;
            return Err(PurgeError::Rejected {
                status: "error".into(),
                description: "injected purge failure".into(),
            });
        }
        Ok(())
    }
}
