//! CDN invalidation walker.
//!
//! Walks the object index in `lastUpdated` order from an in-memory cursor and
//! purges the public URL of every row it passes. The lower bound is inclusive
//! so rows sharing the cursor's timestamp are never skipped; rows that the
//! previous successful batch already purged are dropped from the head of the
//! next page instead.

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use stash_db::ChangedObject;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    metrics::{WorkerEvent, WorkerMetrics},
    rate::{RateLimitConfig, RateLimiter},
    store::IndexStore,
};

/// Rows purged per CDN call.
pub const PAGE_SIZE: usize = 100;

/// Poll interval while nothing new shows up (ten iterations per second).
pub const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Back-off after the index query itself failed.
pub const QUERY_RETRY_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("purge request failed: {0}")]
    Transport(String),
    #[error("purge rejected with status '{status}': {description}")]
    Rejected { status: String, description: String },
    #[error("purge response unreadable: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait PurgeClient: Send + Sync + 'static {
    /// Purges every URL in one call; `Ok` only when the CDN confirmed success.
    async fn purge_urls(&self, urls: &[String]) -> Result<(), PurgeError>;
}

/// `(name, lastUpdated)` identity of a purged row.
pub type BatchKey = (String, i64);

fn batch_key(row: &ChangedObject) -> BatchKey {
    (row.name.clone(), row.last_updated)
}

/// Walker-owned scan position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationCursor {
    pub last_invalidated: i64,
    pub prev_batch: BTreeSet<BatchKey>,
}

impl InvalidationCursor {
    /// Starts at `last_invalidated` with no previous batch; after a restart this
    /// can purge one batch twice, which the CDN tolerates.
    pub fn starting_at(last_invalidated: i64) -> Self {
        Self {
            last_invalidated,
            prev_batch: BTreeSet::new(),
        }
    }
}

/// What one page of index rows turns into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PagePlan {
    Empty,
    /// Every leading row was purged by the previous batch.
    AllSeen { full_page: bool },
    Purge {
        rows: Vec<ChangedObject>,
        next_cursor: i64,
        snapshot: BTreeSet<BatchKey>,
    },
}

/// Turns a page fetched with limit `page_size + 1` into the rows to purge and
/// the cursor to adopt once they are purged.
pub fn plan_page(
    mut rows: Vec<ChangedObject>,
    page_size: usize,
    prev_batch: &BTreeSet<BatchKey>,
) -> PagePlan {
    if rows.is_empty() {
        return PagePlan::Empty;
    }

    let full_page = rows.len() > page_size;
    rows.truncate(page_size + 1);
    let next_cursor = if full_page {
        // The overflow row is not purged now; its timestamp becomes the next
        // low-water mark so it is read again.
        match rows.pop() {
            Some(overflow) => overflow.last_updated,
            None => return PagePlan::Empty,
        }
    } else {
        match rows.last() {
            Some(last) => last.last_updated,
            None => return PagePlan::Empty,
        }
    };

    let snapshot: BTreeSet<BatchKey> = rows.iter().map(batch_key).collect();
    let seen = rows
        .iter()
        .take_while(|row| prev_batch.contains(&batch_key(row)))
        .count();
    rows.drain(..seen);

    if rows.is_empty() {
        return PagePlan::AllSeen { full_page };
    }

    PagePlan::Purge {
        rows,
        next_cursor,
        snapshot,
    }
}

#[derive(Debug, Clone)]
pub struct WalkerConfig {
    /// Public base URL of the CDN zone; rows are served at `<zone_url>/object/<name>`.
    pub zone_url: String,
    pub page_size: usize,
    pub idle_interval: Duration,
    pub rate: RateLimitConfig,
}

impl WalkerConfig {
    pub fn new(zone_url: impl Into<String>) -> Self {
        Self {
            zone_url: zone_url.into(),
            page_size: PAGE_SIZE,
            idle_interval: IDLE_INTERVAL,
            rate: RateLimitConfig::default(),
        }
    }

    pub fn object_url(&self, name: &str) -> String {
        format!("{}/object/{}", self.zone_url.trim_end_matches('/'), name)
    }
}

/// Result of one walker iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration {
    Idle,
    Deduplicated,
    /// More than a page of rows share the cursor timestamp and all of them
    /// were purged already; the cursor cannot move until those rows change.
    Stalled { cursor: i64 },
    Purged { urls: usize, cursor: i64 },
    PurgeFailed { urls: usize },
    QueryFailed,
}

impl Iteration {
    fn issued_purge(&self) -> bool {
        matches!(self, Iteration::Purged { .. } | Iteration::PurgeFailed { .. })
    }
}

pub struct InvalidationWalker<I, P>
where
    I: IndexStore,
    P: PurgeClient,
{
    index: Arc<I>,
    purger: Arc<P>,
    config: WalkerConfig,
    cursor: InvalidationCursor,
    limiter: RateLimiter,
    metrics: Arc<WorkerMetrics>,
    /// Cursor value the stall warning was last logged for.
    stall_warned_at: Option<i64>,
}

impl<I, P> InvalidationWalker<I, P>
where
    I: IndexStore,
    P: PurgeClient,
{
    pub fn new(
        index: Arc<I>,
        purger: Arc<P>,
        config: WalkerConfig,
        cursor: InvalidationCursor,
        metrics: Arc<WorkerMetrics>,
    ) -> Self {
        let limiter = RateLimiter::new(config.rate.clone());
        metrics.set_invalidation_cursor(cursor.last_invalidated);
        Self {
            index,
            purger,
            config,
            cursor,
            limiter,
            metrics,
            stall_warned_at: None,
        }
    }

    pub fn cursor(&self) -> &InvalidationCursor {
        &self.cursor
    }

    /// Cursor value at which a stall was last reported, if any.
    pub fn stall_warned_at(&self) -> Option<i64> {
        self.stall_warned_at
    }

    /// Runs one scan-and-purge iteration. Purge calls wait for rate budget.
    pub async fn step(&mut self) -> Iteration {
        let limit = u32::try_from(self.config.page_size + 1).unwrap_or(u32::MAX);
        let rows = match self
            .index
            .changed_since(self.cursor.last_invalidated, limit)
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                error!(error = %err, cursor = self.cursor.last_invalidated, "invalidation query failed");
                return Iteration::QueryFailed;
            }
        };

        let (rows, next_cursor, snapshot) =
            match plan_page(rows, self.config.page_size, &self.cursor.prev_batch) {
                PagePlan::Empty => return Iteration::Idle,
                PagePlan::AllSeen { full_page: false } => return Iteration::Deduplicated,
                PagePlan::AllSeen { full_page: true } => {
                    let cursor = self.cursor.last_invalidated;
                    if self.stall_warned_at != Some(cursor) {
                        warn!(
                            cursor,
                            "a full page shares the cursor timestamp with the previous batch; the walker cannot advance past it"
                        );
                        self.stall_warned_at = Some(cursor);
                    }
                    return Iteration::Stalled { cursor };
                }
                PagePlan::Purge {
                    rows,
                    next_cursor,
                    snapshot,
                } => (rows, next_cursor, snapshot),
            };

        let urls: Vec<String> = rows
            .iter()
            .map(|row| self.config.object_url(&row.name))
            .collect();

        self.limiter.acquire().await;
        self.metrics.incr(WorkerEvent::PurgeBatch);
        match self.purger.purge_urls(&urls).await {
            Ok(()) => {
                info!(
                    urls = urls.len(),
                    from = self.cursor.last_invalidated,
                    to = next_cursor,
                    "purged CDN batch"
                );
                self.cursor.last_invalidated = self.cursor.last_invalidated.max(next_cursor);
                self.cursor.prev_batch = snapshot;
                self.metrics
                    .record(WorkerEvent::PurgedUrl, urls.len() as u64);
                self.metrics
                    .set_invalidation_cursor(self.cursor.last_invalidated);
                Iteration::Purged {
                    urls: urls.len(),
                    cursor: self.cursor.last_invalidated,
                }
            }
            Err(err) => {
                self.metrics.incr(WorkerEvent::PurgeFailure);
                error!(
                    urls = urls.len(),
                    cursor = self.cursor.last_invalidated,
                    error = %err,
                    "CDN purge failed; retrying window"
                );
                Iteration::PurgeFailed { urls: urls.len() }
            }
        }
    }

    /// Delay before the iteration after `outcome`.
    fn pause_after(&self, outcome: &Iteration) -> Duration {
        if outcome.issued_purge() {
            self.limiter.delay_at(Instant::now())
        } else if *outcome == Iteration::QueryFailed {
            QUERY_RETRY_INTERVAL
        } else {
            self.config.idle_interval
        }
    }

    /// Walks forever.
    pub async fn run(mut self) {
        info!(
            cursor = self.cursor.last_invalidated,
            zone = %self.config.zone_url,
            "invalidation walker started"
        );
        loop {
            let outcome = self.step().await;
            let pause = self.pause_after(&outcome);
            debug!(?outcome, pause_ms = pause.as_millis() as u64, "walker iteration done");
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(name: &str, last_updated: i64) -> ChangedObject {
        ChangedObject {
            user_id: 1,
            name: name.to_string(),
            last_updated,
        }
    }

    fn names(rows: &[ChangedObject]) -> Vec<&str> {
        rows.iter().map(|row| row.name.as_str()).collect()
    }

    #[test]
    fn short_page_advances_to_last_row() {
        let plan = plan_page(
            vec![row("a", 100), row("b", 100), row("c", 150)],
            PAGE_SIZE,
            &BTreeSet::new(),
        );
        let PagePlan::Purge {
            rows,
            next_cursor,
            snapshot,
        } = plan
        else {
            panic!("expected a purge plan");
        };
        assert_eq!(names(&rows), vec!["a", "b", "c"]);
        assert_eq!(next_cursor, 150);
        assert!(snapshot.contains(&("c".to_string(), 150)));
    }

    #[test]
    fn full_page_drops_overflow_row_and_uses_it_as_cursor() {
        let rows: Vec<_> = (0..=3).map(|i| row(&format!("r{i}"), 10 + i)).collect();
        let PagePlan::Purge {
            rows,
            next_cursor,
            snapshot,
        } = plan_page(rows, 3, &BTreeSet::new())
        else {
            panic!("expected a purge plan");
        };
        assert_eq!(names(&rows), vec!["r0", "r1", "r2"]);
        assert_eq!(next_cursor, 13);
        assert!(!snapshot.contains(&("r3".to_string(), 13)));
    }

    #[test]
    fn only_leading_duplicates_are_dropped() {
        let prev: BTreeSet<BatchKey> = [("c".to_string(), 150), ("z".to_string(), 160)]
            .into_iter()
            .collect();
        let PagePlan::Purge { rows, snapshot, .. } =
            plan_page(vec![row("c", 150), row("d", 155), row("z", 160)], PAGE_SIZE, &prev)
        else {
            panic!("expected a purge plan");
        };
        assert_eq!(names(&rows), vec!["d", "z"]);
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn page_of_previous_rows_is_all_seen() {
        let prev: BTreeSet<BatchKey> = [("c".to_string(), 150)].into_iter().collect();
        assert_eq!(
            plan_page(vec![row("c", 150)], PAGE_SIZE, &prev),
            PagePlan::AllSeen { full_page: false }
        );
        assert_eq!(plan_page(Vec::new(), PAGE_SIZE, &prev), PagePlan::Empty);
    }

    #[test]
    fn rewritten_row_is_not_a_duplicate() {
        let prev: BTreeSet<BatchKey> = [("c".to_string(), 150)].into_iter().collect();
        let PagePlan::Purge { rows, .. } = plan_page(vec![row("c", 151)], PAGE_SIZE, &prev) else {
            panic!("expected a purge plan");
        };
        assert_eq!(names(&rows), vec!["c"]);
    }

    #[test]
    fn object_urls_join_zone_and_name() {
        let config = WalkerConfig::new("https://cdn.example.com/");
        assert_eq!(
            config.object_url("cat.png"),
            "https://cdn.example.com/object/cat.png"
        );
    }
}
