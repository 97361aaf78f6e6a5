use std::{collections::BTreeSet, sync::Arc, time::Duration};

use proptest::prelude::*;
use stash_kernel::{
    memory::{MemoryIndex, RecordingPurger},
    InvalidationCursor, InvalidationWalker, Iteration, WalkerConfig, WorkerMetrics,
};

const ZONE: &str = "https://cdn.test";

fn url(name: &str) -> String {
    format!("{ZONE}/object/{name}")
}

fn walker(
    index: &Arc<MemoryIndex>,
    purger: &Arc<RecordingPurger>,
    page_size: usize,
    start: i64,
) -> InvalidationWalker<MemoryIndex, RecordingPurger> {
    let mut config = WalkerConfig::new(ZONE);
    config.page_size = page_size;
    InvalidationWalker::new(
        index.clone(),
        purger.clone(),
        config,
        InvalidationCursor::starting_at(start),
        Arc::new(WorkerMetrics::default()),
    )
}

/// Steps until an iteration issues no purge.
async fn walk_until_quiet(walker: &mut InvalidationWalker<MemoryIndex, RecordingPurger>) -> usize {
    let mut steps = 0;
    loop {
        steps += 1;
        match walker.step().await {
            Iteration::Purged { .. } | Iteration::PurgeFailed { .. } => continue,
            _ => return steps,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn same_timestamp_rows_are_purged_once_and_boundary_row_is_deduplicated() {
    let index = Arc::new(MemoryIndex::new());
    index.insert_row(1, "A", 100);
    index.insert_row(1, "B", 100);
    index.insert_row(2, "C", 150);
    let purger = Arc::new(RecordingPurger::new());
    let mut walker = walker(&index, &purger, 100, 0);

    assert_eq!(walker.step().await, Iteration::Purged { urls: 3, cursor: 150 });
    assert_eq!(walker.step().await, Iteration::Deduplicated);
    assert_eq!(walker.cursor().last_invalidated, 150);
    assert_eq!(purger.batches(), vec![vec![url("A"), url("B"), url("C")]]);

    // A rewrite of C gets a new timestamp and is purged again.
    index.insert_row(2, "C", 180);
    assert_eq!(walker.step().await, Iteration::Purged { urls: 1, cursor: 180 });
    assert_eq!(purger.batches().last(), Some(&vec![url("C")]));
}

#[tokio::test(start_paused = true)]
async fn empty_index_idles_without_purging() {
    let index = Arc::new(MemoryIndex::new());
    let purger = Arc::new(RecordingPurger::new());
    let mut walker = walker(&index, &purger, 100, 0);

    assert_eq!(walker.step().await, Iteration::Idle);
    assert!(purger.batches().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_page_carries_overflow_row_into_next_page() {
    let index = Arc::new(MemoryIndex::new());
    for i in 1..=150 {
        index.insert_row(1, &format!("r{i:03}"), i);
    }
    let purger = Arc::new(RecordingPurger::new());
    let mut walker = walker(&index, &purger, 100, 0);

    assert_eq!(walker.step().await, Iteration::Purged { urls: 100, cursor: 101 });
    assert_eq!(walker.step().await, Iteration::Purged { urls: 50, cursor: 150 });
    assert_eq!(walker.step().await, Iteration::Deduplicated);

    let batches = purger.batches();
    assert_eq!(batches[1].first(), Some(&url("r101")));
    let all: Vec<_> = batches.concat();
    let unique: BTreeSet<_> = all.iter().collect();
    assert_eq!(all.len(), 150);
    assert_eq!(unique.len(), 150);
}

#[tokio::test(start_paused = true)]
async fn failed_purge_keeps_cursor_and_retries_same_window() {
    let index = Arc::new(MemoryIndex::new());
    index.insert_row(1, "a", 10);
    index.insert_row(1, "b", 20);
    let purger = Arc::new(RecordingPurger::new());
    purger.fail_next(1);
    let mut walker = walker(&index, &purger, 100, 5);

    assert_eq!(walker.step().await, Iteration::PurgeFailed { urls: 2 });
    assert_eq!(walker.cursor().last_invalidated, 5);
    assert!(walker.cursor().prev_batch.is_empty());

    assert_eq!(walker.step().await, Iteration::Purged { urls: 2, cursor: 20 });
    let batches = purger.batches();
    assert_eq!(batches[0], batches[1]);
}

#[tokio::test(start_paused = true)]
async fn cursor_start_skips_older_rows() {
    let index = Arc::new(MemoryIndex::new());
    index.insert_row(1, "old", 10);
    index.insert_row(1, "new", 30);
    let purger = Arc::new(RecordingPurger::new());
    let mut walker = walker(&index, &purger, 100, 20);

    assert_eq!(walker.step().await, Iteration::Purged { urls: 1, cursor: 30 });
    assert_eq!(purger.batches(), vec![vec![url("new")]]);
}

#[tokio::test(start_paused = true)]
async fn purge_calls_respect_the_rate_ceiling() {
    let index = Arc::new(MemoryIndex::new());
    for i in 0..1_500 {
        index.insert_row(1, &format!("o{i:05}"), i);
    }
    let purger = Arc::new(RecordingPurger::new());
    let mut walker = walker(&index, &purger, 10, 0);

    walk_until_quiet(&mut walker).await;

    let times = purger.call_times();
    assert_eq!(times.len(), 150);
    for pair in times.windows(2) {
        assert!(pair[1].duration_since(pair[0]) >= Duration::from_secs(3));
    }
    for (i, start) in times.iter().enumerate() {
        let in_window = times[i..]
            .iter()
            .take_while(|at| at.duration_since(*start) < Duration::from_secs(60))
            .count();
        assert!(in_window <= 20);
    }
}

#[tokio::test(start_paused = true)]
async fn more_than_a_page_on_one_timestamp_stalls_the_cursor() {
    let index = Arc::new(MemoryIndex::new());
    for i in 0..=100 {
        index.insert_row(1, &format!("s{i:03}"), 500);
    }
    index.insert_row(1, "later", 600);
    let purger = Arc::new(RecordingPurger::new());
    let mut walker = walker(&index, &purger, 100, 0);

    assert_eq!(walker.step().await, Iteration::Purged { urls: 100, cursor: 500 });
    assert_eq!(walker.stall_warned_at(), None);
    for _ in 0..5 {
        assert_eq!(walker.step().await, Iteration::Stalled { cursor: 500 });
    }
    assert_eq!(walker.stall_warned_at(), Some(500));

    // The 101st row and everything after it stay unpurged while the tie lasts.
    assert_eq!(purger.batches().len(), 1);
    assert!(!purger.batches()[0].contains(&url("s100")));
    assert!(!purger.batches().concat().contains(&url("later")));

    // Rewriting one of the tied rows breaks the tie and the walk resumes.
    index.insert_row(1, "s000", 550);
    assert!(matches!(walker.step().await, Iteration::Purged { cursor: 550, .. }));
}

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .expect("runtime")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Timestamps are generated as non-decreasing steps with at most three rows
    /// per timestamp, below the page size of five.
    #[test]
    fn walker_purges_every_row_without_consecutive_duplicates(
        steps in proptest::collection::vec(0i64..3, 1..60),
        late in proptest::collection::vec(0i64..3, 0..20),
    ) {
        let index = Arc::new(MemoryIndex::new());
        let purger = Arc::new(RecordingPurger::new());
        let mut stamp = 1i64;
        let mut ties = 0;
        let mut expected = Vec::new();
        let mut push_rows = |deltas: &[i64], prefix: &str, index: &MemoryIndex| {
            for (i, delta) in deltas.iter().enumerate() {
                if *delta > 0 || ties == 3 {
                    stamp += (*delta).max(1);
                    ties = 0;
                }
                ties += 1;
                let name = format!("{prefix}{i:03}");
                index.insert_row(1, &name, stamp);
                expected.push(name);
            }
        };

        push_rows(&steps, "early-", &index);
        let rt = paused_runtime();
        let mut walker = walker(&index, &purger, 5, 0);
        rt.block_on(walk_until_quiet(&mut walker));

        push_rows(&late, "late-", &index);
        rt.block_on(walk_until_quiet(&mut walker));

        let batches = purger.batches();
        let purged: BTreeSet<String> = batches
            .iter()
            .flatten()
            .map(|u| u.trim_start_matches(&format!("{ZONE}/object/")).to_string())
            .collect();
        for name in &expected {
            prop_assert!(purged.contains(name), "row {} was never purged", name);
        }

        for pair in batches.windows(2) {
            let previous: BTreeSet<_> = pair[0].iter().collect();
            prop_assert!(pair[1].iter().all(|u| !previous.contains(u)));
        }

        prop_assert_eq!(walker.cursor().last_invalidated, stamp);
    }
}
