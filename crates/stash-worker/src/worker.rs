use std::{future::Future, sync::Arc};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures::{Stream, StreamExt};
use stash_db::Database;
use stash_kernel::{
    invalidation::IDLE_INTERVAL, Broker, Delivery, DrainConfig, DrainEngine, IndexStore,
    InvalidationCursor, InvalidationWalker, ObjectStore, RateLimitConfig, SignalOutcome,
    WalkerConfig, WorkerMetrics,
};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::{
    amqp::{into_delivery, AmqpBroker},
    config::{CdnConfig, WorkerConfig},
    health,
    keycdn::KeyCdnPurger,
    s3::S3ObjectStore,
};

type Fatal = mpsc::UnboundedSender<anyhow::Error>;

pub async fn run() -> Result<()> {
    let config = WorkerConfig::from_env()?;
    run_with(config).await
}

/// Runs until the commit consumer stops, a background task fails fatally, or
/// the process is interrupted.
pub async fn run_with(config: WorkerConfig) -> Result<()> {
    let metrics = Arc::new(WorkerMetrics::default());
    let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();

    let db = Database::connect_with(&config.database_url, config.db_max_connections)
        .await
        .context("failed to open database")?;
    let index = Arc::new(db);
    let objects =
        Arc::new(S3ObjectStore::from_env(&config.s3_bucket, config.s3_endpoint.as_deref()).await);
    let broker = Arc::new(AmqpBroker::connect(&config.amqp_url).await?);

    if let Some(addr) = config.health_addr {
        let metrics = metrics.clone();
        let fatal = fatal_tx.clone();
        tokio::spawn(async move {
            if let Err(err) = health::serve(addr, metrics).await {
                let _ = fatal.send(err);
            }
        });
    }

    match &config.cdn {
        Some(cdn) => start_walker(cdn, index.clone(), metrics.clone())?,
        None => info!("CDN invalidation disabled"),
    }

    let engine = DrainEngine::new(
        broker.clone(),
        objects,
        index,
        DrainConfig::default(),
        metrics,
    );

    let queue = config.transactions_queue.as_str();
    let consumer = broker.consume_commits(queue).await?;
    info!(queue, "stash worker running");

    let commits = consumer.map(|delivery| delivery.map(into_delivery));
    supervise(queue, commits, fatal_rx, interrupted(), |delivery| {
        spawn_drain(&engine, delivery, fatal_tx.clone())
    })
    .await
}

/// Hands every commit to `dispatch` until the stream ends or fails, a fatal
/// error arrives, or `shutdown` completes. Only the last one is a clean exit.
pub async fn supervise<S, T, E, F>(
    queue: &str,
    mut commits: S,
    mut fatal: mpsc::UnboundedReceiver<anyhow::Error>,
    shutdown: impl Future<Output = ()>,
    mut dispatch: F,
) -> Result<()>
where
    S: Stream<Item = Result<T, E>> + Unpin,
    E: std::error::Error + Send + Sync + 'static,
    F: FnMut(T),
{
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            next = commits.next() => match next {
                Some(Ok(commit)) => dispatch(commit),
                Some(Err(err)) => {
                    return Err(err).with_context(|| format!("consumer on '{queue}' failed"));
                }
                None => bail!("broker cancelled the consumer on '{queue}'"),
            },
            Some(err) = fatal.recv() => return Err(err),
            () = &mut shutdown => return Ok(()),
        }
    }
}

async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "cannot listen for interrupts");
        std::future::pending::<()>().await;
    }
    info!("interrupt received; stopping");
}

fn start_walker(cdn: &CdnConfig, index: Arc<Database>, metrics: Arc<WorkerMetrics>) -> Result<()> {
    let purger = KeyCdnPurger::new(&cdn.api_base, &cdn.zone_id, cdn.api_key.clone())
        .context("failed to build CDN client")?;
    let start = cdn
        .start_ms
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    let walker = InvalidationWalker::new(
        index,
        Arc::new(purger),
        WalkerConfig {
            zone_url: cdn.zone_url.clone(),
            page_size: cdn.page_size,
            idle_interval: IDLE_INTERVAL,
            rate: RateLimitConfig::per_minute(cdn.requests_per_minute),
        },
        InvalidationCursor::starting_at(start),
        metrics,
    );
    tokio::spawn(walker.run());
    Ok(())
}

/// Drains one commit in the background so later commits are not held up.
/// Broker failures are forwarded to the main loop and end the process.
fn spawn_drain<B, O, I>(engine: &DrainEngine<B, O, I>, delivery: Delivery, fatal: Fatal)
where
    B: Broker,
    O: ObjectStore,
    I: IndexStore,
{
    let engine = engine.clone();
    tokio::spawn(async move {
        match engine.handle_signal(delivery).await {
            Ok(SignalOutcome::Drained(report)) if report.orphaned() => {
                error!(queue = %report.queue, "transaction queue orphaned after commit");
            }
            Ok(_) => {}
            Err(err) => {
                error!(error = %err, "transaction drain aborted");
                let _ = fatal.send(err.into());
            }
        }
    });
}
