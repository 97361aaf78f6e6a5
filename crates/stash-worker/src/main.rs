use anyhow::Result;

use stash_worker::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("stash-worker")?;
    stash_worker::worker::run().await
}
