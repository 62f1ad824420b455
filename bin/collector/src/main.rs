//! Entrypoint of the real-time collector.

use std::{sync::Arc, time::Duration};

use alerting::{Heartbeat, heartbeat_from, notifier_from};
use clap::Parser;
use clickhouse::{ClickhouseReader, ClickhouseWriter};
use config::CollectorCli;
use dotenvy::dotenv;
use driver::{BlockFetcher, ClickhouseStore, Ingestor, IngestorConfig};
use extractor::Extractor;
use runtime::{ShutdownSignal, run_until_shutdown_graceful};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Time the ingestor gets for its final flush after a shutdown signal
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    if let Ok(custom_env_file) = std::env::var("ENV_FILE") {
        dotenvy::from_filename(custom_env_file)?;
    } else {
        // Try the default .env file, and ignore if it doesn't exist.
        dotenv().ok();
    }

    let cli = CollectorCli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Block collector starting...");

    let ch = &cli.clickhouse;
    let writer = ClickhouseWriter::new(
        ch.url.clone(),
        ch.db.clone(),
        ch.username.clone(),
        ch.password.clone(),
    )?;
    writer.init_db(cli.reset_db).await?;
    let reader =
        ClickhouseReader::new(ch.url.clone(), ch.db.clone(), ch.username.clone(), ch.password.clone())?;
    let store = ClickhouseStore::new(reader, writer);

    let notifier = notifier_from(cli.pushover.pushover_api_url.clone(), cli.pushover.credentials());
    let heartbeat = heartbeat_from(cli.healthchecks.healthchecks_ping_url.clone());

    let extractor = Extractor::new(cli.rpc.ws_url.clone()).await?;
    let heads = extractor.head_stream().await?;
    let fetcher =
        BlockFetcher::new(extractor, cli.fetch.retry_policy(), cli.fetch.attempt_timeout());

    let config = IngestorConfig {
        flush_interval: cli.collector.flush_interval(),
        max_buffer_blocks: cli.collector.max_buffer_blocks,
        inline_threshold: cli.collector.inline_threshold,
        fatal_flush_failures: cli.collector.fatal_flush_failures,
    };
    let mut ingestor = Ingestor::new(fetcher, store, notifier, config).await?;

    let token = CancellationToken::new();
    let heartbeats = tokio::spawn(send_heartbeats(
        heartbeat,
        cli.collector.heartbeat_interval(),
        token.clone(),
    ));

    let finished = run_until_shutdown_graceful(
        ingestor.run(heads, token.clone()),
        ShutdownSignal::new()?,
        token.clone(),
        SHUTDOWN_TIMEOUT,
    )
    .await;

    token.cancel();
    if let Err(e) = heartbeats.await {
        warn!(err = %e, "Heartbeat task failed");
    }
    if finished.is_none() {
        warn!("Final flush did not finish in time");
    }

    info!("Block collector stopped");
    Ok(())
}

/// Ping the dead-man's switch every `period` while the collector is running.
async fn send_heartbeats(heartbeat: Arc<dyn Heartbeat>, period: Duration, token: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = heartbeat.ping("Collector running", true).await {
                    warn!(err = %e, "Failed to ping heartbeat");
                }
            }
        }
    }
}
