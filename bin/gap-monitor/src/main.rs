//! Entrypoint of the gap monitor.

use std::time::Duration;

use alerting::{heartbeat_from, notifier_from};
use clap::Parser;
use clickhouse::{ClickhouseReader, ClickhouseWriter};
use config::GapMonitorCli;
use dotenvy::dotenv;
use driver::{ClickhouseStore, GapMonitor, MonitorConfig, unix_now};
use eyre::bail;
use runtime::{ShutdownSignal, run_until_shutdown_graceful};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> eyre::Result<()> {
    if let Ok(custom_env_file) = std::env::var("ENV_FILE") {
        dotenvy::from_filename(custom_env_file)?;
    } else {
        // Try the default .env file, and ignore if it doesn't exist.
        dotenv().ok();
    }

    let cli = GapMonitorCli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let ch = &cli.clickhouse;
    let writer = ClickhouseWriter::new(
        ch.url.clone(),
        ch.db.clone(),
        ch.username.clone(),
        ch.password.clone(),
    )?;
    writer.init_db(false).await?;
    let reader =
        ClickhouseReader::new(ch.url.clone(), ch.db.clone(), ch.username.clone(), ch.password.clone())?;

    let config = MonitorConfig {
        grace_period: cli.monitor.grace_period(),
        staleness_threshold: cli.monitor.staleness_threshold(),
        tracking_ceiling: cli.monitor.tracking_ceiling(),
        gap_detection_limit: cli.monitor.gap_detection_limit,
    };
    let monitor = GapMonitor::new(
        ClickhouseStore::new(reader, writer),
        notifier_from(cli.pushover.pushover_api_url.clone(), cli.pushover.credentials()),
        heartbeat_from(cli.healthchecks.healthchecks_ping_url.clone()),
        config,
    );

    match cli.monitor.interval_secs {
        Some(secs) => {
            info!(interval_secs = secs, "Gap monitor starting");
            let token = CancellationToken::new();
            run_until_shutdown_graceful(
                monitor.run(Duration::from_secs(secs.max(1)), token.clone()),
                ShutdownSignal::new()?,
                token,
                SHUTDOWN_TIMEOUT,
            )
            .await;
            info!("Gap monitor stopped");
        }
        None => {
            let outcome = monitor.run_cycle_reporting(unix_now()).await?;
            if !outcome.healthy {
                bail!("system unhealthy: {}", outcome.heartbeat_body().replace('\n', ", "));
            }
        }
    }

    Ok(())
}
