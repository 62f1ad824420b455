//! Entrypoint of the historical backfill.

use chrono::{Datelike, Utc};
use clap::Parser;
use clickhouse::{ClickhouseReader, ClickhouseWriter};
use config::{BackfillCli, BackfillCommand};
use dotenvy::dotenv;
use driver::{ChunkPlan, ChunkedBackfill, ClickhouseStore, chunked::estimate_memory, plan_years};
use extractor::HistoricalClient;
use eyre::{bail, eyre};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    if let Ok(custom_env_file) = std::env::var("ENV_FILE") {
        dotenvy::from_filename(custom_env_file)?;
    } else {
        // Try the default .env file, and ignore if it doesn't exist.
        dotenv().ok();
    }

    let cli = BackfillCli::parse();
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

    if let Some(BackfillCommand::InitDb { reset }) = cli.command {
        writer.init_db(reset).await?;
        info!(reset, "Tables initialized");
        return Ok(());
    }

    let opts = &cli.backfill;
    let block_range = opts.block_range().transpose().map_err(|e| eyre!(e))?;
    let end_year = opts.end_year.unwrap_or_else(|| Utc::now().year());
    let chunks = match block_range {
        Some(_) => Vec::new(),
        None => plan_years(opts.start_year, end_year)?,
    };

    if !opts.dry_run {
        writer.init_db(false).await?;
    }
    let reader =
        ClickhouseReader::new(ch.url.clone(), ch.db.clone(), ch.username.clone(), ch.password.clone())?;
    let source = HistoricalClient::new(cli.rpc.http_url.clone(), opts.fetch_concurrency);
    let backfill = ChunkedBackfill::new(
        source,
        ClickhouseStore::new(reader, writer),
        opts.insert_batch_size as u64,
        opts.stop_on_error,
    );

    if let Some(range) = block_range {
        if opts.dry_run {
            println!(
                "range {range}: {} blocks, est. {} MiB",
                range.len(),
                estimate_memory(range.len()) / (1024 * 1024)
            );
            return Ok(());
        }

        let fill = backfill.fill_range(range).await?;
        info!(range = %fill.range, written = fill.written, stored = fill.stored, "Range fill finished");
        if !fill.is_complete() {
            bail!("{} of {} blocks stored for {range}", fill.stored, range.len());
        }
        return Ok(());
    }

    if opts.dry_run {
        print_plan(&backfill.plan(&chunks).await?);
        return Ok(());
    }

    info!(start_year = opts.start_year, end_year, chunks = chunks.len(), "Backfill starting");
    let report = backfill.run(&chunks).await;
    info!(
        completed = report.completed.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        blocks = report.blocks_written(),
        "Backfill finished"
    );

    if !report.is_success() {
        for failed in &report.failed {
            error!(year = failed.year, err = %failed.error, "Chunk failed, re-run to retry it");
        }
        bail!("{} chunk(s) failed, {} skipped", report.failed.len(), report.skipped.len());
    }
    Ok(())
}

fn print_plan(plan: &[ChunkPlan]) {
    println!("{:<6} {:>12} {:>12} {:>12} {:>10}  fits", "year", "first", "last", "blocks", "est. MiB");
    for line in plan {
        let (first, last) = line
            .range
            .map_or_else(|| ("-".to_owned(), "-".to_owned()), |r| (r.start.to_string(), r.end.to_string()));
        println!(
            "{:<6} {first:>12} {last:>12} {:>12} {:>10}  {}",
            line.chunk.year,
            line.blocks(),
            line.estimated_bytes / (1024 * 1024),
            if line.fits { "yes" } else { "NO" }
        );
    }
    let total: u64 = plan.iter().map(ChunkPlan::blocks).sum();
    println!("total blocks: {total}");
}
