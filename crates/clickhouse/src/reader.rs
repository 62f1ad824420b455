//! Read-only queries over the block and gap tracking tables

use std::time::Instant;

use clickhouse::{Client, Row};
use derive_more::Debug;
use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::{
    models::{BlockStatsRow, GapRow, MissingRangeRow},
    schema::{BLOCKS_TABLE, GAP_TRACKING_TABLE},
};

#[derive(Row, Deserialize, Serialize)]
struct NumberRow {
    number: u64,
}

#[derive(Row, Deserialize, Serialize)]
struct CountRow {
    total: u64,
}

/// `ClickHouse` reader client (read-only operations)
#[derive(Clone, Debug)]
pub struct ClickhouseReader {
    /// Base client
    #[debug(skip)]
    base: Client,
    /// Database name
    db_name: String,
}

impl ClickhouseReader {
    /// Create a new `ClickHouse` reader client
    pub fn new(url: Url, db_name: String, username: String, password: String) -> Result<Self> {
        let client = Client::default()
            .with_url(url)
            .with_database(db_name.clone())
            .with_user(username)
            .with_password(password);

        Ok(Self { base: client, db_name })
    }

    async fn execute<R>(&self, query: &str) -> Result<Vec<R>>
    where
        R: Row + for<'b> Deserialize<'b>,
    {
        let client = self.base.clone();
        let start = Instant::now();

        let result = client.query(query).fetch_all::<R>().await;

        let duration_ms = start.elapsed().as_millis();
        match &result {
            Ok(rows) => {
                debug!(query = %query, duration_ms, rows = rows.len(), "ClickHouse query executed")
            }
            Err(e) => error!(query = %query, duration_ms, error = %e, "ClickHouse query failed"),
        }
        result.map_err(Into::into)
    }

    /// Highest stored block number, `None` for an empty table
    pub async fn max_block_number(&self) -> Result<Option<u64>> {
        let query = format!(
            "SELECT number FROM {}.{} ORDER BY number DESC LIMIT 1",
            self.db_name, BLOCKS_TABLE
        );
        let rows = self.execute::<NumberRow>(&query).await.context("fetching max(number) failed")?;
        Ok(rows.into_iter().next().map(|r| r.number))
    }

    /// Count, bounds and newest timestamp of the stored blocks, `None` for an empty table
    pub async fn block_stats(&self) -> Result<Option<BlockStatsRow>> {
        let query = format!(
            "SELECT count() AS total, \
                    min(number) AS min_number, \
                    max(number) AS max_number, \
                    max(timestamp) AS latest_timestamp \
             FROM {}.{} FINAL",
            self.db_name, BLOCKS_TABLE
        );
        let rows = self.execute::<BlockStatsRow>(&query).await.context("fetching block stats failed")?;
        Ok(rows.into_iter().next().filter(|row| row.total > 0))
    }

    /// Distinct stored blocks in `start..=end`, after deduplication
    pub async fn count_blocks_in_range(&self, start: u64, end: u64) -> Result<u64> {
        let query = format!(
            "SELECT count() AS total FROM {}.{} FINAL WHERE number >= {start} AND number <= {end}",
            self.db_name, BLOCKS_TABLE
        );
        let rows = self.execute::<CountRow>(&query).await.context("counting blocks failed")?;
        Ok(rows.into_iter().next().map_or(0, |r| r.total))
    }

    /// Missing block ranges between the lowest and highest stored block, largest first.
    ///
    /// The lag default is the row's own number, so the first row never reports a gap.
    pub async fn missing_ranges(&self, limit: u64) -> Result<Vec<MissingRangeRow>> {
        let query = format!(
            "SELECT prev_number + 1 AS gap_start, number - 1 AS gap_end \
             FROM ( \
                SELECT number, \
                       lagInFrame(number, 1, number) OVER ( \
                           ORDER BY number ASC \
                           ROWS BETWEEN 1 PRECEDING AND CURRENT ROW \
                       ) AS prev_number \
                FROM {}.{} FINAL \
             ) \
             WHERE number - prev_number > 1 \
             ORDER BY (number - prev_number) DESC, gap_start ASC \
             LIMIT {}",
            self.db_name, BLOCKS_TABLE, limit
        );
        self.execute::<MissingRangeRow>(&query).await.context("fetching missing ranges failed")
    }

    /// Currently tracked gaps
    pub async fn tracked_gaps(&self) -> Result<Vec<GapRow>> {
        let query = format!(
            "SELECT gap_start, gap_end, gap_size, first_seen, last_seen, notified \
             FROM {}.{} FINAL \
             ORDER BY gap_start",
            self.db_name, GAP_TRACKING_TABLE
        );
        self.execute::<GapRow>(&query).await.context("fetching tracked gaps failed")
    }
}
