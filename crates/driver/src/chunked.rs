//! Chunked historical backfill, one calendar year per chunk

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use eyre::{Result, bail, eyre};
use extractor::HistoricalClient;
use primitives::block::{Block, BlockRange};
use tracing::{error, info, warn};

use crate::store::BlockStore;

/// Rough in-memory size of one stored column value
pub const BYTES_PER_VALUE: u64 = 100;

/// Number of stored columns per block
pub const COLUMNS_PER_BLOCK: u64 = 11;

/// Memory available to a backfill run
pub const MEMORY_LIMIT_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Share of [`MEMORY_LIMIT_BYTES`] a chunk may use: 80%
pub const MEMORY_BUDGET_BYTES: u64 = MEMORY_LIMIT_BYTES / 5 * 4;

/// Working-set estimate for `blocks` blocks
pub const fn estimate_memory(blocks: u64) -> u64 {
    blocks.saturating_mul(BYTES_PER_VALUE * COLUMNS_PER_BLOCK)
}

/// One calendar year, `[start_ts, end_ts)` in UTC unix seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearChunk {
    /// Calendar year
    pub year: i32,
    /// Jan 1 of `year`, 00:00 UTC
    pub start_ts: u64,
    /// Jan 1 of `year + 1`, 00:00 UTC
    pub end_ts: u64,
}

impl YearChunk {
    /// Chunk covering `year`
    pub fn new(year: i32) -> Result<Self> {
        Ok(Self { year, start_ts: new_year_ts(year)?, end_ts: new_year_ts(year + 1)? })
    }
}

fn new_year_ts(year: i32) -> Result<u64> {
    let midnight = NaiveDate::from_ymd_opt(year, 1, 1)
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .ok_or_else(|| eyre!("year {year} is out of range"))?;
    let ts = Utc.from_utc_datetime(&midnight).timestamp();
    u64::try_from(ts).map_err(|_| eyre!("year {year} starts before the unix epoch"))
}

/// Chunks for `start_year..=end_year`
pub fn plan_years(start_year: i32, end_year: i32) -> Result<Vec<YearChunk>> {
    if start_year > end_year {
        bail!("start year {start_year} is after end year {end_year}");
    }
    (start_year..=end_year).map(YearChunk::new).collect()
}

/// Bulk source of historical blocks
#[async_trait]
pub trait BulkBlockSource: Send + Sync {
    /// Blocks whose timestamp falls in `[start_ts, end_ts)`, `None` when empty
    async fn range_for_window(&self, start_ts: u64, end_ts: u64) -> Result<Option<BlockRange>>;

    /// Every block of `range`, ordered by number
    async fn fetch_range(&self, range: BlockRange) -> Result<Vec<Block>>;

    /// Every block whose timestamp falls in `[start_ts, end_ts)`
    async fn fetch_window(&self, start_ts: u64, end_ts: u64) -> Result<Vec<Block>> {
        match self.range_for_window(start_ts, end_ts).await? {
            Some(range) => self.fetch_range(range).await,
            None => Ok(Vec::new()),
        }
    }
}

#[async_trait]
impl BulkBlockSource for HistoricalClient {
    async fn range_for_window(&self, start_ts: u64, end_ts: u64) -> Result<Option<BlockRange>> {
        Self::range_for_window(self, start_ts, end_ts).await
    }

    async fn fetch_range(&self, range: BlockRange) -> Result<Vec<Block>> {
        self.blocks_in_range(range).await
    }
}

/// Chunk plan line, used by the dry run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    /// The chunk
    pub chunk: YearChunk,
    /// Blocks in the chunk, `None` when the window holds no block
    pub range: Option<BlockRange>,
    /// Working-set estimate in bytes
    pub estimated_bytes: u64,
    /// Whether the estimate fits the memory budget
    pub fits: bool,
}

impl ChunkPlan {
    /// Number of blocks in the chunk
    pub fn blocks(&self) -> u64 {
        self.range.map_or(0, |range| range.len())
    }
}

/// Chunk written to the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletedChunk {
    /// Calendar year
    pub year: i32,
    /// Blocks written
    pub blocks: u64,
}

/// Chunk that failed; blocks written by earlier batches stay stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChunk {
    /// Calendar year
    pub year: i32,
    /// Failure with its cause chain
    pub error: String,
}

/// Outcome of a backfill run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    /// Chunks fully written
    pub completed: Vec<CompletedChunk>,
    /// Chunks that failed
    pub failed: Vec<FailedChunk>,
    /// Chunks not attempted after a failure with `stop_on_error`
    pub skipped: Vec<i32>,
}

impl BackfillReport {
    /// Whether every chunk was written
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }

    /// Total blocks written by completed chunks
    pub fn blocks_written(&self) -> u64 {
        self.completed.iter().map(|chunk| chunk.blocks).sum()
    }
}

/// Outcome of a targeted range fill
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeFill {
    /// The requested range
    pub range: BlockRange,
    /// Blocks fetched and written
    pub written: u64,
    /// Distinct blocks of the range found in the store afterwards
    pub stored: u64,
}

impl RangeFill {
    /// Whether the store now holds every block of the range
    pub const fn is_complete(&self) -> bool {
        self.stored >= self.range.len()
    }
}

/// Runs year chunks one after the other, writing each in insert batches.
#[derive(Debug)]
pub struct ChunkedBackfill<B, W> {
    source: B,
    store: W,
    insert_batch_size: u64,
    stop_on_error: bool,
    memory_budget: u64,
}

impl<B: BulkBlockSource, W: BlockStore> ChunkedBackfill<B, W> {
    /// Create a backfill writing at most `insert_batch_size` blocks per insert
    pub fn new(source: B, store: W, insert_batch_size: u64, stop_on_error: bool) -> Self {
        Self {
            source,
            store,
            insert_batch_size: insert_batch_size.max(1),
            stop_on_error,
            memory_budget: MEMORY_BUDGET_BYTES,
        }
    }

    /// Override the per-chunk memory budget
    pub const fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    /// Resolve every chunk to its block range without fetching blocks.
    pub async fn plan(&self, chunks: &[YearChunk]) -> Result<Vec<ChunkPlan>> {
        let mut plan = Vec::with_capacity(chunks.len());
        for &chunk in chunks {
            let range = self.source.range_for_window(chunk.start_ts, chunk.end_ts).await?;
            let estimated_bytes = estimate_memory(range.map_or(0, |r| r.len()));
            plan.push(ChunkPlan {
                chunk,
                range,
                estimated_bytes,
                fits: estimated_bytes <= self.memory_budget,
            });
        }
        Ok(plan)
    }

    /// Backfill every chunk. A failing chunk is reported and, unless
    /// `stop_on_error` is set, the run moves on to the next one.
    pub async fn run(&self, chunks: &[YearChunk]) -> BackfillReport {
        let mut report = BackfillReport::default();

        for (idx, chunk) in chunks.iter().enumerate() {
            match self.run_chunk(chunk).await {
                Ok(blocks) => {
                    info!(year = chunk.year, blocks, "Chunk complete");
                    report.completed.push(CompletedChunk { year: chunk.year, blocks });
                }
                Err(e) => {
                    error!(year = chunk.year, err = %e, "Chunk failed");
                    report.failed.push(FailedChunk { year: chunk.year, error: format!("{e:#}") });
                    if self.stop_on_error {
                        report.skipped = chunks[idx + 1..].iter().map(|c| c.year).collect();
                        warn!(skipped = report.skipped.len(), "Stopping after failed chunk");
                        break;
                    }
                }
            }
        }

        report
    }

    async fn run_chunk(&self, chunk: &YearChunk) -> Result<u64> {
        let Some(range) = self.source.range_for_window(chunk.start_ts, chunk.end_ts).await? else {
            info!(year = chunk.year, "No blocks in chunk");
            return Ok(0);
        };

        let estimated = estimate_memory(range.len());
        if estimated > self.memory_budget {
            bail!(
                "chunk {} needs an estimated {estimated} bytes for {} blocks, budget is {} bytes",
                chunk.year,
                range.len(),
                self.memory_budget
            );
        }
        info!(year = chunk.year, range = %range, estimated_bytes = estimated, "Backfilling chunk");

        self.write_batches(range).await
    }

    /// Fetch and write exactly `range`, then count what the store holds for it.
    /// Used to repair a known gap without re-running a whole year.
    pub async fn fill_range(&self, range: BlockRange) -> Result<RangeFill> {
        info!(range = %range, blocks = range.len(), "Filling block range");
        let written = self.write_batches(range).await?;
        let stored = self.store.count_in_range(range).await?;

        let fill = RangeFill { range, written, stored };
        if fill.is_complete() {
            info!(range = %range, stored, "Range verified complete");
        } else {
            warn!(range = %range, stored, expected = range.len(), "Range still incomplete after fill");
        }
        Ok(fill)
    }

    async fn write_batches(&self, range: BlockRange) -> Result<u64> {
        let mut written = 0;
        for batch in split_range(range, self.insert_batch_size) {
            let blocks = self.source.fetch_range(batch).await?;
            if blocks.len() as u64 != batch.len() {
                bail!("expected {} blocks for {batch}, got {}", batch.len(), blocks.len());
            }
            self.store.upsert_blocks(&blocks).await?;
            written += batch.len();
            info!(batch = %batch, written, total = range.len(), "Inserted batch");
        }
        Ok(written)
    }
}

/// Consecutive sub-ranges of at most `size` blocks
fn split_range(range: BlockRange, size: u64) -> impl Iterator<Item = BlockRange> {
    let size = size.max(1);
    (range.start..=range.end)
        .step_by(usize::try_from(size).unwrap_or(usize::MAX))
        .map(move |start| BlockRange::new(start, start.saturating_add(size - 1).min(range.end)))
}
