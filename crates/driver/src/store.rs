//! Storage seams used by the ingestion core, with their `ClickHouse` implementation

use async_trait::async_trait;
use clickhouse::{BlockRow, BlockStatsRow, ClickhouseReader, ClickhouseWriter, GapRow};
use eyre::Result;
use primitives::block::{Block, BlockRange};

/// Destination of ingested blocks
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Insert or replace blocks by number
    async fn upsert_blocks(&self, blocks: &[Block]) -> Result<()>;

    /// Highest stored block number
    async fn max_block_number(&self) -> Result<Option<u64>>;

    /// Number of distinct stored blocks within `range`
    async fn count_in_range(&self, range: BlockRange) -> Result<u64>;
}

/// Read side used by the gap monitor
#[async_trait]
pub trait GapSource: Send + Sync {
    /// Missing ranges, largest first, at most `limit`
    async fn missing_ranges(&self, limit: u64) -> Result<Vec<BlockRange>>;

    /// Count, bounds and newest timestamp of the stored blocks
    async fn block_stats(&self) -> Result<Option<BlockStatsRow>>;
}

/// Persistent gap tracking state
#[async_trait]
pub trait GapStore: Send + Sync {
    /// All tracked gaps
    async fn tracked_gaps(&self) -> Result<Vec<GapRow>>;

    /// Insert or refresh a gap
    async fn upsert_gap(&self, gap: &GapRow) -> Result<()>;

    /// Forget a gap
    async fn delete_gap(&self, range: BlockRange) -> Result<()>;
}

/// `ClickHouse` backed store
#[derive(Debug, Clone)]
pub struct ClickhouseStore {
    reader: ClickhouseReader,
    writer: ClickhouseWriter,
}

impl ClickhouseStore {
    /// Create a store from a reader and a writer on the same database
    pub const fn new(reader: ClickhouseReader, writer: ClickhouseWriter) -> Self {
        Self { reader, writer }
    }

    /// Writer, for migrations
    pub const fn writer(&self) -> &ClickhouseWriter {
        &self.writer
    }
}

#[async_trait]
impl BlockStore for ClickhouseStore {
    async fn upsert_blocks(&self, blocks: &[Block]) -> Result<()> {
        let rows: Vec<BlockRow> = blocks.iter().map(BlockRow::from).collect();
        self.writer.upsert_blocks(&rows).await
    }

    async fn max_block_number(&self) -> Result<Option<u64>> {
        self.reader.max_block_number().await
    }

    async fn count_in_range(&self, range: BlockRange) -> Result<u64> {
        self.reader.count_blocks_in_range(range.start, range.end).await
    }
}

#[async_trait]
impl GapSource for ClickhouseStore {
    async fn missing_ranges(&self, limit: u64) -> Result<Vec<BlockRange>> {
        let rows = self.reader.missing_ranges(limit).await?;
        Ok(rows.into_iter().map(|row| BlockRange::new(row.gap_start, row.gap_end)).collect())
    }

    async fn block_stats(&self) -> Result<Option<BlockStatsRow>> {
        self.reader.block_stats().await
    }
}

#[async_trait]
impl GapStore for ClickhouseStore {
    async fn tracked_gaps(&self) -> Result<Vec<GapRow>> {
        self.reader.tracked_gaps().await
    }

    async fn upsert_gap(&self, gap: &GapRow) -> Result<()> {
        self.writer.upsert_gap(gap).await
    }

    async fn delete_gap(&self, range: BlockRange) -> Result<()> {
        self.writer.delete_gap(range.start, range.end).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clickhouse::MissingRangeRow;
    use clickhouse_rs::test::{Mock, handlers};
    use url::Url;

    fn store(mock: &Mock) -> ClickhouseStore {
        let url = Url::parse(mock.url()).unwrap();
        ClickhouseStore::new(
            ClickhouseReader::new(url.clone(), "db".into(), "user".into(), "pass".into()).unwrap(),
            ClickhouseWriter::new(url, "db".into(), "user".into(), "pass".into()).unwrap(),
        )
    }

    #[tokio::test]
    async fn upsert_blocks_converts_rows() {
        let mock = Mock::new();
        let ctl = mock.add(handlers::record::<BlockRow>());

        let blocks = vec![Block::empty(1, 10), Block::empty(2, 22)];
        store(&mock).upsert_blocks(&blocks).await.unwrap();

        let rows: Vec<BlockRow> = ctl.collect().await;
        assert_eq!(rows.iter().map(|r| r.number).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rows[1].timestamp, 22);
    }

    #[tokio::test]
    async fn missing_ranges_map_to_block_ranges() {
        let mock = Mock::new();
        mock.add(handlers::provide(vec![MissingRangeRow { gap_start: 4, gap_end: 8 }]));

        let ranges = store(&mock).missing_ranges(20).await.unwrap();
        assert_eq!(ranges, vec![BlockRange::new(4, 8)]);
    }
}
