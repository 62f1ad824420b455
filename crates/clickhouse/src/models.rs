use clickhouse::Row;
use derive_more::Debug;
use primitives::block::{Block, BlockRange};
use serde::{Deserialize, Serialize};

/// Row of the `blocks` table.
///
/// `UInt256` columns travel as 32 little-endian bytes.
#[derive(Debug, Clone, Row, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockRow {
    /// Block number
    pub number: u64,
    /// Block timestamp
    pub timestamp: u64,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas used
    pub gas_used: u64,
    /// Base fee per gas
    pub base_fee_per_gas: u64,
    /// Transaction count
    pub transaction_count: u64,
    /// Difficulty
    #[debug(skip)]
    pub difficulty: [u8; 32],
    /// Total difficulty
    #[debug(skip)]
    pub total_difficulty: Option<[u8; 32]>,
    /// Size in bytes
    pub size: u64,
    /// Blob gas used
    pub blob_gas_used: Option<u64>,
    /// Excess blob gas
    pub excess_blob_gas: Option<u64>,
}

impl From<&Block> for BlockRow {
    fn from(block: &Block) -> Self {
        Self {
            number: block.number,
            timestamp: block.timestamp,
            gas_limit: block.gas_limit,
            gas_used: block.gas_used,
            base_fee_per_gas: block.base_fee_per_gas,
            transaction_count: block.transaction_count,
            difficulty: block.difficulty.to_le_bytes(),
            total_difficulty: block.total_difficulty.map(|td| td.to_le_bytes()),
            size: block.size,
            blob_gas_used: block.blob_gas_used,
            excess_blob_gas: block.excess_blob_gas,
        }
    }
}

/// Row of the `gap_tracking` table. Times are unix seconds.
#[derive(Debug, Clone, Copy, Row, Serialize, Deserialize, PartialEq, Eq)]
pub struct GapRow {
    /// First missing block number
    pub gap_start: u64,
    /// Last missing block number
    pub gap_end: u64,
    /// Number of missing blocks
    pub gap_size: u64,
    /// When the gap was first observed
    pub first_seen: u64,
    /// When the gap was last confirmed missing
    pub last_seen: u64,
    /// Whether the emergency alert was sent
    pub notified: bool,
}

impl GapRow {
    /// Range covered by this gap.
    pub const fn range(&self) -> BlockRange {
        BlockRange::new(self.gap_start, self.gap_end)
    }
}

/// Missing range as returned by the window query
#[derive(Debug, Clone, Copy, Row, Serialize, Deserialize, PartialEq, Eq)]
pub struct MissingRangeRow {
    /// First missing block number
    pub gap_start: u64,
    /// Last missing block number
    pub gap_end: u64,
}

/// Aggregate statistics of the `blocks` table
#[derive(Debug, Clone, Copy, Row, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockStatsRow {
    /// Number of stored blocks
    pub total: u64,
    /// Lowest block number
    pub min_number: u64,
    /// Highest block number
    pub max_number: u64,
    /// Timestamp of the newest block
    pub latest_timestamp: u64,
}
