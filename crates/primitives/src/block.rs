use std::fmt;

use alloy_primitives::U256;
use serde::{Deserialize, Serialize};

/// A block as stored in the destination table, keyed by `number`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// Block number
    pub number: u64,
    /// Block timestamp (unix seconds)
    pub timestamp: u64,
    /// Gas limit
    pub gas_limit: u64,
    /// Gas used
    pub gas_used: u64,
    /// Base fee per gas, zero before London
    pub base_fee_per_gas: u64,
    /// Number of transactions in the block
    pub transaction_count: u64,
    /// Mining difficulty, zero after the merge
    pub difficulty: U256,
    /// Total difficulty, not served by every provider
    pub total_difficulty: Option<U256>,
    /// Block size in bytes
    pub size: u64,
    /// Blob gas used (EIP-4844)
    pub blob_gas_used: Option<u64>,
    /// Excess blob gas (EIP-4844)
    pub excess_blob_gas: Option<u64>,
}

impl Block {
    /// Returns a block with only the key and timestamp set.
    pub const fn empty(number: u64, timestamp: u64) -> Self {
        Self {
            number,
            timestamp,
            gas_limit: 0,
            gas_used: 0,
            base_fee_per_gas: 0,
            transaction_count: 0,
            difficulty: U256::ZERO,
            total_difficulty: None,
            size: 0,
            blob_gas_used: None,
            excess_blob_gas: None,
        }
    }
}

/// Closed range `[start, end]` of block numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block number in the range
    pub start: u64,
    /// Last block number in the range (inclusive)
    pub end: u64,
}

impl BlockRange {
    /// Create a new range. `start` must not exceed `end`.
    pub const fn new(start: u64, end: u64) -> Self {
        debug_assert!(start <= end);
        Self { start, end }
    }

    /// Number of blocks in the range.
    pub const fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// A closed range always holds at least one block.
    pub const fn is_empty(&self) -> bool {
        false
    }

    /// Whether `number` falls within the range.
    pub const fn contains(&self, number: u64) -> bool {
        self.start <= number && number <= self.end
    }

    /// Iterate over the block numbers of the range.
    pub fn numbers(&self) -> std::ops::RangeInclusive<u64> {
        self.start..=self.end
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}..={}", self.start, self.end)
        }
    }
}

/// Collapse a set of block numbers into sorted, contiguous ranges.
pub fn collapse_ranges<I>(numbers: I) -> Vec<BlockRange>
where
    I: IntoIterator<Item = u64>,
{
    let mut sorted: Vec<u64> = numbers.into_iter().collect();
    sorted.sort_unstable();
    sorted.dedup();

    let mut ranges: Vec<BlockRange> = Vec::new();
    for number in sorted {
        match ranges.last_mut() {
            Some(last) if last.end + 1 == number => last.end = number,
            _ => ranges.push(BlockRange::new(number, number)),
        }
    }
    ranges
}
