//! Inline and deferred recovery of missing blocks

use std::collections::BTreeSet;

use primitives::block::{Block, BlockRange, collapse_ranges};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::fetcher::{BlockFetcher, BlockSource};

/// Block numbers still to be recovered, lowest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeferredBackfill {
    pending: BTreeSet<u64>,
}

impl DeferredBackfill {
    /// Queue one block
    pub fn push(&mut self, number: u64) {
        self.pending.insert(number);
    }

    /// Queue a whole range
    pub fn push_range(&mut self, range: BlockRange) {
        self.pending.extend(range.numbers());
        info!(range = %range, pending = self.pending.len(), "Deferred block range");
    }

    /// Drop blocks that are now stored
    pub fn mark_written<'a>(&mut self, numbers: impl IntoIterator<Item = &'a u64>) {
        for number in numbers {
            self.pending.remove(number);
        }
    }

    /// Number of pending blocks
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether nothing is pending
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Whether `number` is pending
    pub fn contains(&self, number: u64) -> bool {
        self.pending.contains(&number)
    }

    /// Lowest `limit` pending numbers
    pub fn next_batch(&self, limit: usize) -> Vec<u64> {
        self.pending.iter().take(limit).copied().collect()
    }

    /// Pending numbers collapsed into ranges
    pub fn ranges(&self) -> Vec<BlockRange> {
        collapse_ranges(self.pending.iter().copied())
    }
}

/// Fetch every block of `range` in order. Blocks that still fail after the
/// fetcher's retries, or that were not reached before `token` was cancelled,
/// are queued on `deferred`.
pub async fn inline_backfill<S: BlockSource>(
    fetcher: &BlockFetcher<S>,
    range: BlockRange,
    deferred: &mut DeferredBackfill,
    token: &CancellationToken,
) -> Vec<Block> {
    info!(range = %range, "Backfilling gap inline");
    let mut blocks = Vec::with_capacity(range.len() as usize);
    for number in range.numbers() {
        tokio::select! {
            biased;
            _ = token.cancelled() => deferred.push(number),
            result = fetcher.fetch(number) => match result {
                Ok(block) => blocks.push(block),
                Err(e) => {
                    warn!(block_number = number, err = %e, "Inline backfill failed, deferring");
                    deferred.push(number);
                }
            }
        }
    }
    if token.is_cancelled() && (blocks.len() as u64) < range.len() {
        info!(range = %range, fetched = blocks.len(), "Inline backfill cut short by shutdown");
    }
    blocks
}

/// One pass over the lowest `limit` deferred blocks, one attempt each.
/// Returned blocks stay pending until the caller has written them. The pass
/// stops as soon as `token` is cancelled.
pub async fn deferred_pass<S: BlockSource>(
    fetcher: &BlockFetcher<S>,
    deferred: &DeferredBackfill,
    limit: usize,
    token: &CancellationToken,
) -> Vec<Block> {
    let mut recovered = Vec::new();
    for number in deferred.next_batch(limit) {
        let result = tokio::select! {
            biased;
            _ = token.cancelled() => {
                info!(recovered = recovered.len(), "Deferred pass stopped by shutdown");
                break;
            }
            result = fetcher.fetch_once(number) => result,
        };
        match result {
            Ok(block) => recovered.push(block),
            Err(e) => warn!(block_number = number, err = %e, "Deferred block still unavailable"),
        }
    }
    recovered
}
