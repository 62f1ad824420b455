use std::future::Future;

use alloy::providers::{Provider, ProviderBuilder};
use alloy_rpc_client::ClientBuilder;
use derive_more::Debug;
use eyre::{Result, eyre};
use futures::{StreamExt, TryStreamExt, stream};
use primitives::{
    block::{Block, BlockRange},
    retries::DEFAULT_RETRY_LAYER,
};
use tracing::debug;
use url::Url;

use crate::{DefaultProvider, block_from_rpc};

/// HTTP JSON-RPC client for bulk historical reads.
///
/// Requests go through the rate-limit aware retry layer.
#[derive(Debug, Clone)]
pub struct HistoricalClient {
    #[debug(skip)]
    provider: DefaultProvider,
    concurrency: usize,
}

impl HistoricalClient {
    /// Create a client fetching at most `concurrency` blocks at a time.
    pub fn new(http_url: Url, concurrency: usize) -> Self {
        let client = ClientBuilder::default().layer(DEFAULT_RETRY_LAYER).http(http_url);
        let provider = ProviderBuilder::new().connect_client(client);
        Self { provider, concurrency: concurrency.max(1) }
    }

    /// Number of the chain head
    pub async fn latest_block_number(&self) -> Result<u64> {
        Ok(self.provider.get_block_number().await?)
    }

    /// Fetch a block that must exist
    pub async fn block(&self, number: u64) -> Result<Block> {
        let block = self
            .provider
            .get_block_by_number(number.into())
            .await?
            .ok_or_else(|| eyre!("block {number} not found"))?;
        Ok(block_from_rpc(&block))
    }

    /// Blocks whose timestamp falls in `[start_ts, end_ts)`, `None` if there are none.
    pub async fn range_for_window(&self, start_ts: u64, end_ts: u64) -> Result<Option<BlockRange>> {
        let head = self.latest_block_number().await?;
        let timestamp_of = |number| async move {
            Ok::<_, eyre::Report>(self.block(number).await?.timestamp)
        };

        let first = first_at_or_after(start_ts, head, timestamp_of).await?;
        let end = first_at_or_after(end_ts, head, timestamp_of).await?;
        debug!(start_ts, end_ts, first, end, "Resolved time window to blocks");

        Ok((first < end).then(|| BlockRange::new(first, end - 1)))
    }

    /// Fetch every block of `range`, ordered by number.
    pub async fn blocks_in_range(&self, range: BlockRange) -> Result<Vec<Block>> {
        stream::iter(range.numbers())
            .map(|number| self.block(number))
            .buffered(self.concurrency)
            .try_collect()
            .await
    }

    /// Fetch the blocks whose timestamp falls in `[start_ts, end_ts)`.
    pub async fn blocks_in_window(&self, start_ts: u64, end_ts: u64) -> Result<Vec<Block>> {
        match self.range_for_window(start_ts, end_ts).await? {
            Some(range) => self.blocks_in_range(range).await,
            None => Ok(Vec::new()),
        }
    }
}

/// Lowest block number in `0..=head` whose timestamp is at least `ts`, or
/// `head + 1` when every block is older. Timestamps are non-decreasing in the
/// block number.
pub async fn first_at_or_after<F, Fut>(ts: u64, head: u64, timestamp_of: F) -> Result<u64>
where
    F: Fn(u64) -> Fut,
    Fut: Future<Output = Result<u64>>,
{
    let (mut lo, mut hi) = (0u64, head + 1);
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if timestamp_of(mid).await? < ts {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    Ok(lo)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 12s slots starting at genesis time 1000, with a missed slot after block 4
    const TIMESTAMPS: [u64; 8] = [1000, 1012, 1024, 1036, 1048, 1072, 1084, 1096];

    async fn search(ts: u64) -> u64 {
        let head = TIMESTAMPS.len() as u64 - 1;
        first_at_or_after(ts, head, |n| async move { Ok(TIMESTAMPS[n as usize]) }).await.unwrap()
    }

    #[tokio::test]
    async fn exact_match_returns_that_block() {
        assert_eq!(search(1036).await, 3);
    }

    #[tokio::test]
    async fn between_blocks_returns_next_block() {
        assert_eq!(search(1050).await, 5);
    }

    #[tokio::test]
    async fn before_genesis_returns_zero() {
        assert_eq!(search(0).await, 0);
    }

    #[tokio::test]
    async fn after_head_returns_head_plus_one() {
        assert_eq!(search(5000).await, 8);
    }

    #[tokio::test]
    async fn lookup_errors_propagate() {
        let result = first_at_or_after(10, 100, |_| async { Err(eyre!("rpc down")) }).await;
        assert!(result.is_err());
    }
}
