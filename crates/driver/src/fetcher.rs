//! Single-block fetch with bounded, classified retries

use std::time::Duration;

use alloy::transports::RpcError;
use async_trait::async_trait;
use extractor::Extractor;
use primitives::{
    block::Block,
    retries::{RetryPolicy, RpcErrorExt, is_connection_refused},
};
use tracing::{debug, warn};

/// Why a block could not be fetched
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Timeout, dropped connection, server error, rate limit
    #[error("transient: {0}")]
    Transient(String),
    /// Malformed response or unknown block
    #[error("permanent: {0}")]
    Permanent(String),
    /// Every attempt failed with a transient error
    #[error("gave up after {attempts} attempts, last error: {last}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error of the final attempt
        last: Box<FetchError>,
    },
}

impl FetchError {
    /// Whether another attempt could succeed
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Source answering "fetch block by number"
#[async_trait]
pub trait BlockSource: Send + Sync {
    /// Fetch one block, classifying any failure
    async fn fetch_block(&self, number: u64) -> Result<Block, FetchError>;
}

#[async_trait]
impl BlockSource for Extractor {
    async fn fetch_block(&self, number: u64) -> Result<Block, FetchError> {
        match self.block_by_number(number).await {
            Ok(Some(block)) => Ok(block),
            Ok(None) => Err(FetchError::Permanent(format!("block {number} not found"))),
            Err(e @ (RpcError::Transport(_) | RpcError::NullResp)) => {
                Err(FetchError::Transient(e.to_string()))
            }
            Err(e) if e.is_retryable() || is_connection_refused(&e) => {
                Err(FetchError::Transient(e.to_string()))
            }
            Err(e) => Err(FetchError::Permanent(e.to_string())),
        }
    }
}

/// Wraps a [`BlockSource`] with a per-attempt timeout and a [`RetryPolicy`].
/// Only transient failures are retried.
#[derive(Debug, Clone)]
pub struct BlockFetcher<S> {
    source: S,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl<S: BlockSource> BlockFetcher<S> {
    /// Create a new fetcher
    pub const fn new(source: S, policy: RetryPolicy, attempt_timeout: Duration) -> Self {
        Self { source, policy, attempt_timeout }
    }

    /// Retry policy in use
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Single attempt bounded by the attempt timeout. An elapsed timeout is transient.
    pub async fn fetch_once(&self, number: u64) -> Result<Block, FetchError> {
        match tokio::time::timeout(self.attempt_timeout, self.source.fetch_block(number)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Transient(format!(
                "timed out after {}ms",
                self.attempt_timeout.as_millis()
            ))),
        }
    }

    /// Fetch a block, retrying transient failures with exponential backoff.
    pub async fn fetch(&self, number: u64) -> Result<Block, FetchError> {
        let mut attempts = 0u32;
        let result = self
            .policy
            .retry_if(
                || {
                    attempts += 1;
                    self.fetch_once(number)
                },
                |e: &FetchError| {
                    let retry = e.is_transient();
                    if retry {
                        debug!(block_number = number, err = %e, "Retrying block fetch");
                    }
                    retry
                },
            )
            .await;

        match result {
            Ok(block) => Ok(block),
            Err(e) if e.is_transient() => {
                warn!(block_number = number, attempts, err = %e, "Block fetch retries exhausted");
                Err(FetchError::Exhausted { attempts, last: Box::new(e) })
            }
            Err(e) => {
                warn!(block_number = number, err = %e, "Block fetch failed permanently");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedSource;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, Duration::from_millis(100), Duration::from_secs(1))
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let source = ScriptedSource::default()
            .fail(7, FetchError::Transient("connection reset".into()))
            .fail(7, FetchError::Transient("503".into()));
        let fetcher = BlockFetcher::new(source.clone(), policy(5), Duration::from_secs(10));

        let block = fetcher.fetch(7).await.unwrap();
        assert_eq!(block.number, 7);
        assert_eq!(source.calls(7), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhaustion_reports_attempts_and_last_error() {
        let source = ScriptedSource::default().always_fail(3, FetchError::Transient("429".into()));
        let fetcher = BlockFetcher::new(source.clone(), policy(4), Duration::from_secs(10));

        let err = fetcher.fetch(3).await.unwrap_err();
        assert_eq!(
            err,
            FetchError::Exhausted {
                attempts: 4,
                last: Box::new(FetchError::Transient("429".into()))
            }
        );
        assert_eq!(source.calls(3), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let source = ScriptedSource::default().always_fail(9, FetchError::Permanent("bad json".into()));
        let fetcher = BlockFetcher::new(source.clone(), policy(5), Duration::from_secs(10));

        let err = fetcher.fetch(9).await.unwrap_err();
        assert_eq!(err, FetchError::Permanent("bad json".into()));
        assert_eq!(source.calls(9), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_attempts_time_out_as_transient() {
        let source = ScriptedSource::default().delay(Duration::from_secs(30));
        let fetcher = BlockFetcher::new(source.clone(), policy(2), Duration::from_secs(1));

        let err = fetcher.fetch(1).await.unwrap_err();
        match err {
            FetchError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 2);
                assert!(last.is_transient());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_doubles_between_attempts() {
        let source = ScriptedSource::default().always_fail(1, FetchError::Transient("reset".into()));
        let fetcher = BlockFetcher::new(source, policy(4), Duration::from_secs(10));

        let started = tokio::time::Instant::now();
        let _ = fetcher.fetch(1).await;
        // 100ms + 200ms + 400ms
        assert_eq!(started.elapsed(), Duration::from_millis(700));
    }
}
