use std::time::Duration;

use alloy::{
    providers::WsConnect,
    pubsub::{ConnectionHandle, PubSubConnect},
    transports::{
        RpcError, TransportError, TransportErrorKind, TransportResult,
        http::reqwest::Url,
        layers::{RetryBackoffLayer, RetryPolicy as TransportRetryPolicy},
    },
};
use alloy_json_rpc::ErrorPayload;
use serde::Deserialize;
use tokio_retry::{Retry, RetryIf, strategy::ExponentialBackoff};
use tracing::warn;

/// The default maximum number of retries for a transport error on the bulk HTTP path.
const DEFAULT_MAX_RETRIES: u32 = 9;

/// The default initial backoff time in milliseconds for a transport error.
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 1;

/// Compute units per second budget handed to the alloy retry layer.
const DEFAULT_COMPUTE_UNITS_PER_SECOND: u64 = 100;

/// The default [`RetryBackoffLayer`] for a transport error.
pub const DEFAULT_RETRY_LAYER: RetryBackoffLayer<RateLimitConnRefusedRetryPolicy> =
    RetryBackoffLayer::new_with_policy(
        DEFAULT_MAX_RETRIES,
        DEFAULT_INITIAL_BACKOFF_MS,
        DEFAULT_COMPUTE_UNITS_PER_SECOND,
        RateLimitConnRefusedRetryPolicy,
    );

/// Bounded exponential backoff for a single network call.
///
/// `max_attempts` counts the first try, so a policy with `max_attempts = 3`
/// sleeps at most twice: `base_delay`, then `2 * base_delay`, each capped at
/// `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy. A zero `max_attempts` is treated as one.
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self { max_attempts, base_delay, max_delay }
    }

    /// Delay to wait after the `retry`-th failed attempt (0-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << retry.min(31)).min(self.max_delay)
    }

    /// Sequence of delays between attempts.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> + Clone + Send + 'static {
        let policy = *self;
        (0..self.max_attempts.saturating_sub(1)).map(move |retry| policy.delay_for(retry))
    }

    /// Run `op` until it succeeds, `condition` rejects the error, or the attempts
    /// are used up. The last error is returned on failure.
    pub async fn retry_if<F, Fut, T, E, C>(&self, op: F, condition: C) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        C: FnMut(&E) -> bool,
    {
        RetryIf::spawn(self.backoff(), op, condition).await
    }
}

/// A retry strategy trait.
pub trait Strategy: Iterator<Item = Duration> + Clone + Send + Sync + 'static {}

impl<T> Strategy for T where T: Iterator<Item = Duration> + Clone + Send + Sync + 'static {}

/// A [`WsConnect`] wrapper that keeps retrying the reconnect with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryWsConnect<S: Strategy> {
    inner: WsConnect,
    strategy: S,
}

impl RetryWsConnect<ExponentialBackoff> {
    /// Create a new `RetryWsConnect` with the [`DEFAULT_INITIAL_BACKOFF_MS`] strategy.
    #[inline]
    pub fn from_url<U: Into<Url>>(ws_url: U) -> Self {
        Self {
            inner: WsConnect::new(ws_url.into()),
            strategy: ExponentialBackoff::from_millis(DEFAULT_INITIAL_BACKOFF_MS),
        }
    }
}

impl<S: Strategy> PubSubConnect for RetryWsConnect<S> {
    fn is_local(&self) -> bool {
        self.inner.is_local()
    }

    async fn connect(&self) -> TransportResult<ConnectionHandle> {
        self.inner.connect().await
    }

    fn try_reconnect(
        &self,
    ) -> alloy::transports::impl_future!(<Output = TransportResult<ConnectionHandle>>) {
        warn!(url = ?self.inner.url(), "Reconnecting to websocket provider");
        Retry::spawn(self.strategy.clone(), || self.inner.try_reconnect())
    }
}

/// Extension trait to classify [`RpcError<TransportErrorKind, E>`].
///
/// Mirrors alloy's private helper of the same name.
pub trait RpcErrorExt {
    /// Whether the request is worth retrying.
    fn is_retryable(&self) -> bool;

    /// Backoff requested by the server, if any.
    fn backoff_hint(&self) -> Option<Duration>;
}

impl RpcErrorExt for RpcError<TransportErrorKind> {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_retry_err(),
            Self::DeserError { text, .. } => {
                if let Ok(resp) = serde_json::from_str::<ErrorPayload>(text) {
                    return resp.is_retry_err();
                }

                // some providers omit the `id` in error responses
                #[derive(Deserialize)]
                struct Resp {
                    error: ErrorPayload,
                }

                if let Ok(resp) = serde_json::from_str::<Resp>(text) {
                    return resp.error.is_retry_err();
                }

                false
            }
            Self::ErrorResp(err) => err.is_retry_err(),
            Self::NullResp => true,
            _ => false,
        }
    }

    fn backoff_hint(&self) -> Option<Duration> {
        if let Self::ErrorResp(resp) = self {
            if let Some(Ok(data)) = resp.try_data_as::<serde_json::Value>() {
                let backoff_seconds = &data["rate"]["backoff_seconds"];
                if let Some(seconds) = backoff_seconds.as_u64() {
                    return Some(Duration::from_secs(seconds));
                }
                if let Some(seconds) = backoff_seconds.as_f64() {
                    return Some(Duration::from_secs(seconds as u64 + 1));
                }
            }
        }
        None
    }
}

/// A transport retry policy that also retries on "connection refused" errors.
#[derive(Debug, Clone)]
pub struct RateLimitConnRefusedRetryPolicy;

impl TransportRetryPolicy for RateLimitConnRefusedRetryPolicy {
    fn should_retry(&self, error: &TransportError) -> bool {
        error.is_retryable() || is_connection_refused(error)
    }

    fn backoff_hint(&self, error: &TransportError) -> Option<Duration> {
        error.backoff_hint()
    }
}

/// Checks whether the error message contains "connection refused".
#[inline]
pub fn is_connection_refused<S: ToString>(e: S) -> bool {
    e.to_string().to_lowercase().contains("connection refused")
}
