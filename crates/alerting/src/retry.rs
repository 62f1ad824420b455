use std::time::Duration;

use eyre::Report;
use primitives::retries::RetryPolicy;
use reqwest::{Error as ReqwestError, StatusCode};

/// Retry policy for calls to notification services.
const HTTP_RETRY_POLICY: RetryPolicy =
    RetryPolicy::new(4, Duration::from_millis(50), Duration::from_secs(2));

/// Determine if an error returned by reqwest/eyre is retryable.
fn is_retryable(err: &Report) -> bool {
    if let Some(req_err) = err.downcast_ref::<ReqwestError>() {
        if req_err.is_timeout() || req_err.is_connect() {
            return true;
        }
        if let Some(status) = req_err.status() {
            return status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
        }
    }
    false
}

/// Retry the provided async operation with exponential backoff if the returned
/// error is considered retryable.
pub(crate) async fn retry_op<F, Fut, T>(op: F) -> eyre::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = eyre::Result<T>>,
{
    HTTP_RETRY_POLICY.retry_if(op, is_retryable).await
}
