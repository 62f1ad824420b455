use std::{
    future::Future,
    io,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::FutureExt;
use tokio::signal::unix::{Signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves when the process receives SIGINT or SIGTERM.
pub struct ShutdownSignal {
    /// A future that resolves when a SIGINT signal is received.
    ctrl_c: Pin<Box<dyn Future<Output = io::Result<()>> + Send>>,
    /// A future that resolves when a SIGTERM signal is received.
    term_signal: Signal,
}

impl std::fmt::Debug for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownSignal").finish_non_exhaustive()
    }
}

impl ShutdownSignal {
    /// Install the signal handlers.
    pub fn new() -> io::Result<Self> {
        let ctrl_c = Box::pin(tokio::signal::ctrl_c());
        let term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;

        Ok(Self { ctrl_c, term_signal })
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.ctrl_c.poll_unpin(cx).is_ready() {
            debug!("Received SIGINT signal");
            return Poll::Ready(());
        }

        if this.term_signal.poll_recv(cx).is_ready() {
            debug!("Received SIGTERM signal");
            return Poll::Ready(());
        }

        Poll::Pending
    }
}

/// Drive `fut` until it completes. When `shutdown` fires first, `token` is cancelled
/// and `fut` gets `shutdown_timeout` to wind down (final flush, etc.).
///
/// Returns `None` when the timeout elapsed before `fut` completed.
pub async fn run_until_shutdown_graceful<F, O, S>(
    fut: F,
    shutdown: S,
    token: CancellationToken,
    shutdown_timeout: Duration,
) -> Option<O>
where
    F: Future<Output = O>,
    S: Future<Output = ()>,
{
    // boxed so the state machine does not live on the stack
    let mut fut = Box::pin(fut);

    tokio::select! {
        result = &mut fut => Some(result),
        _ = shutdown => {
            info!("Shutdown signal received, stopping");
            token.cancel();

            tokio::select! {
                result = &mut fut => {
                    debug!("Graceful shutdown completed");
                    Some(result)
                },
                _ = tokio::time::sleep(shutdown_timeout) => {
                    warn!(timeout_secs = shutdown_timeout.as_secs(), "Graceful shutdown timeout exceeded");
                    None
                }
            }
        }
    }
}
