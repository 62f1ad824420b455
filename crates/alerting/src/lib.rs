//! Outbound alerting: push notifications and the dead-man's switch.
#![allow(clippy::uninlined_format_args)]

/// Healthchecks.io client
pub mod healthchecks;
/// Notification model and message limits
pub mod notification;
/// Pushover client
pub mod pushover;
/// Retry helpers for HTTP operations
pub mod retry;

pub use healthchecks::HealthchecksClient;
pub use notification::{Notification, Priority};
pub use pushover::PushoverClient;

use std::sync::Arc;

use async_trait::async_trait;
use eyre::Result;
use tracing::{error, info, warn};
use url::Url;

/// Pushover notifier when credentials are given, log output otherwise.
pub fn notifier_from(api_url: Url, credentials: Option<(&str, &str)>) -> Arc<dyn Notifier> {
    match credentials {
        Some((token, user)) => {
            info!(%api_url, "Sending notifications through Pushover");
            Arc::new(PushoverClient::new(api_url, token.to_owned(), user.to_owned()))
        }
        None => {
            warn!("Pushover not configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    }
}

/// Healthchecks heartbeat when a ping URL is given, no-op otherwise.
pub fn heartbeat_from(ping_url: Option<Url>) -> Arc<dyn Heartbeat> {
    match ping_url {
        Some(url) => Arc::new(HealthchecksClient::new(url)),
        None => {
            info!("Healthchecks not configured, skipping heartbeat");
            Arc::new(NoHeartbeat)
        }
    }
}

/// Sink for operator notifications
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Deliver a notification. Long messages are truncated, never rejected.
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Dead-man's switch pinged once per healthy or unhealthy run
#[async_trait]
pub trait Heartbeat: Send + Sync {
    /// Report a run, attaching `body` as diagnostics.
    async fn ping(&self, body: &str, healthy: bool) -> Result<()>;
}

/// Notifier used when no push service is configured: notifications end up in the logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.priority {
            Priority::Emergency => error!(
                title = %notification.title,
                message = %notification.message,
                "Emergency notification (push service not configured)"
            ),
            Priority::Normal => info!(
                title = %notification.title,
                message = %notification.message,
                "Notification (push service not configured)"
            ),
        }
        Ok(())
    }
}

/// Heartbeat used when no ping URL is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHeartbeat;

#[async_trait]
impl Heartbeat for NoHeartbeat {
    async fn ping(&self, _body: &str, healthy: bool) -> Result<()> {
        if !healthy {
            warn!("Unhealthy run not reported: heartbeat URL not configured");
        }
        Ok(())
    }
}
