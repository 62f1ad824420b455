use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use reqwest::Client as HttpClient;
use serde::Serialize;
use tracing::info;
use url::Url;
use uuid::Uuid;

use crate::{Notification, Notifier, Priority, retry::retry_op};

/// Seconds between repeats of an unacknowledged emergency notification
const EMERGENCY_RETRY_SECS: u32 = 60;
/// Seconds after which an unacknowledged emergency notification stops repeating
const EMERGENCY_EXPIRE_SECS: u32 = 3600;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Form body of `POST /1/messages.json`
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct PushoverMessage {
    token: String,
    user: String,
    title: String,
    message: String,
    priority: i8,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire: Option<u32>,
}

/// Client for the Pushover messages API.
#[derive(Debug, Clone)]
pub struct PushoverClient {
    http: HttpClient,
    base_url: Url,
    token: String,
    user: String,
}

impl PushoverClient {
    /// Create a new Pushover client.
    pub fn new(base_url: Url, token: String, user: String) -> Self {
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default();
        Self { http, base_url, token, user }
    }

    /// Build the request body for `notification`, tagged with `trace_id`.
    pub fn message(&self, notification: &Notification, trace_id: Uuid) -> PushoverMessage {
        let (title, message) = notification.render(trace_id);
        let emergency = notification.priority == Priority::Emergency;
        PushoverMessage {
            token: self.token.clone(),
            user: self.user.clone(),
            title,
            message,
            priority: notification.priority.as_pushover(),
            retry: emergency.then_some(EMERGENCY_RETRY_SECS),
            expire: emergency.then_some(EMERGENCY_EXPIRE_SECS),
        }
    }
}

#[async_trait]
impl Notifier for PushoverClient {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let trace_id = Uuid::new_v4();
        let body = self.message(notification, trace_id);
        let url = self.base_url.join("1/messages.json")?;

        retry_op(|| async {
            self.http.post(url.clone()).form(&body).send().await?.error_for_status()?;
            Ok::<(), eyre::Report>(())
        })
        .await?;

        info!(title = %notification.title, priority = body.priority, %trace_id, "Sent Pushover notification");
        Ok(())
    }
}
