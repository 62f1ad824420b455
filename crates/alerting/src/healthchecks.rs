use std::time::Duration;

use async_trait::async_trait;
use eyre::Result;
use reqwest::Client as HttpClient;
use tracing::debug;
use url::Url;

use crate::{Heartbeat, retry::retry_op};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a Healthchecks.io check.
#[derive(Debug, Clone)]
pub struct HealthchecksClient {
    http: HttpClient,
    ping_url: Url,
}

impl HealthchecksClient {
    /// Create a client for the given ping URL.
    pub fn new(ping_url: Url) -> Self {
        let http = HttpClient::builder().timeout(REQUEST_TIMEOUT).build().unwrap_or_default();
        Self { http, ping_url }
    }

    /// URL to ping: the check URL, or its `/fail` endpoint for an unhealthy run.
    pub fn url_for(&self, healthy: bool) -> String {
        let base = self.ping_url.as_str().trim_end_matches('/');
        if healthy { base.to_owned() } else { format!("{base}/fail") }
    }
}

#[async_trait]
impl Heartbeat for HealthchecksClient {
    async fn ping(&self, body: &str, healthy: bool) -> Result<()> {
        let url = self.url_for(healthy);
        retry_op(|| async {
            self.http.post(&url).body(body.to_owned()).send().await?.error_for_status()?;
            Ok::<(), eyre::Report>(())
        })
        .await?;
        debug!(healthy, "Pinged Healthchecks");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn fail_suffix_for_unhealthy_runs() {
        let client = HealthchecksClient::new(Url::parse("https://hc-ping.com/abc/").unwrap());
        assert_eq!(client.url_for(true), "https://hc-ping.com/abc");
        assert_eq!(client.url_for(false), "https://hc-ping.com/abc/fail");
    }

    #[tokio::test]
    async fn ping_posts_diagnostics() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/check")
            .match_body("Status: HEALTHY")
            .with_status(200)
            .expect(1)
            .create_async()
            .await;

        let client = HealthchecksClient::new(Url::parse(&format!("{}/check", server.url())).unwrap());
        client.ping("Status: HEALTHY", true).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unhealthy_ping_hits_fail_endpoint() {
        let mut server = Server::new_async().await;
        let mock =
            server.mock("POST", "/check/fail").with_status(200).expect(1).create_async().await;

        let client = HealthchecksClient::new(Url::parse(&format!("{}/check", server.url())).unwrap());
        client.ping("Status: UNHEALTHY", false).await.unwrap();
        mock.assert_async().await;
    }
}
