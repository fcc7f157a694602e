//! HTTP transport using reqwest
//!
//! The size probe is a `HEAD` request; only a success status with a
//! parseable `Content-Length` yields a size.

use super::Transport;
use crate::Result;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, CONTENT_LENGTH};
use std::time::Duration;

/// Timeout applied to size probes so `auto` mode never stalls playback for long
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

/// Parse `Content-Length`, rejecting missing or malformed values
pub(crate) fn content_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn probe_size(&self, locator: &str) -> Result<Option<u64>> {
        let response = self
            .client
            .head(locator)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await?;

        if !response.status().is_success() {
            return Ok(None);
        }
        Ok(content_length(response.headers()))
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        let response = self.client.get(locator).send().await?.error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}
