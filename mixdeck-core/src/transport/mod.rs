//! Audio data transports
//!
//! A transport answers two questions about a locator: how big is it (a cheap
//! probe, used by `auto` load mode) and what are its bytes (a full fetch,
//! used by `full` load mode). `DefaultTransport` routes `http(s)://`
//! locators to HTTP and everything else to the local filesystem.

pub mod file;
pub mod http;

use crate::Result;
use async_trait::async_trait;

pub use file::FileTransport;
pub use http::HttpTransport;

/// Network/file access used by load-mode resolution and the decoded-audio cache
#[async_trait]
pub trait Transport: Send + Sync {
    /// Size of the resource in bytes
    ///
    /// `Ok(None)` means the transport answered but could not report a size
    /// (unsupported response, missing or unparseable length).
    async fn probe_size(&self, locator: &str) -> Result<Option<u64>>;

    /// Complete resource contents
    async fn fetch(&self, locator: &str) -> Result<Vec<u8>>;
}

/// Scheme-dispatching transport
#[derive(Debug, Clone, Default)]
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn route(&self, locator: &str) -> &dyn Transport {
        if is_http(locator) {
            &self.http
        } else {
            &self.file
        }
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn probe_size(&self, locator: &str) -> Result<Option<u64>> {
        self.route(locator).probe_size(locator).await
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        self.route(locator).fetch(locator).await
    }
}

pub(crate) fn is_http(locator: &str) -> bool {
    let lower = locator.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
