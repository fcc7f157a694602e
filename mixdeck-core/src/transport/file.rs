//! Local filesystem transport

use super::Transport;
use crate::Result;
use async_trait::async_trait;
use std::path::PathBuf;

/// Reads locators as paths (an optional `file://` prefix is stripped)
#[derive(Debug, Clone, Default)]
pub struct FileTransport;

impl FileTransport {
    fn path(locator: &str) -> PathBuf {
        PathBuf::from(locator.strip_prefix("file://").unwrap_or(locator))
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn probe_size(&self, locator: &str) -> Result<Option<u64>> {
        let metadata = tokio::fs::metadata(Self::path(locator)).await?;
        Ok(metadata.is_file().then(|| metadata.len()))
    }

    async fn fetch(&self, locator: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(Self::path(locator)).await?)
    }
}
