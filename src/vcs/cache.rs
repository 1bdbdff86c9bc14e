//! Per-webhook download cache.
//!
//! A dinghyfile that calls the same module several times, or several
//! dinghyfiles in one push sharing modules, would otherwise download the same
//! file repeatedly. The cache wraps any [`Downloader`] and lives as long as
//! the webhook that created it, so a later push always sees fresh content.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use super::{Downloader, FileLocation};
use crate::core::DinghyError;

/// Memoizes successful downloads keyed by encoded URL.
pub struct CachingDownloader {
    inner: Arc<dyn Downloader>,
    entries: DashMap<String, String>,
}

impl CachingDownloader {
    pub fn new(inner: Arc<dyn Downloader>) -> Self {
        Self {
            inner,
            entries: DashMap::new(),
        }
    }

    /// Number of cached files.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl Downloader for CachingDownloader {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        let key = self.inner.encode_url(org, repo, path, branch);
        if let Some(hit) = self.entries.get(&key) {
            tracing::debug!("download cache hit: {}", key);
            return Ok(hit.value().clone());
        }
        let contents = self.inner.download(org, repo, path, branch).await?;
        self.entries.insert(key, contents.clone());
        Ok(contents)
    }

    fn encode_url(&self, org: &str, repo: &str, path: &str, branch: &str) -> String {
        self.inner.encode_url(org, repo, path, branch)
    }

    fn decode_url(&self, url: &str) -> Result<FileLocation, DinghyError> {
        self.inner.decode_url(url)
    }
}

/// Serves files from an in-memory overlay before falling back to `inner`.
///
/// Used to render a dinghyfile body that was never committed, such as the
/// body of a manual render request or a local file passed to the CLI.
pub struct OverlayDownloader {
    inner: Arc<dyn Downloader>,
    overlay: DashMap<String, String>,
}

impl OverlayDownloader {
    pub fn new(inner: Arc<dyn Downloader>) -> Self {
        Self {
            inner,
            overlay: DashMap::new(),
        }
    }

    /// Serve `contents` for the given location.
    pub fn insert(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
        contents: impl Into<String>,
    ) {
        self.overlay.insert(self.inner.encode_url(org, repo, path, branch), contents.into());
    }
}

#[async_trait]
impl Downloader for OverlayDownloader {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        let key = self.inner.encode_url(org, repo, path, branch);
        if let Some(contents) = self.overlay.get(&key) {
            return Ok(contents.value().clone());
        }
        self.inner.download(org, repo, path, branch).await
    }

    fn encode_url(&self, org: &str, repo: &str, path: &str, branch: &str) -> String {
        self.inner.encode_url(org, repo, path, branch)
    }

    fn decode_url(&self, url: &str) -> Result<FileLocation, DinghyError> {
        self.inner.decode_url(url)
    }
}
