use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::core::{DinghyError, DownloadErrorKind};
use crate::vcs::{Downloader, FileLocation, UrlCodec};

/// Downloader serving files inserted by the test.
///
/// URLs use the same codec as the real providers, rooted at
/// `https://vcs.test`. Files that were never inserted fail with
/// [`DownloadErrorKind::FileNotFound`].
pub struct MemoryDownloader {
    codec: UrlCodec,
    files: RwLock<HashMap<String, String>>,
    downloads: AtomicUsize,
}

impl Default for MemoryDownloader {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDownloader {
    pub fn new() -> Self {
        Self {
            codec: UrlCodec::new("https://vcs.test").expect("static base URL parses"),
            files: RwLock::new(HashMap::new()),
            downloads: AtomicUsize::new(0),
        }
    }

    /// Add or replace a file.
    pub fn insert(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
        contents: impl Into<String>,
    ) {
        let key = self.codec.encode(org, repo, path, branch);
        self.files.write().insert(key, contents.into());
    }

    pub fn remove(&self, org: &str, repo: &str, path: &str, branch: &str) {
        let key = self.codec.encode(org, repo, path, branch);
        self.files.write().remove(&key);
    }

    /// Number of `download` calls made, successful or not.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Downloader for MemoryDownloader {
    async fn download(
        &self,
        org: &str,
        repo: &str,
        path: &str,
        branch: &str,
    ) -> Result<String, DinghyError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let key = self.codec.encode(org, repo, path, branch);
        self.files
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                DinghyError::download(DownloadErrorKind::FileNotFound, key, "file not found")
            })
    }

    fn encode_url(&self, org: &str, repo: &str, path: &str, branch: &str) -> String {
        self.codec.encode(org, repo, path, branch)
    }

    fn decode_url(&self, url: &str) -> Result<FileLocation, DinghyError> {
        self.codec.decode(url)
    }
}
