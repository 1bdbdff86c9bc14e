//! Atomic file writes using a temp-and-rename strategy.

use anyhow::{Context, Result};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Atomically write `content` to `path`.
///
/// The content goes to a sibling `.tmp` file which is synced and then renamed
/// over the target, so readers see either the old or the new file and never a
/// partial write. Missing parent directories are created.
pub async fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let temp_path = path.with_extension("tmp");
    {
        let mut file = fs::File::create(&temp_path)
            .await
            .with_context(|| format!("Failed to create temp file: {}", temp_path.display()))?;
        file.write_all(content)
            .await
            .with_context(|| format!("Failed to write to temp file: {}", temp_path.display()))?;
        file.sync_all().await.with_context(|| "Failed to sync file to disk")?;
    }

    fs::rename(&temp_path, path)
        .await
        .with_context(|| format!("Failed to rename temp file to: {}", path.display()))?;
    Ok(())
}
