//! Media library persistence
//!
//! Finished recordings can be handed to a user-facing library once the
//! container is finalized. The library is an opaque collaborator, so its
//! errors are carried as `anyhow::Error` and mapped to
//! `ExternalPersistence` by the recorder.

use anyhow::{bail, Context};
use async_trait::async_trait;
use chrono::Utc;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Destination for finished recordings
#[async_trait]
pub trait MediaLibrary: Send + Sync {
    /// Persist the video at `path`, returning where the library stored it
    async fn save_video(&self, path: &Path) -> anyhow::Result<PathBuf>;
}

/// Library backed by a plain directory (e.g. the user's Movies folder)
#[derive(Debug, Clone)]
pub struct DirectoryLibrary {
    root: PathBuf,
}

impl DirectoryLibrary {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File name used for a recording saved now
    pub fn file_name_for(source: &Path) -> String {
        let extension = source
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("mp4");
        let id = Uuid::new_v4().simple().to_string();
        format!(
            "Screen Recording {} {}.{}",
            Utc::now().format("%Y-%m-%d at %H.%M.%S"),
            &id[..8],
            extension
        )
    }
}

#[async_trait]
impl MediaLibrary for DirectoryLibrary {
    async fn save_video(&self, path: &Path) -> anyhow::Result<PathBuf> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            bail!("Recording not found: {:?}", path);
        }

        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("Failed to create library directory {:?}", self.root))?;

        let destination = self.root.join(Self::file_name_for(path));
        tokio::fs::copy(path, &destination)
            .await
            .with_context(|| format!("Failed to copy {:?} to {:?}", path, destination))?;

        tracing::info!("Saved recording to library: {:?}", destination);
        Ok(destination)
    }
}
