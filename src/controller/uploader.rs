//! Final-recording upload.
//!
//! Object storage itself is an external collaborator; the supervisor only
//! depends on the [`Uploader`] trait. The built-in implementation moves the
//! temp file into a configured storage root (a mounted bucket in
//! production, a temp dir in tests). Upload runs on a blocking worker and
//! `wait_for_upload` joins it, mirroring the upload-then-delete sequence in
//! cleanup.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};

pub trait Uploader: Send + Sync {
    /// Begin uploading `file_path` under `key`. Non-blocking.
    fn upload_file(&self, file_path: &Path, key: &str);

    /// Suspend until the in-flight upload finishes; returns its outcome.
    fn wait_for_upload(&self) -> Result<String>;

    /// Remove the local temp copy.
    fn delete_file(&self, file_path: &Path) {
        if file_path.exists() {
            if let Err(e) = std::fs::remove_file(file_path) {
                tracing::warn!("failed to delete local recording: {e}");
            }
        }
    }
}

/// Copies the finished recording into the storage root.
pub struct FileUploader {
    storage_root: PathBuf,
    handle: Mutex<Option<std::thread::JoinHandle<Result<String>>>>,
}

impl FileUploader {
    pub fn new(storage_root: PathBuf) -> Self {
        Self {
            storage_root,
            handle: Mutex::new(None),
        }
    }
}

impl Uploader for FileUploader {
    fn upload_file(&self, file_path: &Path, key: &str) {
        let source = file_path.to_path_buf();
        let destination = self.storage_root.join(key);
        let key = key.to_string();

        let handle = std::thread::spawn(move || -> Result<String> {
            if !source.exists() {
                anyhow::bail!("recording file not found: {}", source.display());
            }
            if let Some(parent) = destination.parent() {
                std::fs::create_dir_all(parent).context("failed to create storage directory")?;
            }
            std::fs::copy(&source, &destination).with_context(|| {
                format!(
                    "failed to store {} at {}",
                    source.display(),
                    destination.display()
                )
            })?;
            tracing::info!(%key, "recording stored");
            Ok(key)
        });
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    fn wait_for_upload(&self) -> Result<String> {
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("no upload in flight")?;
        handle
            .join()
            .map_err(|_| anyhow::anyhow!("upload worker panicked"))?
    }
}
