//! Filesystem blob area, one directory per user.

use crate::error::{AppError, AppResult};
use anyhow::{Context, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage root: {}", root.display()))?;
        tracing::info!(root = %root.display(), "blob store ready");
        Ok(Self { root })
    }

    pub fn user_dir(&self, user_id: &str) -> PathBuf {
        self.root.join(user_id)
    }

    /// Writes `content` as `filename` in the user's directory, replacing any
    /// existing blob of the same name. Returns the blob path.
    pub async fn write(&self, user_id: &str, filename: &str, content: &[u8]) -> Result<PathBuf> {
        let dir = self.user_dir(user_id);
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create user directory: {}", dir.display()))?;

        let target = dir.join(filename);
        // Fixed-length staging name so any name that fits as a target also fits here.
        let staging = dir.join(format!(".{}.part", Uuid::new_v4()));

        fs::write(&staging, content)
            .await
            .with_context(|| format!("Failed to write blob: {}", staging.display()))?;

        if let Err(e) = fs::rename(&staging, &target).await {
            let _ = fs::remove_file(&staging).await;
            return Err(e).with_context(|| format!("Failed to move blob into place: {}", target.display()));
        }

        Ok(target)
    }

    /// Opens a blob for streaming along with its length. `None` when it no
    /// longer exists.
    pub async fn open(&self, path: &Path) -> Result<Option<(fs::File, u64)>> {
        let file = match fs::File::open(path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("Failed to open blob: {}", path.display())),
        };
        let len = file
            .metadata()
            .await
            .with_context(|| format!("Failed to stat blob: {}", path.display()))?
            .len();
        Ok(Some((file, len)))
    }

    pub async fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)
            .await
            .with_context(|| format!("Failed to remove blob: {}", path.display()))
    }
}

/// Reduces a client-supplied name to a single safe path component.
pub fn sanitize_filename(raw: &str) -> AppResult<String> {
    let name = raw
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    if name.is_empty() || name == "." || name == ".." || name.contains('\0') {
        return Err(AppError::bad_request("A valid filename is required"));
    }
    Ok(name.to_string())
}
