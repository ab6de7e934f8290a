//! Per-user file operations over the catalog and the blob store.

use crate::blob::{sanitize_filename, BlobStore};
use crate::catalog::Catalog;
use crate::error::{AppError, AppResult};
use crate::models::{FileRecord, FileSummary};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

pub struct FileService {
    catalog: Arc<Catalog>,
    blobs: BlobStore,
    /// One lock per owner. Upload and delete hold it across both the blob
    /// and the catalog step, since same-named uploads share a blob path.
    owner_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

/// An opened download: display name, blob handle and its length.
#[derive(Debug)]
pub struct Download {
    pub filename: String,
    pub file: tokio::fs::File,
    pub size: u64,
}

impl FileService {
    pub fn new(catalog: Arc<Catalog>, blobs: BlobStore) -> Self {
        Self {
            catalog,
            blobs,
            owner_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_owner(&self, owner_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .owner_locks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            // Drop entries nobody holds or waits on.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(owner_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Stores the blob, then records it. A failed blob write leaves no row.
    pub async fn upload(
        &self,
        owner_id: &str,
        filename: &str,
        content: &[u8],
        tags: Vec<String>,
    ) -> AppResult<FileRecord> {
        let filename = sanitize_filename(filename)?;

        let _guard = self.lock_owner(owner_id).await;
        let storage_path = self.blobs.write(owner_id, &filename, content).await?;

        let record = FileRecord::new(owner_id.to_string(), filename, storage_path, tags);
        if let Err(e) = self.catalog.insert_file(&record).await {
            // The blob may also back an older same-named row, so it stays put.
            tracing::error!(
                user_id = %owner_id,
                path = %record.storage_path.display(),
                "catalog insert failed after blob write; blob left unreferenced"
            );
            return Err(e.into());
        }

        tracing::info!(
            user_id = %owner_id,
            file_id = %record.id,
            filename = %record.filename,
            size = content.len(),
            "file uploaded"
        );
        Ok(record)
    }

    pub async fn list(&self, owner_id: &str) -> AppResult<Vec<FileSummary>> {
        let records = self.catalog.files_for_owner(owner_id).await?;
        Ok(records.iter().map(FileSummary::from).collect())
    }

    pub async fn download(&self, owner_id: &str, file_id: &str) -> AppResult<Download> {
        let record = self
            .catalog
            .file_for_owner(file_id, owner_id)
            .await?
            .ok_or(AppError::NotFound)?;

        let Some((file, size)) = self.blobs.open(&record.storage_path).await? else {
            tracing::warn!(
                user_id = %owner_id,
                file_id = %record.id,
                "catalog row has no backing blob"
            );
            return Err(AppError::NotFound);
        };

        Ok(Download {
            filename: record.filename,
            file,
            size,
        })
    }

    /// Removes the row; blob removal is best effort.
    pub async fn delete(&self, owner_id: &str, file_id: &str) -> AppResult<()> {
        let _guard = self.lock_owner(owner_id).await;
        let removed = self
            .catalog
            .remove_file(file_id, owner_id)
            .await?
            .ok_or(AppError::NotFound)?;

        if !removed.blob_in_use {
            if let Err(e) = self.blobs.remove(&removed.record.storage_path).await {
                tracing::warn!(
                    user_id = %owner_id,
                    file_id = %file_id,
                    error = %format!("{e:#}"),
                    "failed to remove blob after deleting record"
                );
            }
        }

        tracing::info!(user_id = %owner_id, file_id = %file_id, "file deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    struct Fixture {
        tmp: TempDir,
        files: Arc<FileService>,
        alice: String,
        bob: String,
    }

    async fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let catalog = Arc::new(Catalog::open_in_memory().unwrap());
        let alice = User::new("alice@example.com".into(), "h".into());
        let bob = User::new("bob@example.com".into(), "h".into());
        catalog.create_user(&alice).await.unwrap();
        catalog.create_user(&bob).await.unwrap();

        let blobs = BlobStore::new(tmp.path().join("users")).unwrap();
        Fixture {
            files: Arc::new(FileService::new(catalog, blobs)),
            tmp,
            alice: alice.id,
            bob: bob.id,
        }
    }

    async fn content(files: &FileService, owner: &str, id: &str) -> AppResult<Vec<u8>> {
        let mut download = files.download(owner, id).await?;
        let mut buf = Vec::new();
        download.file.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf.len() as u64, download.size);
        Ok(buf)
    }

    #[tokio::test]
    async fn upload_then_download() {
        let f = fixture().await;
        let record = f
            .files
            .upload(&f.alice, "notes.txt", b"hello", vec!["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(record.metadata.tags, vec!["a", "b"]);
        assert!(record.storage_path.ends_with("notes.txt"));

        let download = f.files.download(&f.alice, &record.id).await.unwrap();
        assert_eq!(download.filename, "notes.txt");
        assert_eq!(content(&f.files, &f.alice, &record.id).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn other_users_get_not_found() {
        let f = fixture().await;
        let record = f.files.upload(&f.alice, "a.txt", b"x", vec![]).await.unwrap();

        assert!(matches!(f.files.download(&f.bob, &record.id).await, Err(AppError::NotFound)));
        assert!(matches!(f.files.delete(&f.bob, &record.id).await, Err(AppError::NotFound)));
        assert!(matches!(f.files.download(&f.bob, "missing").await, Err(AppError::NotFound)));

        // Still intact for the owner.
        assert!(f.files.download(&f.alice, &record.id).await.is_ok());
    }

    #[tokio::test]
    async fn list_is_scoped_and_oldest_first() {
        let f = fixture().await;
        f.files.upload(&f.alice, "1.txt", b"1", vec![]).await.unwrap();
        f.files.upload(&f.bob, "b.txt", b"b", vec![]).await.unwrap();
        f.files.upload(&f.alice, "2.txt", b"2", vec![]).await.unwrap();

        let names: Vec<_> = f
            .files
            .list(&f.alice)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.filename)
            .collect();
        assert_eq!(names, vec!["1.txt", "2.txt"]);
    }

    #[tokio::test]
    async fn delete_removes_row_and_blob() {
        let f = fixture().await;
        let record = f.files.upload(&f.alice, "a.txt", b"x", vec![]).await.unwrap();

        f.files.delete(&f.alice, &record.id).await.unwrap();
        assert!(!record.storage_path.exists());
        assert!(matches!(f.files.download(&f.alice, &record.id).await, Err(AppError::NotFound)));
        assert!(matches!(f.files.delete(&f.alice, &record.id).await, Err(AppError::NotFound)));
    }

    #[tokio::test]
    async fn missing_blob_reads_as_not_found() {
        let f = fixture().await;
        let record = f.files.upload(&f.alice, "a.txt", b"x", vec![]).await.unwrap();
        std::fs::remove_file(&record.storage_path).unwrap();

        assert!(matches!(f.files.download(&f.alice, &record.id).await, Err(AppError::NotFound)));
        // Delete still succeeds; the blob was already gone.
        f.files.delete(&f.alice, &record.id).await.unwrap();
    }

    #[tokio::test]
    async fn same_name_upload_overwrites_blob() {
        let f = fixture().await;
        let first = f.files.upload(&f.alice, "a.txt", b"old", vec![]).await.unwrap();
        let second = f.files.upload(&f.alice, "a.txt", b"new", vec![]).await.unwrap();

        assert_eq!(content(&f.files, &f.alice, &first.id).await.unwrap(), b"new");

        f.files.delete(&f.alice, &first.id).await.unwrap();
        assert_eq!(content(&f.files, &f.alice, &second.id).await.unwrap(), b"new");
    }

    #[tokio::test]
    async fn bad_filename_is_rejected_before_writing() {
        let f = fixture().await;
        let err = f.files.upload(&f.alice, "..", b"x", vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert!(f.files.list(&f.alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_blob_write_leaves_no_row() {
        let f = fixture().await;
        // A regular file where the user's directory should go.
        std::fs::write(f.tmp.path().join("users").join(&f.alice), b"in the way").unwrap();

        let err = f.files.upload(&f.alice, "a.txt", b"x", vec![]).await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
        assert!(f.files.list(&f.alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn long_filename_uploads_and_downloads() {
        let f = fixture().await;
        let name = format!("{}.txt", "x".repeat(240));
        let record = f.files.upload(&f.alice, &name, b"long", vec![]).await.unwrap();

        assert_eq!(record.filename, name);
        assert_eq!(content(&f.files, &f.alice, &record.id).await.unwrap(), b"long");
    }

    #[tokio::test]
    async fn delete_waits_for_an_upload_in_flight() {
        let f = fixture().await;
        let first = f.files.upload(&f.alice, "a.txt", b"v1", vec![]).await.unwrap();

        // Stand in for an upload that has written its blob but not its row.
        let guard = f.files.lock_owner(&f.alice).await;
        let delete = {
            let files = f.files.clone();
            let (owner, id) = (f.alice.clone(), first.id.clone());
            tokio::spawn(async move { files.delete(&owner, &id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!delete.is_finished());

        // Other owners are not held up.
        f.files.upload(&f.bob, "b.txt", b"b", vec![]).await.unwrap();

        drop(guard);
        delete.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_name_upload_survives_delete() {
        let f = fixture().await;

        for round in 0..20 {
            let old = f.files.upload(&f.alice, "a.txt", b"old", vec![]).await.unwrap();

            let upload = {
                let files = f.files.clone();
                let owner = f.alice.clone();
                tokio::spawn(async move { files.upload(&owner, "a.txt", b"new", vec![]).await })
            };
            let delete = {
                let files = f.files.clone();
                let (owner, id) = (f.alice.clone(), old.id.clone());
                tokio::spawn(async move { files.delete(&owner, &id).await })
            };

            let new = upload.await.unwrap().unwrap();
            delete.await.unwrap().unwrap();

            assert_eq!(
                content(&f.files, &f.alice, &new.id).await.unwrap(),
                b"new",
                "round {round}"
            );
            f.files.delete(&f.alice, &new.id).await.unwrap();
        }
    }

    #[tokio::test]
    async fn idle_owner_locks_are_pruned() {
        let f = fixture().await;
        f.files.upload(&f.alice, "a.txt", b"x", vec![]).await.unwrap();
        f.files.upload(&f.bob, "b.txt", b"x", vec![]).await.unwrap();

        let _held = f.files.lock_owner(&f.alice).await;
        let locks = f.files.owner_locks.lock().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(locks.contains_key(&f.alice));
    }
}
