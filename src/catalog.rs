//! Relational catalog: users, file records and the search audit log,
//! kept in a single SQLite database.

use crate::models::{FileMetadata, FileRecord, SearchHistoryEntry, User};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, types::Type, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            TEXT PRIMARY KEY,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    created_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS files (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    id          TEXT NOT NULL UNIQUE,
    user_id     TEXT NOT NULL REFERENCES users(id),
    filename    TEXT NOT NULL,
    filepath    TEXT NOT NULL,
    metadata    TEXT NOT NULL,
    uploaded_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_user ON files(user_id, seq);
CREATE INDEX IF NOT EXISTS idx_files_path ON files(filepath);

CREATE TABLE IF NOT EXISTS search_history (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    id        TEXT NOT NULL UNIQUE,
    user_id   TEXT NOT NULL REFERENCES users(id),
    query     TEXT NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_search_user ON search_history(user_id, seq);
";

const FILE_COLUMNS: &str = "id, user_id, filename, filepath, metadata, uploaded_at";

/// Outcome of removing a file row.
#[derive(Debug)]
pub struct RemovedFile {
    pub record: FileRecord,
    /// Another row still points at the same blob path.
    pub blob_in_use: bool,
}

/// Thread-safe handle to the catalog. Statements run on the blocking pool
/// under one connection lock, which serializes writers.
pub struct Catalog {
    conn: Arc<Mutex<Connection>>,
}

impl Catalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create catalog directory: {}", parent.display())
            })?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open catalog: {}", path.display()))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .context("Failed to enable WAL journal")?;

        let catalog = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "catalog opened");
        Ok(catalog)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory catalog")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", true)
            .context("Failed to enable foreign keys")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking thread pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("catalog connection lock poisoned"))?;
            f(&mut conn)
        })
        .await
        .context("Catalog task join error")?
    }

    /// Inserts the user unless the email is taken. Returns `false` on conflict.
    pub async fn create_user(&self, user: &User) -> Result<bool> {
        let user = user.clone();
        self.with_conn(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT INTO users (id, email, password_hash, created_at)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(email) DO NOTHING",
                    params![
                        user.id,
                        user.email,
                        user.password_hash,
                        user.created_at.to_rfc3339()
                    ],
                )
                .context("Failed to insert user")?;
            Ok(inserted == 1)
        })
        .await
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>> {
        let email = email.to_owned();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, email, password_hash, created_at FROM users WHERE email = ?1",
                params![email],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        password_hash: row.get(2)?,
                        created_at: timestamp(row, 3)?,
                    })
                },
            )
            .optional()
            .context("Failed to query user")
        })
        .await
    }

    pub async fn insert_file(&self, record: &FileRecord) -> Result<()> {
        let metadata =
            serde_json::to_string(&record.metadata).context("Failed to serialize metadata")?;
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO files (id, user_id, filename, filepath, metadata, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id,
                    record.owner_id,
                    record.filename,
                    record.storage_path.to_string_lossy(),
                    metadata,
                    record.uploaded_at.to_rfc3339()
                ],
            )
            .context("Failed to insert file record")?;
            Ok(())
        })
        .await
    }

    /// Files owned by `owner_id`, oldest first.
    pub async fn files_for_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>> {
        let owner_id = owner_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {FILE_COLUMNS} FROM files WHERE user_id = ?1 ORDER BY seq ASC"
                ))
                .context("Failed to prepare file listing")?;

            let rows = stmt
                .query_map(params![owner_id], file_from_row)
                .context("Failed to list files")?;

            let mut files = Vec::new();
            for row in rows {
                files.push(row.context("Failed to read file row")?);
            }
            Ok(files)
        })
        .await
    }

    /// Looks up a file by id, matching only when `owner_id` owns it.
    pub async fn file_for_owner(&self, file_id: &str, owner_id: &str) -> Result<Option<FileRecord>> {
        let (file_id, owner_id) = (file_id.to_owned(), owner_id.to_owned());
        self.with_conn(move |conn| {
            conn.query_row(
                &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1 AND user_id = ?2"),
                params![file_id, owner_id],
                file_from_row,
            )
            .optional()
            .context("Failed to query file")
        })
        .await
    }

    /// Deletes the owner's row and reports whether its blob is still referenced.
    pub async fn remove_file(&self, file_id: &str, owner_id: &str) -> Result<Option<RemovedFile>> {
        let (file_id, owner_id) = (file_id.to_owned(), owner_id.to_owned());
        self.with_conn(move |conn| {
            let tx = conn.transaction().context("Failed to begin transaction")?;

            let record = tx
                .query_row(
                    &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1 AND user_id = ?2"),
                    params![file_id, owner_id],
                    file_from_row,
                )
                .optional()
                .context("Failed to query file")?;

            let Some(record) = record else {
                return Ok(None);
            };

            tx.execute("DELETE FROM files WHERE id = ?1", params![record.id])
                .context("Failed to delete file record")?;

            let remaining: i64 = tx
                .query_row(
                    "SELECT COUNT(*) FROM files WHERE filepath = ?1",
                    params![record.storage_path.to_string_lossy()],
                    |row| row.get(0),
                )
                .context("Failed to count blob references")?;

            tx.commit().context("Failed to commit delete")?;

            Ok(Some(RemovedFile {
                record,
                blob_in_use: remaining > 0,
            }))
        })
        .await
    }

    pub async fn append_search(&self, entry: &SearchHistoryEntry) -> Result<()> {
        let entry = entry.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO search_history (id, user_id, query, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![
                    entry.id,
                    entry.user_id,
                    entry.query,
                    entry.timestamp.to_rfc3339()
                ],
            )
            .context("Failed to append search history")?;
            Ok(())
        })
        .await
    }

    /// Search history for `user_id`, newest first.
    pub async fn search_history(&self, user_id: &str) -> Result<Vec<SearchHistoryEntry>> {
        let user_id = user_id.to_owned();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, user_id, query, timestamp FROM search_history
                     WHERE user_id = ?1 ORDER BY seq DESC",
                )
                .context("Failed to prepare history query")?;

            let rows = stmt
                .query_map(params![user_id], |row| {
                    Ok(SearchHistoryEntry {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        query: row.get(2)?,
                        timestamp: timestamp(row, 3)?,
                    })
                })
                .context("Failed to query history")?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.context("Failed to read history row")?);
            }
            Ok(entries)
        })
        .await
    }
}

/// Creates the schema. Safe to run against an existing database.
fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(SCHEMA)
        .context("Failed to initialize catalog schema")
}

fn timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn file_from_row(row: &Row<'_>) -> rusqlite::Result<FileRecord> {
    let path: String = row.get(3)?;
    let metadata: String = row.get(4)?;
    let metadata: FileMetadata = serde_json::from_str(&metadata)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(FileRecord {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        filename: row.get(2)?,
        storage_path: PathBuf::from(path),
        metadata,
        uploaded_at: timestamp(row, 5)?,
    })
}
