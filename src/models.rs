use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: String, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email,
            password_hash,
            created_at: Utc::now(),
        }
    }
}

/// Stored as JSON in the `metadata` column of the files table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: String,
    pub owner_id: String,
    pub filename: String,
    pub storage_path: PathBuf,
    pub metadata: FileMetadata,
    pub uploaded_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(owner_id: String, filename: String, storage_path: PathBuf, tags: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            owner_id,
            filename,
            storage_path,
            metadata: FileMetadata { tags },
            uploaded_at: Utc::now(),
        }
    }
}

/// Client-facing view of a [`FileRecord`]; never exposes the storage path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSummary {
    pub id: String,
    pub filename: String,
    pub tags: Vec<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<&FileRecord> for FileSummary {
    fn from(record: &FileRecord) -> Self {
        Self {
            id: record.id.clone(),
            filename: record.filename.clone(),
            tags: record.metadata.tags.clone(),
            uploaded_at: record.uploaded_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHistoryEntry {
    pub id: String,
    pub user_id: String,
    pub query: String,
    pub timestamp: DateTime<Utc>,
}

impl SearchHistoryEntry {
    pub fn new(user_id: String, query: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            user_id,
            query,
            timestamp: Utc::now(),
        }
    }
}

// Request / response payloads

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub message: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub file: FileSummary,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    pub q: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<SearchHistoryEntry>,
}

/// Splits a comma-separated tag field, trimming each tag and dropping empties.
pub fn parse_tags(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags_trims_and_keeps_order() {
        assert_eq!(parse_tags(" b , a,,c "), vec!["b", "a", "c"]);
        assert!(parse_tags(" , ").is_empty());
    }

    #[test]
    fn summary_hides_storage_path() {
        let record = FileRecord::new(
            "u1".into(),
            "notes.txt".into(),
            PathBuf::from("/srv/u1/notes.txt"),
            vec!["a".into()],
        );
        let json = serde_json::to_value(FileSummary::from(&record)).unwrap();
        assert_eq!(json["filename"], "notes.txt");
        assert_eq!(json["tags"][0], "a");
        assert!(json.get("storagePath").is_none());
        assert!(json.get("uploadedAt").is_some());
    }
}
