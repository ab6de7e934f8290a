use crate::auth::AuthUser;
use crate::blob::BlobStore;
use crate::catalog::Catalog;
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::{AppError, AppResult};
use crate::files::FileService;
use crate::models::{
    parse_tags, CredentialsRequest, FileSummary, HistoryResponse, LoginResponse, MessageResponse,
    RegisterResponse, SearchParams, SearchResponse, UploadResponse,
};
use crate::search::{HttpRecommender, Recommender, SearchGateway};
use crate::token::TokenService;
use axum::{
    body::{Body, Bytes},
    extract::{rejection::JsonRejection, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

const DOWNLOAD_CHUNK: usize = 64 * 1024;

pub struct AppState {
    pub tokens: TokenService,
    pub credentials: CredentialStore,
    pub files: FileService,
    pub search: SearchGateway,
    pub max_upload_bytes: usize,
}

impl AppState {
    /// Opens the catalog (running the schema migration) and the blob store,
    /// and talks to the recommender over HTTP.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let recommender = HttpRecommender::new(&config.recommender_url, config.recommender_timeout())?;
        Self::with_recommender(config, Arc::new(recommender))
    }

    pub fn with_recommender(config: &Config, recommender: Arc<dyn Recommender>) -> anyhow::Result<Self> {
        config.validate()?;

        let catalog = Arc::new(Catalog::open(&config.database)?);
        let blobs = BlobStore::new(config.storage_root.clone())?;

        Ok(Self {
            tokens: TokenService::new(&config.jwt_secret, config.token_ttl())?,
            credentials: CredentialStore::new(catalog.clone(), config.bcrypt_cost)?,
            files: FileService::new(catalog.clone(), blobs),
            search: SearchGateway::new(catalog, recommender, config.recommender_timeout()),
            max_upload_bytes: config.max_upload_bytes,
        })
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/healthz", get(health_check))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/search", get(search))
        .route("/search/history", get(search_history))
        .route("/files/upload", post(upload_file))
        .route("/files/list", get(list_files))
        .route("/files/download/:id", get(download_file))
        .route("/files/delete/:id", delete(delete_file))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn register(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    let Json(payload) = payload.map_err(json_rejection)?;
    let user_id = state
        .credentials
        .register(&payload.email, &payload.password)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered".to_string(),
            user_id,
        }),
    ))
}

async fn login(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CredentialsRequest>, JsonRejection>,
) -> AppResult<Json<LoginResponse>> {
    let Json(payload) = payload.map_err(json_rejection)?;
    let user_id = state
        .credentials
        .verify(&payload.email, &payload.password)
        .await?;
    let token = state.tokens.issue(&user_id)?;

    Ok(Json(LoginResponse { token, user_id }))
}

fn json_rejection(rejection: JsonRejection) -> AppError {
    AppError::bad_request(rejection.body_text())
}

async fn search(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Query(params): Query<SearchParams>,
) -> AppResult<Json<SearchResponse>> {
    let query = params.q.unwrap_or_default();
    let results = state.search.search(&user.user_id, &query).await?;
    Ok(Json(SearchResponse { results }))
}

async fn search_history(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<HistoryResponse>> {
    let history = state.search.history(&user.user_id).await?;
    Ok(Json(HistoryResponse { history }))
}

async fn upload_file(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    mut multipart: Multipart,
) -> AppResult<Json<UploadResponse>> {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut tags: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::bad_request(format!("Malformed multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let filename = field.file_name().unwrap_or_default().to_string();
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::bad_request(format!("Failed to read file field: {e}")))?;
                file = Some((filename, bytes.to_vec()));
            }
            "tags" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::bad_request(format!("Failed to read tags field: {e}")))?;
                tags = Some(text);
            }
            _ => {}
        }
    }

    let (Some((filename, content)), Some(tags)) = (file, tags) else {
        return Err(AppError::bad_request("Missing file or tags"));
    };

    let record = state
        .files
        .upload(&user.user_id, &filename, &content, parse_tags(&tags))
        .await?;

    Ok(Json(UploadResponse {
        message: "Upload successful".to_string(),
        file: FileSummary::from(&record),
    }))
}

async fn list_files(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<Vec<FileSummary>>> {
    Ok(Json(state.files.list(&user.user_id).await?))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(file_id): Path<String>,
) -> AppResult<Response> {
    let download = state.files.download(&user.user_id, &file_id).await?;

    let disposition = format!(
        "attachment; filename=\"{}\"",
        download.filename.replace(['"', '\\'], "_")
    );
    let disposition = HeaderValue::from_bytes(disposition.as_bytes())
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));

    let chunks = futures::stream::try_unfold(download.file, |mut file| async move {
        let mut buf = vec![0u8; DOWNLOAD_CHUNK];
        let n = file.read(&mut buf).await?;
        if n == 0 {
            return Ok::<_, std::io::Error>(None);
        }
        buf.truncate(n);
        Ok(Some((Bytes::from(buf), file)))
    });

    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, HeaderValue::from(download.size)),
        ],
        Body::from_stream(chunks),
    )
        .into_response())
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(file_id): Path<String>,
) -> AppResult<Json<MessageResponse>> {
    state.files.delete(&user.user_id, &file_id).await?;
    Ok(Json(MessageResponse {
        message: "File deleted".to_string(),
    }))
}
