use crate::blob_store::{content_type_for, ChunkedBlobStore, FileRecord};
use crate::catalog::FileCatalog;
use crate::config::{ApiConfig, StorageConfig};
use crate::error::{MediaRejection, ServiceError, StoreError};
use crate::image_server::{ImageServer, ImageStream};
use crate::reconciler::UploadReconciler;
use crate::validator::UploadValidator;
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{multipart::MultipartError, DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Multipart field carrying the upload
const UPLOAD_FIELD: &str = "file";

/// Header HTML clients use to tunnel DELETE through POST
const METHOD_OVERRIDE_HEADER: &str = "x-http-method-override";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub store: Arc<dyn ChunkedBlobStore>,
    pub catalog: FileCatalog,
    pub reconciler: UploadReconciler,
    pub images: ImageServer,
    pub validator: UploadValidator,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(store: Arc<dyn ChunkedBlobStore>, config: &StorageConfig, service_name: &str) -> Self {
        let catalog = FileCatalog::new(store.clone());

        Self {
            service_name: service_name.to_string(),
            reconciler: UploadReconciler::new(
                store.clone(),
                config.retention,
                config.reconcile_concurrency,
            ),
            images: ImageServer::new(catalog.clone(), store.clone()),
            catalog,
            store,
            validator: UploadValidator::new(),
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub err: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::UnsupportedMediaType(MediaRejection::Extension { .. }) => {
                StatusCode::UNSUPPORTED_MEDIA_TYPE
            }
            ServiceError::UnsupportedMediaType(MediaRejection::ContentType { .. }) => {
                StatusCode::NOT_FOUND
            }
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::StorageWrite(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ServiceError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ServiceError::DeleteFailed(_) => StatusCode::NOT_FOUND,
            ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }

        (status, Json(ErrorResponse { err: self.to_string() })).into_response()
    }
}

/// Files as handed to the listing template: `false` when there are none
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ListedFiles {
    Empty(bool),
    Files(Vec<FileRecord>),
}

/// View model for the listing page
#[derive(Debug, Serialize)]
pub struct ListingView {
    pub files: ListedFiles,
}

impl From<Vec<FileRecord>> for ListingView {
    fn from(files: Vec<FileRecord>) -> Self {
        let files = if files.is_empty() {
            ListedFiles::Empty(false)
        } else {
            ListedFiles::Files(files)
        };
        Self { files }
    }
}

/// Upload metadata in the shape of the multipart middleware's file object
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadedFile {
    pub fieldname: String,
    pub originalname: String,
    pub mimetype: String,
    pub id: Uuid,
    pub filename: String,
    #[serde(rename = "bucketName")]
    pub bucket_name: String,
    #[serde(rename = "chunkSize")]
    pub chunk_size: i32,
    pub size: i64,
    #[serde(rename = "uploadDate")]
    pub upload_date: DateTime<Utc>,
    #[serde(rename = "contentType")]
    pub content_type: String,
}

impl UploadedFile {
    fn new(fieldname: &str, mimetype: String, record: FileRecord) -> Self {
        Self {
            fieldname: fieldname.to_string(),
            originalname: record.filename.clone(),
            mimetype,
            id: record.id,
            filename: record.filename,
            bucket_name: record.bucket_name,
            chunk_size: record.chunk_size,
            size: record.length,
            upload_date: record.upload_date,
            content_type: record.content_type,
        }
    }
}

/// Upload response
#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub file: UploadedFile,
}

/// `_method` query parameter for method override
#[derive(Debug, Deserialize)]
pub struct MethodOverride {
    #[serde(rename = "_method")]
    pub method: Option<String>,
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let max_upload_bytes = state.max_upload_bytes;

    Router::new()
        .route("/", get(listing))
        .route("/upload", post(upload_file))
        .route("/files", get(list_files))
        .route(
            "/files/:file",
            get(get_file).delete(delete_file).post(override_file_method),
        )
        .route("/image/:filename", get(serve_image))
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(DefaultBodyLimit::max(max_upload_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "store": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "store": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Data for the listing page
async fn listing(State(state): State<AppState>) -> Result<Json<ListingView>, ServiceError> {
    let files = state.catalog.all().await?;
    Ok(Json(files.into()))
}

fn is_over_limit(err: &MultipartError) -> bool {
    err.status() == StatusCode::PAYLOAD_TOO_LARGE
}

/// Store an uploaded image, then drop everything it supersedes
#[instrument(skip(state, multipart))]
async fn upload_file(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, ServiceError> {
    let limit = state.max_upload_bytes;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        if is_over_limit(&e) {
            ServiceError::PayloadTooLarge { limit }
        } else {
            ServiceError::BadRequest(e.body_text())
        }
    })? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }

        let filename = field
            .file_name()
            .map(str::to_owned)
            .ok_or_else(|| ServiceError::BadRequest("Upload field has no filename".to_string()))?;

        // Nothing has been read from the body yet
        if let Err(rejection) = state.validator.check(&filename) {
            metrics::counter!("image_store.uploads.rejected").increment(1);
            return Err(rejection.into());
        }

        let mimetype = field
            .content_type()
            .map(str::to_owned)
            .unwrap_or_else(|| content_type_for(&filename).to_string());

        // The store only sees an io::Error, so remember whether the body limit tripped
        let over_limit = AtomicBool::new(false);
        let data = field
            .map_err(|e| {
                if is_over_limit(&e) {
                    over_limit.store(true, Ordering::Relaxed);
                }
                io::Error::new(io::ErrorKind::Other, e)
            })
            .boxed();

        let written = state.store.write(data, &filename, &mimetype).await;
        let record = match written {
            Ok(record) => record,
            Err(_) if over_limit.load(Ordering::Relaxed) => {
                metrics::counter!("image_store.uploads.rejected").increment(1);
                return Err(ServiceError::PayloadTooLarge { limit });
            }
            Err(e) => {
                metrics::counter!("image_store.uploads.failed").increment(1);
                return Err(e.into());
            }
        };

        info!(
            file_id = %record.id,
            filename = %record.filename,
            content_type = %record.content_type,
            size_bytes = record.length,
            "File uploaded"
        );
        metrics::counter!("image_store.uploads.accepted").increment(1);
        metrics::counter!("image_store.bytes.uploaded").increment(record.length as u64);

        // Never fails the upload
        if let Err(e) = state.reconciler.reconcile(&record).await {
            warn!(error = %e, file_id = %record.id, "Reconciliation could not list files");
        }

        return Ok(Json(UploadResponse {
            file: UploadedFile::new(UPLOAD_FIELD, mimetype, record),
        }));
    }

    Err(ServiceError::BadRequest(format!(
        "Missing multipart field `{UPLOAD_FIELD}`"
    )))
}

/// All records as JSON
async fn list_files(State(state): State<AppState>) -> Result<Json<Vec<FileRecord>>, ServiceError> {
    let files = state.catalog.all().await?;

    if files.is_empty() {
        return Err(ServiceError::NotFound);
    }

    Ok(Json(files))
}

/// One record as JSON
async fn get_file(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Json<FileRecord>, ServiceError> {
    let file = state.catalog.by_filename(&filename).await?;
    Ok(Json(file))
}

/// Stream an image's bytes
async fn serve_image(
    State(state): State<AppState>,
    Path(filename): Path<String>,
) -> Result<Response, ServiceError> {
    let ImageStream { record, body } = state.images.serve(&filename).await?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, record.content_type)
        .header(header::CONTENT_LENGTH, record.length.to_string())
        .body(Body::from_stream(body))
        .map_err(|e| ServiceError::Internal(e.to_string()))
}

/// Delete a record by id
async fn delete_file(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ServiceError> {
    remove_by_id(&state, &id).await
}

/// POST standing in for DELETE
async fn override_file_method(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<MethodOverride>,
    headers: HeaderMap,
) -> Result<Response, ServiceError> {
    let requested = headers
        .get(METHOD_OVERRIDE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .or(params.method);

    match requested {
        Some(method) if method.eq_ignore_ascii_case("DELETE") => remove_by_id(&state, &id).await,
        _ => Ok(StatusCode::METHOD_NOT_ALLOWED.into_response()),
    }
}

#[instrument(skip(state))]
async fn remove_by_id(state: &AppState, raw_id: &str) -> Result<Response, ServiceError> {
    let id = Uuid::parse_str(raw_id)
        .map_err(|e| ServiceError::DeleteFailed(format!("Invalid file id {raw_id}: {e}")))?;

    match state.catalog.by_id(id).await {
        Ok(record) => {
            match state.store.remove(id).await {
                // Lost a race with another delete or a reconciliation
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(ServiceError::DeleteFailed(e.to_string())),
            }

            info!(file_id = %id, filename = %record.filename, "File deleted");
            metrics::counter!("image_store.files.deleted").increment(1);
        }
        Err(ServiceError::NotFound) => {
            debug!(file_id = %id, "Nothing to delete");
        }
        Err(e) => return Err(ServiceError::DeleteFailed(e.to_string())),
    }

    Ok((StatusCode::FOUND, [(header::LOCATION, "/")]).into_response())
}

/// Start the API server
pub async fn start_api_server(state: AppState, config: &ApiConfig) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting image store API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
