use crate::api::error::AppError;
use crate::services::catalog::FileRecord;
use crate::services::reassembler::{ChunkMetadata, ChunkOutcome};
use crate::services::session::SessionSummary;
use crate::utils::auth::Claims;
use axum::{
    Extension, Json,
    body::Body,
    extract::{Multipart, Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;

/// Characters left as-is inside one URL path segment
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FileResponse {
    pub id: i32,
    pub file_name: String,
    pub size: i64,
    pub mime_type: String,
    pub sha256: String,
    /// Public link, `BASE_URL/uploads/<storage path>`
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl FileResponse {
    pub fn from_record(record: FileRecord, base_url: &str) -> Self {
        let encoded = record
            .storage_path
            .split('/')
            .map(|segment| utf8_percent_encode(segment, PATH_SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/");
        Self {
            id: record.id,
            path: format!("{}/uploads/{}", base_url.trim_end_matches('/'), encoded),
            file_name: record.filename,
            size: record.size,
            mime_type: record.mime_type,
            sha256: record.sha256,
            created_at: record.created_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkUploadResponse {
    /// `accepted` while chunks are outstanding, `completed` once committed
    pub status: String,
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_chunks: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<FileResponse>,
}

/// Multipart form for one chunk. Documentation only.
#[allow(dead_code)]
#[derive(ToSchema)]
pub struct ChunkUploadForm {
    /// JSON encoded [`ChunkMetadata`]
    pub metadata: String,
    #[schema(value_type = String, format = Binary)]
    pub file: Vec<u8>,
}

#[utoipa::path(
    post,
    path = "/api/file/upload-chunk",
    request_body(content = ChunkUploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 201, description = "Chunk stored, or upload completed by this chunk", body = ChunkUploadResponse),
        (status = 200, description = "Upload was already completed", body = ChunkUploadResponse),
        (status = 400, description = "Invalid metadata or payload"),
        (status = 401, description = "Unauthorized"),
        (status = 409, description = "Rejected by virus scan"),
        (status = 415, description = "Content type not allowed"),
        (status = 422, description = "Checksum mismatch, retry the chunk")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn upload_chunk(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let max_chunk = state.config.max_chunk_size as usize;
    let mut metadata: Option<ChunkMetadata> = None;
    let mut payload: Option<BytesMut> = None;

    while let Some(mut field) = multipart.next_field().await.map_err(|e| {
        tracing::warn!("Multipart error: {}", e);
        AppError::BadRequest(format!("Malformed multipart body: {}", e))
    })? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "metadata" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Unreadable metadata: {}", e)))?;
                let parsed = serde_json::from_str::<ChunkMetadata>(&text)
                    .map_err(|e| AppError::BadRequest(format!("Invalid metadata: {}", e)))?;
                metadata = Some(parsed);
            }
            "file" => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = field
                    .chunk()
                    .await
                    .map_err(|e| AppError::BadRequest(format!("Unreadable chunk: {}", e)))?
                {
                    if buffer.len() + chunk.len() > max_chunk {
                        return Err(AppError::BadRequest(format!(
                            "Chunk exceeds the {} byte limit",
                            max_chunk
                        )));
                    }
                    buffer.extend_from_slice(&chunk);
                }
                payload = Some(buffer);
            }
            other => {
                tracing::debug!("Ignoring unexpected multipart field '{}'", other);
            }
        }
    }

    let metadata =
        metadata.ok_or_else(|| AppError::BadRequest("Missing 'metadata' field".to_string()))?;
    let payload = payload.ok_or_else(|| AppError::BadRequest("Missing 'file' field".to_string()))?;

    let file_id = metadata.file_id.clone();
    let outcome = state
        .reassembler
        .accept_chunk(&claims.sub, metadata, payload.freeze())
        .await?;

    let base_url = &state.config.base_url;
    let (status, body) = match outcome {
        ChunkOutcome::Accepted { progress, .. } => (
            StatusCode::CREATED,
            ChunkUploadResponse {
                status: "accepted".to_string(),
                file_id,
                received_chunks: Some(progress.received_chunks),
                received_bytes: Some(progress.received_bytes),
                file: None,
            },
        ),
        ChunkOutcome::Completed(record) => (
            StatusCode::CREATED,
            completed(file_id, record, base_url),
        ),
        ChunkOutcome::AlreadyCompleted(record) => {
            (StatusCode::OK, completed(file_id, record, base_url))
        }
    };

    Ok((status, Json(body)).into_response())
}

fn completed(file_id: String, record: FileRecord, base_url: &str) -> ChunkUploadResponse {
    ChunkUploadResponse {
        status: "completed".to_string(),
        file_id,
        received_chunks: None,
        received_bytes: None,
        file: Some(FileResponse::from_record(record, base_url)),
    }
}

#[utoipa::path(
    get,
    path = "/api/file",
    responses(
        (status = 200, description = "Files owned by the caller", body = Vec<FileResponse>),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn list_files(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<Json<Vec<FileResponse>>, AppError> {
    let records = state.reassembler.catalog().list_by_owner(&claims.sub).await?;
    let base_url = &state.config.base_url;
    Ok(Json(
        records
            .into_iter()
            .map(|r| FileResponse::from_record(r, base_url))
            .collect(),
    ))
}

#[utoipa::path(
    get,
    path = "/api/file/metadata/{id}",
    params(
        ("id" = i32, Path, description = "File ID")
    ),
    responses(
        (status = 200, description = "File metadata", body = FileResponse),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "File not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn get_file_metadata(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i32>,
) -> Result<Json<FileResponse>, AppError> {
    let record = state.reassembler.catalog().get_owned(id, &claims.sub).await?;
    Ok(Json(FileResponse::from_record(record, &state.config.base_url)))
}

#[utoipa::path(
    get,
    path = "/api/file/download/{id}",
    params(
        ("id" = i32, Path, description = "File ID")
    ),
    responses(
        (status = 200, description = "File download stream"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "File not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn download_file(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i32>,
) -> Result<Response, AppError> {
    let catalog = state.reassembler.catalog();
    let record = catalog.get_owned(id, &claims.sub).await?;
    let path = catalog.artifacts().resolve(&record.storage_path)?;

    let file = match tokio::fs::File::open(&path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!("Artifact for file {} is missing at {}", id, path.display());
            return Err(AppError::NotFound("File content not found".to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    let length = file.metadata().await?.len();

    tracing::info!("📥 Download file_id={} user={}", id, claims.sub);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, mime::APPLICATION_OCTET_STREAM.as_ref())
        .header(header::CONTENT_LENGTH, length)
        .header(
            header::CONTENT_DISPOSITION,
            attachment_disposition(&record.filename),
        )
        .body(Body::from_stream(ReaderStream::new(file)))
        .map_err(|e| AppError::Internal(e.to_string()))
}

/// `attachment` with an ASCII fallback plus the RFC 5987 UTF-8 name.
pub(crate) fn attachment_disposition(filename: &str) -> String {
    let ascii_filename = filename
        .chars()
        .filter(|c| c.is_ascii() && !c.is_control() && *c != '"' && *c != '\\' && *c != ';')
        .take(64)
        .collect::<String>();
    let fallback_filename = if ascii_filename.is_empty() {
        "file"
    } else {
        &ascii_filename
    };

    let encoded_filename = utf8_percent_encode(filename, NON_ALPHANUMERIC).to_string();

    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback_filename, encoded_filename
    )
}

#[utoipa::path(
    delete,
    path = "/api/file/{id}",
    params(
        ("id" = i32, Path, description = "File ID")
    ),
    responses(
        (status = 204, description = "File deleted"),
        (status = 401, description = "Unauthorized"),
        (status = 404, description = "File not found")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn delete_file(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
    Path(id): Path<i32>,
) -> Result<StatusCode, AppError> {
    state
        .reassembler
        .catalog()
        .delete_by_id_and_owner(id, &claims.sub)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/file/uploads",
    responses(
        (status = 200, description = "Uploads still in progress for the caller", body = Vec<SessionSummary>),
        (status = 401, description = "Unauthorized")
    ),
    security(
        ("jwt" = [])
    ),
    tag = "files"
)]
pub async fn list_uploads(
    State(state): State<crate::AppState>,
    Extension(claims): Extension<Claims>,
) -> Json<Vec<SessionSummary>> {
    Json(state.reassembler.sessions().in_progress_for(&claims.sub))
}
