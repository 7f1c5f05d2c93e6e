use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use utoipa::ToSchema;
use validator::Validate;

use crate::api::error::AppError;
use crate::config::SecurityConfig;
use crate::services::artifact_store::SealedArtifact;
use crate::services::catalog::{FileCatalog, FileRecord, NewFileRecord};
use crate::services::chunk_store::{ChunkHandle, ChunkStore};
use crate::services::classifier::{self, SNIFF_LEN};
use crate::services::scanner::{ScanResult, VirusScanner};
use crate::services::session::{
    Progress, SessionError, SessionState, SessionTracker, UploadPhase, UploadSession,
};
use crate::utils::hash::verify;
use crate::utils::validation::{
    ValidationError, is_mime_allowed, sanitize_filename, validate_file_id, validate_file_size,
};

/// Metadata sent alongside every chunk.
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    /// Position of the chunk; numbering may start at 0 or 1
    pub order: u64,
    pub file_id: String,
    /// First byte of this chunk within the file
    pub offset: u64,
    /// Exclusive end byte of this chunk within the file
    pub limit: u64,
    pub file_size: u64,
    #[validate(length(min = 1, max = 1024))]
    pub file_name: String,
    /// Lower-case hex SHA-256 of this chunk's bytes
    #[validate(length(equal = 64, message = "Invalid checksum format"))]
    pub check_sum: String,
}

#[derive(Debug)]
pub enum ChunkOutcome {
    /// Stored; the upload is still incomplete
    Accepted { file_id: String, progress: Progress },
    /// This chunk completed the upload
    Completed(FileRecord),
    /// The upload had already been committed; nothing changed
    AlreadyCompleted(FileRecord),
}

struct Classified {
    artifact: SealedArtifact,
    mime_type: &'static str,
}

/// Drives an upload from its first chunk to a committed catalog record.
///
/// Everything that touches one file id runs under that id's lock, inside a
/// spawned task so a dropped connection cannot interrupt a merge half way.
#[derive(Clone)]
pub struct Reassembler {
    chunks: Arc<dyn ChunkStore>,
    sessions: SessionTracker,
    catalog: FileCatalog,
    scanner: Arc<dyn VirusScanner>,
    config: Arc<SecurityConfig>,
}

impl Reassembler {
    pub fn new(
        chunks: Arc<dyn ChunkStore>,
        sessions: SessionTracker,
        catalog: FileCatalog,
        scanner: Arc<dyn VirusScanner>,
        config: Arc<SecurityConfig>,
    ) -> Self {
        Self {
            chunks,
            sessions,
            catalog,
            scanner,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn chunks(&self) -> &Arc<dyn ChunkStore> {
        &self.chunks
    }

    pub async fn accept_chunk(
        &self,
        owner_id: &str,
        meta: ChunkMetadata,
        bytes: Bytes,
    ) -> Result<ChunkOutcome, AppError> {
        let final_name = self.validate(&meta, bytes.len())?;

        if !verify(&bytes[..], &meta.check_sum).await? {
            warn!(
                file_id = %meta.file_id,
                order = meta.order,
                "❌ Chunk checksum mismatch"
            );
            return Err(AppError::ChecksumMismatch {
                file_id: meta.file_id,
                order: meta.order,
            });
        }

        let this = self.clone();
        let owner_id = owner_id.to_string();
        tokio::spawn(async move { this.apply(owner_id, meta, final_name, bytes).await })
            .await
            .map_err(|e| AppError::Internal(format!("chunk task failed: {}", e)))?
    }

    /// Stateless checks on metadata and payload. Returns the sanitized file name.
    fn validate(&self, meta: &ChunkMetadata, payload_len: usize) -> Result<String, AppError> {
        meta.validate()
            .map_err(|e| AppError::BadRequest(format!("Invalid metadata: {}", e)))?;
        validate_file_id(&meta.file_id)?;

        if meta.file_size == 0 {
            return Err(ValidationError::new("EMPTY_FILE", "Empty files cannot be uploaded").into());
        }
        validate_file_size(meta.file_size, self.config.max_file_size)?;

        if meta.limit <= meta.offset || meta.limit > meta.file_size {
            return Err(ValidationError::new(
                "INVALID_RANGE",
                format!(
                    "Chunk range [{}, {}) is not within a file of {} bytes",
                    meta.offset, meta.limit, meta.file_size
                ),
            )
            .into());
        }

        let declared = meta.limit - meta.offset;
        if declared != payload_len as u64 {
            return Err(ValidationError::new(
                "SIZE_MISMATCH",
                format!(
                    "Chunk payload is {} bytes but metadata declares {}",
                    payload_len, declared
                ),
            )
            .into());
        }

        if declared > self.config.max_chunk_size {
            return Err(ValidationError::new(
                "CHUNK_TOO_LARGE",
                format!(
                    "Chunk of {} bytes exceeds the {} byte limit",
                    declared, self.config.max_chunk_size
                ),
            )
            .into());
        }

        Ok(sanitize_filename(&meta.file_name)?)
    }

    async fn apply(
        self,
        owner_id: String,
        meta: ChunkMetadata,
        final_name: String,
        bytes: Bytes,
    ) -> Result<ChunkOutcome, AppError> {
        let file_id = meta.file_id.clone();
        let _guard = self.sessions.lock(&file_id).await;

        match self.sessions.observe(&file_id, &owner_id, meta.file_size) {
            Err(SessionError::OwnerMismatch) => {
                warn!(file_id = %file_id, "Chunk for an upload owned by another user");
                return Err(AppError::NotFound("Upload not found".to_string()));
            }
            Err(e @ SessionError::SizeMismatch { .. }) => {
                return Err(AppError::BadRequest(e.to_string()));
            }
            Ok(SessionState::Committed(record_id)) => {
                match self.catalog.get_owned(record_id, &owner_id).await {
                    Ok(record) => {
                        info!(file_id = %file_id, record = record.id, "↩️  Upload already committed");
                        return Ok(ChunkOutcome::AlreadyCompleted(record));
                    }
                    // The committed file was deleted since; the id starts over
                    Err(AppError::NotFound(_)) => self.sessions.forget(&file_id),
                    Err(e) => return Err(e),
                }
            }
            Ok(SessionState::New) | Ok(SessionState::Open) => {}
        }

        self.chunks.put(&file_id, meta.order, bytes).await?;

        let progress = self.sessions.record_chunk(
            &file_id,
            &owner_id,
            meta.file_size,
            &final_name,
            meta.order,
            (meta.offset, meta.limit),
        );

        info!(
            file_id = %file_id,
            order = meta.order,
            received = progress.received_chunks,
            bytes = progress.received_bytes,
            "📦 Chunk stored"
        );

        if !progress.complete {
            return Ok(ChunkOutcome::Accepted { file_id, progress });
        }

        let session = self
            .sessions
            .get(&file_id)
            .ok_or_else(|| AppError::Internal(format!("session {} vanished", file_id)))?;

        let record = match self.finalize(&session).await {
            Ok(record) => record,
            Err(e) => {
                self.abort(&file_id, &e).await;
                return Err(e);
            }
        };

        self.sessions.commit(&file_id, record.id);
        Ok(ChunkOutcome::Completed(record))
    }

    /// Merge, scan and classify under the merge timeout, then commit.
    /// The commit itself is not subject to the timeout so it never leaves a
    /// promoted artifact without its record.
    async fn finalize(&self, session: &UploadSession) -> Result<FileRecord, AppError> {
        let limit = Duration::from_secs(self.config.merge_timeout_secs);
        let classified = tokio::time::timeout(limit, self.prepare(session))
            .await
            .map_err(|_| {
                AppError::Internal(format!(
                    "finalizing {} exceeded {:?}",
                    session.file_id, limit
                ))
            })??;

        self.commit(session, classified).await
    }

    async fn prepare(&self, session: &UploadSession) -> Result<Classified, AppError> {
        self.sessions.set_phase(&session.file_id, UploadPhase::Merging);
        info!(file_id = %session.file_id, "🧩 Merging chunks");
        let artifact = self.merge(session).await?;

        self.sessions
            .set_phase(&session.file_id, UploadPhase::Classifying);

        if self.config.enable_virus_scan {
            self.scan(session, &artifact).await?;
        }

        let sample = artifact.sample(SNIFF_LEN).await?;
        let mime_type = classifier::classify(&sample)
            .ok_or_else(|| AppError::UnsupportedType("unknown".to_string()))?;

        if !is_mime_allowed(mime_type, &self.config.allowed_mime_types) {
            return Err(AppError::UnsupportedType(mime_type.to_string()));
        }

        Ok(Classified {
            artifact,
            mime_type,
        })
    }

    /// Streams staged chunks, in ascending order, into one temporary artifact.
    async fn merge(&self, session: &UploadSession) -> Result<SealedArtifact, AppError> {
        let handles = self.chunks.list_chunks(&session.file_id).await?;
        let ordered = order_chunks(handles)?;

        let staged: Vec<u64> = ordered.iter().map(|(order, _)| *order).collect();
        let expected: Vec<u64> = session.received.keys().copied().collect();
        if staged != expected {
            return Err(AppError::Internal(format!(
                "staged chunks {:?} of {} do not match received {:?}",
                staged, session.file_id, expected
            )));
        }

        let mut pending = self.catalog.artifacts().begin().await?;
        for (order, handle) in &ordered {
            let reader = self.chunks.open(handle).await?;
            let copied = pending.append(reader).await?;

            let declared = session
                .received
                .get(order)
                .map(|(offset, limit)| limit - offset)
                .unwrap_or_default();
            if copied != declared {
                return Err(AppError::Internal(format!(
                    "chunk {} of {} holds {} bytes, expected {}",
                    order, session.file_id, copied, declared
                )));
            }
        }

        let artifact = pending.seal().await?;
        if artifact.size != session.file_size {
            return Err(AppError::Internal(format!(
                "merged {} bytes for {}, expected {}",
                artifact.size, session.file_id, session.file_size
            )));
        }

        for (_, handle) in &ordered {
            if let Err(e) = self.chunks.remove(handle).await {
                warn!(file_id = %session.file_id, chunk = %handle.name, "Failed to remove merged chunk: {}", e);
            }
        }

        Ok(artifact)
    }

    async fn scan(&self, session: &UploadSession, artifact: &SealedArtifact) -> Result<(), AppError> {
        let reader = artifact.reader().await?;
        match self.scanner.scan(Box::pin(reader)).await? {
            ScanResult::Clean => Ok(()),
            ScanResult::Infected { threat_name } => {
                warn!(file_id = %session.file_id, "🦠 Malware detected: {}", threat_name);
                Err(AppError::ScanRejected(threat_name))
            }
            ScanResult::Error { reason } => Err(AppError::Internal(format!(
                "virus scan failed for {}: {}",
                session.file_id, reason
            ))),
        }
    }

    async fn commit(
        &self,
        session: &UploadSession,
        classified: Classified,
    ) -> Result<FileRecord, AppError> {
        let Classified {
            artifact,
            mime_type,
        } = classified;
        let size = artifact.size;
        let sha256 = artifact.sha256.clone();

        let artifacts = self.catalog.artifacts();
        let stored = artifacts
            .promote(artifact, &session.owner_id, &session.final_name)
            .await?;

        let record = match self
            .catalog
            .create(NewFileRecord {
                owner_id: session.owner_id.clone(),
                storage_path: stored.storage_path.clone(),
                filename: session.final_name.clone(),
                size,
                mime_type: mime_type.to_string(),
                sha256,
            })
            .await
        {
            Ok(record) => record,
            Err(e) => {
                if let Err(rm) = artifacts.remove(&stored.storage_path).await {
                    error!(path = %stored.storage_path, "Failed to roll back promoted artifact: {}", rm);
                }
                return Err(e);
            }
        };

        info!(
            file_id = %session.file_id,
            record = record.id,
            mime = %record.mime_type,
            size = record.size,
            "✅ Upload committed"
        );
        Ok(record)
    }

    async fn abort(&self, file_id: &str, reason: &AppError) {
        self.sessions.abort(file_id);
        let removed = self.chunks.discard(file_id).await;
        error!(file_id, removed_chunks = removed, "Upload aborted: {}", reason);
    }
}

/// Sorts chunk handles by their numeric order. Unparseable names and
/// duplicate orders are protocol errors.
pub fn order_chunks(handles: Vec<ChunkHandle>) -> Result<Vec<(u64, ChunkHandle)>, AppError> {
    let mut ordered = handles
        .into_iter()
        .map(|h| match h.order() {
            Some(order) => Ok((order, h)),
            None => Err(AppError::Internal(format!(
                "cannot parse chunk order from '{}'",
                h.name
            ))),
        })
        .collect::<Result<Vec<_>, _>>()?;

    ordered.sort_by_key(|(order, _)| *order);

    if let Some(pair) = ordered.windows(2).find(|w| w[0].0 == w[1].0) {
        return Err(AppError::Internal(format!(
            "duplicate chunk order {} ('{}' and '{}')",
            pair[0].0, pair[0].1.name, pair[1].1.name
        )));
    }

    Ok(ordered)
}
