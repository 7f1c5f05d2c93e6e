use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
};

use crate::api::error::AppError;
use crate::entities::{files, prelude::*};
use crate::services::artifact_store::ArtifactStore;

pub type FileRecord = files::Model;

#[derive(Debug, Clone)]
pub struct NewFileRecord {
    pub owner_id: String,
    pub storage_path: String,
    pub filename: String,
    pub size: u64,
    pub mime_type: String,
    pub sha256: String,
}

/// Source of truth for committed files.
#[derive(Clone)]
pub struct FileCatalog {
    db: DatabaseConnection,
    artifacts: ArtifactStore,
}

impl FileCatalog {
    pub fn new(db: DatabaseConnection, artifacts: ArtifactStore) -> Self {
        Self { db, artifacts }
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    pub async fn create(&self, record: NewFileRecord) -> Result<FileRecord, AppError> {
        let size = i64::try_from(record.size)
            .map_err(|_| AppError::Internal(format!("file size {} out of range", record.size)))?;

        let model = files::ActiveModel {
            owner_id: Set(record.owner_id),
            storage_path: Set(record.storage_path),
            filename: Set(record.filename),
            size: Set(size),
            mime_type: Set(record.mime_type),
            sha256: Set(record.sha256),
            created_at: Set(Utc::now()),
            ..Default::default()
        };

        Ok(model.insert(&self.db).await?)
    }

    pub async fn get_by_id(&self, id: i32) -> Result<FileRecord, AppError> {
        Files::find_by_id(id)
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    /// Lookup restricted to the owner; anyone else sees `NotFound`.
    pub async fn get_owned(&self, id: i32, owner_id: &str) -> Result<FileRecord, AppError> {
        Files::find_by_id(id)
            .filter(files::Column::OwnerId.eq(owner_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| AppError::NotFound("File not found".to_string()))
    }

    pub async fn list_by_owner(&self, owner_id: &str) -> Result<Vec<FileRecord>, AppError> {
        Ok(Files::find()
            .filter(files::Column::OwnerId.eq(owner_id))
            .order_by_asc(files::Column::Id)
            .all(&self.db)
            .await?)
    }

    /// Removes the artifact, then the record. If the artifact cannot be removed
    /// the record stays so the file is never orphaned.
    pub async fn delete_by_id_and_owner(&self, id: i32, owner_id: &str) -> Result<(), AppError> {
        let record = self.get_owned(id, owner_id).await?;

        if let Err(e) = self.artifacts.remove(&record.storage_path).await {
            tracing::error!(
                file = id,
                path = %record.storage_path,
                "Failed to remove artifact, keeping record: {}",
                e
            );
            return Err(AppError::Storage(e));
        }

        let result = Files::delete_many()
            .filter(files::Column::Id.eq(id))
            .filter(files::Column::OwnerId.eq(owner_id))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Deleted concurrently by another request
            return Err(AppError::NotFound("File not found".to_string()));
        }

        tracing::info!("🗑️  Deleted file {} ({})", id, record.filename);
        Ok(())
    }
}
