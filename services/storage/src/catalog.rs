use crate::blob_store::{ChunkedBlobStore, FileRecord};
use crate::error::ServiceError;
use futures::TryStreamExt;
use std::sync::Arc;
use uuid::Uuid;

/// Read-side queries over the store
#[derive(Clone)]
pub struct FileCatalog {
    store: Arc<dyn ChunkedBlobStore>,
}

impl FileCatalog {
    pub fn new(store: Arc<dyn ChunkedBlobStore>) -> Self {
        Self { store }
    }

    /// Every record, oldest first. Empty when the store is empty.
    pub async fn all(&self) -> Result<Vec<FileRecord>, ServiceError> {
        let files: Vec<FileRecord> = self.store.list_files().try_collect().await?;
        Ok(files)
    }

    /// First record with this filename.
    ///
    /// Filenames are not unique. Under single-active retention there is at
    /// most one record so the choice rarely matters; with `keep_all` the
    /// oldest match wins.
    pub async fn by_filename(&self, filename: &str) -> Result<FileRecord, ServiceError> {
        self.store
            .find_by_filename(filename)
            .await?
            .ok_or(ServiceError::NotFound)
    }

    pub async fn by_id(&self, id: Uuid) -> Result<FileRecord, ServiceError> {
        self.store
            .find_by_id(id)
            .await?
            .ok_or(ServiceError::NotFound)
    }
}
