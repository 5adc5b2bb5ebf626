use crate::blob_store::{ByteStream, ChunkStream, ChunkedBlobStore, Chunker, FileRecord, FileStream};
use crate::error::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

/// In-process chunked store for local runs and tests
pub struct MemoryBlobStore {
    bucket: String,
    chunk_size: usize,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Insertion order
    files: Vec<FileRecord>,
    chunks: HashMap<Uuid, Arc<Vec<Bytes>>>,
}

impl MemoryBlobStore {
    pub fn new(bucket: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            bucket: bucket.into(),
            chunk_size: chunk_size.max(1),
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Number of chunks held for a file (useful for testing)
    pub fn chunk_count(&self, id: Uuid) -> Option<usize> {
        self.inner.read().chunks.get(&id).map(|c| c.len())
    }
}

#[async_trait]
impl ChunkedBlobStore for MemoryBlobStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    #[instrument(skip(self, data))]
    async fn write(
        &self,
        mut data: ByteStream<'_>,
        filename: &str,
        content_type: &str,
    ) -> Result<FileRecord, StoreError> {
        let mut chunker = Chunker::new(self.chunk_size);
        let mut chunks = Vec::new();

        while let Some(piece) = data.next().await {
            let piece = piece.map_err(|e| StoreError::Write {
                filename: filename.to_string(),
                reason: e.to_string(),
            })?;
            chunks.extend(chunker.push(piece));
        }
        chunks.extend(chunker.finish());

        let record = FileRecord {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            length: chunks.iter().map(|c| c.len() as i64).sum(),
            chunk_size: self.chunk_size as i32,
            upload_date: Utc::now(),
            bucket_name: self.bucket.clone(),
        };

        // Record and chunks become visible together
        {
            let mut inner = self.inner.write();
            inner.chunks.insert(record.id, Arc::new(chunks));
            inner.files.push(record.clone());
        }

        debug!(file_id = %record.id, size_bytes = record.length, "File written");

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        let position = inner
            .files
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        inner.files.remove(position);
        inner.chunks.remove(&id);

        debug!(file_id = %id, "File removed");
        Ok(())
    }

    fn list_files(&self) -> FileStream<'_> {
        let files = self.inner.read().files.clone();
        stream::iter(files.into_iter().map(Ok)).boxed()
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.files.iter().find(|f| f.filename == filename).cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FileRecord>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.files.iter().find(|f| f.id == id).cloned())
    }

    async fn open_chunks(&self, id: Uuid) -> Result<ChunkStream, StoreError> {
        let chunks = self
            .inner
            .read()
            .chunks
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let count = chunks.len();
        Ok(stream::iter((0..count).map(move |n| Ok(chunks[n].clone()))).boxed())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use std::io;

    fn pieces(parts: &[&'static [u8]]) -> ByteStream<'static> {
        let items: Vec<io::Result<Bytes>> = parts.iter().map(|&p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items).boxed()
    }

    async fn read_all(store: &MemoryBlobStore, filename: &str) -> Vec<u8> {
        let chunks: Vec<Bytes> = store
            .open_read_stream(filename)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let store = MemoryBlobStore::new("uploads", 3);
        let record = store
            .write(pieces(&[b"hel", b"lo w", b"orld"]), "photo.png", "image/png")
            .await
            .unwrap();

        assert_eq!(record.length, 11);
        assert_eq!(record.bucket_name, "uploads");
        assert_eq!(store.chunk_count(record.id), Some(4));
        assert_eq!(read_all(&store, "photo.png").await, b"hello world");
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_record() {
        let store = MemoryBlobStore::new("uploads", 4);
        let items: Vec<io::Result<Bytes>> = vec![
            Ok(Bytes::from_static(b"partial data")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "client went away")),
        ];

        let result = store
            .write(stream::iter(items).boxed(), "photo.png", "image/png")
            .await;

        assert!(matches!(result, Err(StoreError::Write { .. })));
        let files: Vec<FileRecord> = store.list_files().try_collect().await.unwrap();
        assert!(files.is_empty());
    }

    #[tokio::test]
    async fn test_remove_missing_is_not_found() {
        let store = MemoryBlobStore::new("uploads", 4);
        let result = store.remove(Uuid::new_v4()).await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_is_insertion_ordered_and_find_is_first_match() {
        let store = MemoryBlobStore::new("uploads", 4);
        let first = store.write(pieces(&[b"one"]), "same.png", "image/png").await.unwrap();
        let second = store.write(pieces(&[b"two"]), "same.png", "image/png").await.unwrap();

        let files: Vec<FileRecord> = store.list_files().try_collect().await.unwrap();
        assert_eq!(files, vec![first.clone(), second.clone()]);

        let found = store.find_by_filename("same.png").await.unwrap().unwrap();
        assert_eq!(found.id, first.id);
        assert_eq!(read_all(&store, "same.png").await, b"one");

        store.remove(first.id).await.unwrap();
        assert_eq!(store.chunk_count(first.id), None);
        assert!(matches!(
            store.open_chunks(first.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert_eq!(read_all(&store, "same.png").await, b"two");
        assert_eq!(store.find_by_id(second.id).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_empty_upload() {
        let store = MemoryBlobStore::new("uploads", 4);
        let record = store.write(pieces(&[]), "empty.png", "image/png").await.unwrap();

        assert_eq!(record.length, 0);
        assert_eq!(store.chunk_count(record.id), Some(0));
        assert!(read_all(&store, "empty.png").await.is_empty());
    }
}
