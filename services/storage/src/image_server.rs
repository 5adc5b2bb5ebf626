use crate::blob_store::{ChunkStream, ChunkedBlobStore, FileRecord};
use crate::catalog::FileCatalog;
use crate::error::{MediaRejection, ServiceError};
use std::sync::Arc;
use tracing::{debug, instrument};

/// Content types that may be served back
pub const IMAGE_CONTENT_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

/// A stored image ready to be written to a response
pub struct ImageStream {
    pub record: FileRecord,
    pub body: ChunkStream,
}

/// Streams stored images, refusing anything that is not one
#[derive(Clone)]
pub struct ImageServer {
    catalog: FileCatalog,
    store: Arc<dyn ChunkedBlobStore>,
}

impl ImageServer {
    pub fn new(catalog: FileCatalog, store: Arc<dyn ChunkedBlobStore>) -> Self {
        Self { catalog, store }
    }

    /// Look up `filename` and open its content.
    ///
    /// The body is read chunk by chunk as the caller polls it. Content is
    /// opened by the id that passed the gate, so a record removed in between
    /// yields `NotFound` rather than another file with the same name.
    #[instrument(skip(self))]
    pub async fn serve(&self, filename: &str) -> Result<ImageStream, ServiceError> {
        let record = self.catalog.by_filename(filename).await?;

        if !IMAGE_CONTENT_TYPES.contains(&record.content_type.as_str()) {
            debug!(content_type = %record.content_type, "Refusing to serve non-image");
            return Err(MediaRejection::ContentType {
                content_type: record.content_type,
            }
            .into());
        }

        let body = self.store.open_chunks(record.id).await?;

        metrics::counter!("image_store.images.served").increment(1);

        Ok(ImageStream { record, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob_store::{ByteStream, FileStream};
    use crate::error::StoreError;
    use crate::memory_store::MemoryBlobStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream::{self, StreamExt, TryStreamExt};
    use uuid::Uuid;

    /// Removes each record right after a filename lookup returns it
    struct VanishingStore {
        inner: MemoryBlobStore,
    }

    #[async_trait]
    impl ChunkedBlobStore for VanishingStore {
        fn bucket(&self) -> &str {
            self.inner.bucket()
        }

        fn chunk_size(&self) -> usize {
            self.inner.chunk_size()
        }

        async fn write(
            &self,
            data: ByteStream<'_>,
            filename: &str,
            content_type: &str,
        ) -> Result<FileRecord, StoreError> {
            self.inner.write(data, filename, content_type).await
        }

        async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
            self.inner.remove(id).await
        }

        fn list_files(&self) -> FileStream<'_> {
            self.inner.list_files()
        }

        async fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError> {
            let found = self.inner.find_by_filename(filename).await?;
            if let Some(record) = &found {
                self.inner.remove(record.id).await?;
            }
            Ok(found)
        }

        async fn find_by_id(&self, id: Uuid) -> Result<Option<FileRecord>, StoreError> {
            self.inner.find_by_id(id).await
        }

        async fn open_chunks(&self, id: Uuid) -> Result<ChunkStream, StoreError> {
            self.inner.open_chunks(id).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            Ok(())
        }
    }

    async fn server_with(filename: &str, content_type: &str, data: &'static [u8]) -> ImageServer {
        let store: Arc<dyn ChunkedBlobStore> = Arc::new(MemoryBlobStore::new("uploads", 3));
        let body = stream::iter(vec![Ok(Bytes::from_static(data))]).boxed();
        store.write(body, filename, content_type).await.unwrap();

        ImageServer::new(FileCatalog::new(store.clone()), store)
    }

    #[tokio::test]
    async fn test_serves_image_bytes_in_order() {
        let server = server_with("photo.png", "image/png", b"\x89PNG\r\n\x1a\nrest").await;

        let image = server.serve("photo.png").await.unwrap();
        assert_eq!(image.record.length, 12);

        let chunks: Vec<Bytes> = image.body.try_collect().await.unwrap();
        assert_eq!(chunks.concat(), b"\x89PNG\r\n\x1a\nrest");
    }

    #[tokio::test]
    async fn test_refuses_non_image_record() {
        let server = server_with("scan.png", "application/pdf", b"%PDF-1.7").await;

        match server.serve("scan.png").await {
            Err(ServiceError::UnsupportedMediaType(MediaRejection::ContentType { content_type })) => {
                assert_eq!(content_type, "application/pdf");
            }
            Err(other) => panic!("Expected ContentType rejection, got {:?}", other),
            Ok(_) => panic!("Expected ContentType rejection, got a stream"),
        }
    }

    #[tokio::test]
    async fn test_removed_record_never_serves_a_namesake() {
        let store: Arc<dyn ChunkedBlobStore> = Arc::new(VanishingStore {
            inner: MemoryBlobStore::new("uploads", 4),
        });
        let png = stream::iter(vec![Ok(Bytes::from_static(b"PNG"))]).boxed();
        store.write(png, "x.png", "image/png").await.unwrap();
        let pdf = stream::iter(vec![Ok(Bytes::from_static(b"%PDF-1.7 secret"))]).boxed();
        let other = store.write(pdf, "x.png", "application/pdf").await.unwrap();

        let server = ImageServer::new(FileCatalog::new(store.clone()), store.clone());

        assert!(matches!(
            server.serve("x.png").await,
            Err(ServiceError::NotFound)
        ));
        assert!(store.find_by_id(other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_missing_file() {
        let server = server_with("photo.png", "image/png", b"data").await;
        assert!(matches!(
            server.serve("other.png").await,
            Err(ServiceError::NotFound)
        ));
    }
}
