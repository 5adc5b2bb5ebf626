use crate::error::StoreError;
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Metadata for one stored object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    /// Identifier assigned at write time
    pub id: Uuid,
    /// Name supplied by the uploader, not unique
    pub filename: String,
    /// MIME type recorded at write time
    pub content_type: String,
    /// Total size in bytes
    pub length: i64,
    /// Chunk size the content was split with
    pub chunk_size: i32,
    /// When the write completed
    pub upload_date: DateTime<Utc>,
    /// Partition the record lives in
    pub bucket_name: String,
}

/// Incoming upload bytes, consumed incrementally
pub type ByteStream<'a> = BoxStream<'a, std::io::Result<Bytes>>;

/// Lazy sequence of file records in insertion order
pub type FileStream<'a> = BoxStream<'a, Result<FileRecord, StoreError>>;

/// Stored content of one file, chunk by chunk
pub type ChunkStream = BoxStream<'static, Result<Bytes, StoreError>>;

/// Durable mapping from file id to a metadata record and an ordered run of chunks.
///
/// A record is only visible once all of its chunks are persisted. Nothing here
/// enforces how many records a bucket holds; the single-slot policy lives in
/// [`UploadReconciler`](crate::reconciler::UploadReconciler).
#[async_trait]
pub trait ChunkedBlobStore: Send + Sync {
    /// Partition all records are written to
    fn bucket(&self) -> &str;

    /// Chunk size new writes are split with
    fn chunk_size(&self) -> usize;

    /// Persist `data` as a new file and return its record
    async fn write(
        &self,
        data: ByteStream<'_>,
        filename: &str,
        content_type: &str,
    ) -> Result<FileRecord, StoreError>;

    /// Delete a record and its chunks; `NotFound` if there is none
    async fn remove(&self, id: Uuid) -> Result<(), StoreError>;

    /// Every record in the bucket, oldest first
    fn list_files(&self) -> FileStream<'_>;

    /// First record with this filename
    async fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FileRecord>, StoreError>;

    /// Content of one record; `NotFound` if the record is gone
    async fn open_chunks(&self, id: Uuid) -> Result<ChunkStream, StoreError>;

    /// Content of the first record with this filename
    async fn open_read_stream(&self, filename: &str) -> Result<ChunkStream, StoreError> {
        let record = self
            .find_by_filename(filename)
            .await?
            .ok_or_else(|| StoreError::NotFound(filename.to_string()))?;

        self.open_chunks(record.id).await
    }

    /// Check the backing store is reachable
    async fn ping(&self) -> Result<(), StoreError>;
}

/// Re-slices arbitrarily sized pieces into fixed-size chunks.
///
/// Holds at most one partial chunk between calls.
#[derive(Debug)]
pub struct Chunker {
    chunk_size: usize,
    buf: BytesMut,
}

impl Chunker {
    pub fn new(chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            buf: BytesMut::with_capacity(chunk_size),
        }
    }

    /// Feed a piece and take every chunk it completes
    pub fn push(&mut self, mut data: Bytes) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        while !data.is_empty() {
            // Whole chunks pass through without copying
            if self.buf.is_empty() && data.len() >= self.chunk_size {
                chunks.push(data.split_to(self.chunk_size));
                continue;
            }

            let take = (self.chunk_size - self.buf.len()).min(data.len());
            self.buf.extend_from_slice(&data.split_to(take));

            if self.buf.len() == self.chunk_size {
                chunks.push(self.buf.split().freeze());
            }
        }

        chunks
    }

    /// Trailing partial chunk, if any
    pub fn finish(self) -> Option<Bytes> {
        if self.buf.is_empty() {
            None
        } else {
            Some(self.buf.freeze())
        }
    }
}

/// Content type for an upload whose part carried none
pub fn content_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    match ext.to_lowercase().as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lengths(chunks: &[Bytes]) -> Vec<usize> {
        chunks.iter().map(|c| c.len()).collect()
    }

    #[test]
    fn test_chunker_splits_large_piece() {
        let mut chunker = Chunker::new(4);
        let chunks = chunker.push(Bytes::from_static(b"abcdefghij"));

        assert_eq!(lengths(&chunks), vec![4, 4]);
        assert_eq!(chunker.finish(), Some(Bytes::from_static(b"ij")));
    }

    #[test]
    fn test_chunker_joins_small_pieces() {
        let mut chunker = Chunker::new(4);
        let mut chunks = Vec::new();

        for piece in ["ab", "c", "defg", "h"] {
            chunks.extend(chunker.push(Bytes::from(piece)));
        }

        assert_eq!(chunks, vec![Bytes::from("abcd"), Bytes::from("efgh")]);
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_chunker_empty_input() {
        let mut chunker = Chunker::new(8);
        assert!(chunker.push(Bytes::new()).is_empty());
        assert_eq!(chunker.finish(), None);
    }

    #[test]
    fn test_get_content_type() {
        assert_eq!(content_type_for("photo.png"), "image/png");
        assert_eq!(content_type_for("photo.JPG"), "image/jpeg");
        assert_eq!(content_type_for("photo.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("notes"), "application/octet-stream");
    }

    #[test]
    fn test_file_record_wire_names() {
        let record = FileRecord {
            id: Uuid::nil(),
            filename: "photo.png".to_string(),
            content_type: "image/png".to_string(),
            length: 3,
            chunk_size: 261120,
            upload_date: Utc::now(),
            bucket_name: "uploads".to_string(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["contentType"], "image/png");
        assert_eq!(json["bucketName"], "uploads");
        assert_eq!(json["chunkSize"], 261120);
        assert!(json.get("uploadDate").is_some());
    }
}
