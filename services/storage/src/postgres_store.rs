use crate::blob_store::{ByteStream, ChunkStream, ChunkedBlobStore, Chunker, FileRecord, FileStream};
use crate::config::DatabaseConfig;
use crate::error::StoreError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{SubsecRound, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Chunked blob store backed by PostgreSQL.
///
/// Files live in `upload_files`, their content in `upload_chunks` keyed by
/// `(files_id, n)`. A write happens inside one transaction, so a record is
/// visible only after every chunk has been committed with it.
pub struct PgBlobStore {
    pool: PgPool,
    bucket: String,
    chunk_size: usize,
}

impl PgBlobStore {
    /// Connect the pool; resolves once the database is reachable
    pub async fn connect(config: &DatabaseConfig, bucket: &str, chunk_size: usize) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        info!(bucket = %bucket, chunk_size = chunk_size, "Connected to PostgreSQL database");

        Ok(Self::from_pool(pool, bucket, chunk_size))
    }

    pub fn from_pool(pool: PgPool, bucket: &str, chunk_size: usize) -> Self {
        Self {
            pool,
            bucket: bucket.to_string(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations");

        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run migrations")?;

        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool (for health checks)
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn insert_chunk(
        tx: &mut Transaction<'_, Postgres>,
        files_id: Uuid,
        n: i32,
        data: &[u8],
    ) -> Result<(), sqlx::Error> {
        sqlx::query("INSERT INTO upload_chunks (files_id, n, data) VALUES ($1, $2, $3)")
            .bind(files_id)
            .bind(n)
            .bind(data)
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    /// Chunks of one file in order, fetched one row at a time
    fn chunk_stream(&self, files_id: Uuid) -> ChunkStream {
        let pool = self.pool.clone();

        stream::try_unfold((pool, 0i32), move |(pool, n)| async move {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT data FROM upload_chunks WHERE files_id = $1 AND n = $2")
                    .bind(files_id)
                    .bind(n)
                    .fetch_optional(&pool)
                    .await?;

            // A missing chunk ends the stream; the file was removed mid-read
            Ok::<_, StoreError>(row.map(|(data,)| (Bytes::from(data), (pool, n + 1))))
        })
        .boxed()
    }
}

#[async_trait]
impl ChunkedBlobStore for PgBlobStore {
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
        let write_error = |reason: String| StoreError::Write {
            filename: filename.to_string(),
            reason,
        };

        let id = Uuid::new_v4();
        let mut chunker = Chunker::new(self.chunk_size);
        let mut n: i32 = 0;
        let mut length: i64 = 0;

        // Dropping the transaction uncommitted rolls it back, which covers
        // both errors below and the caller abandoning this future.
        let mut tx = self.pool.begin().await.map_err(|e| write_error(e.to_string()))?;

        while let Some(piece) = data.next().await {
            let piece = piece.map_err(|e| write_error(e.to_string()))?;

            for chunk in chunker.push(piece) {
                Self::insert_chunk(&mut tx, id, n, &chunk)
                    .await
                    .map_err(|e| write_error(e.to_string()))?;
                n += 1;
                length += chunk.len() as i64;
            }
        }

        if let Some(chunk) = chunker.finish() {
            Self::insert_chunk(&mut tx, id, n, &chunk)
                .await
                .map_err(|e| write_error(e.to_string()))?;
            length += chunk.len() as i64;
        }

        let record = FileRecord {
            id,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            length,
            chunk_size: self.chunk_size as i32,
            // TIMESTAMPTZ keeps microseconds
            upload_date: Utc::now().trunc_subsecs(6),
            bucket_name: self.bucket.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO upload_files (
                id, filename, content_type, length,
                chunk_size, upload_date, bucket_name
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7
            )
            "#,
        )
        .bind(record.id)
        .bind(&record.filename)
        .bind(&record.content_type)
        .bind(record.length)
        .bind(record.chunk_size)
        .bind(record.upload_date)
        .bind(&record.bucket_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| write_error(e.to_string()))?;

        tx.commit().await.map_err(|e| write_error(e.to_string()))?;

        debug!(
            file_id = %record.id,
            size_bytes = record.length,
            "File written"
        );

        Ok(record)
    }

    #[instrument(skip(self))]
    async fn remove(&self, id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM upload_files WHERE id = $1 AND bucket_name = $2")
            .bind(id)
            .bind(&self.bucket)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id.to_string()));
        }

        debug!(file_id = %id, "File removed");
        Ok(())
    }

    fn list_files(&self) -> FileStream<'_> {
        sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, filename, content_type, length, chunk_size, upload_date, bucket_name
            FROM upload_files
            WHERE bucket_name = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(self.bucket.as_str())
        .fetch(&self.pool)
        .map_err(StoreError::from)
        .boxed()
    }

    async fn find_by_filename(&self, filename: &str) -> Result<Option<FileRecord>, StoreError> {
        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, filename, content_type, length, chunk_size, upload_date, bucket_name
            FROM upload_files
            WHERE bucket_name = $1 AND filename = $2
            ORDER BY seq ASC
            LIMIT 1
            "#,
        )
        .bind(&self.bucket)
        .bind(filename)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<FileRecord>, StoreError> {
        let record = sqlx::query_as::<_, FileRecord>(
            r#"
            SELECT id, filename, content_type, length, chunk_size, upload_date, bucket_name
            FROM upload_files
            WHERE bucket_name = $1 AND id = $2
            "#,
        )
        .bind(&self.bucket)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn open_chunks(&self, id: Uuid) -> Result<ChunkStream, StoreError> {
        if self.find_by_id(id).await?.is_none() {
            return Err(StoreError::NotFound(id.to_string()));
        }

        Ok(self.chunk_stream(id))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use testcontainers::{clients, core::WaitFor, GenericImage};

    fn pieces(parts: &[&'static [u8]]) -> ByteStream<'static> {
        let items: Vec<std::io::Result<Bytes>> =
            parts.iter().map(|&p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items).boxed()
    }

    #[tokio::test]
    #[ignore = "requires a Docker daemon"]
    async fn test_postgres_store_round_trip() {
        let docker = clients::Cli::default();
        let image = GenericImage::new("postgres", "15-alpine")
            .with_env_var("POSTGRES_HOST_AUTH_METHOD", "trust")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ));
        let node = docker.run(image);
        let config = DatabaseConfig {
            url: format!(
                "postgres://postgres@127.0.0.1:{}/postgres",
                node.get_host_port_ipv4(5432)
            ),
            ..Default::default()
        };

        let store = PgBlobStore::connect(&config, "uploads", 4).await.unwrap();
        store.run_migrations().await.unwrap();

        let record = store
            .write(pieces(&[b"hello ", b"world"]), "photo.png", "image/png")
            .await
            .unwrap();
        assert_eq!(record.length, 11);

        let chunks: Vec<Bytes> = store
            .open_read_stream("photo.png")
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"hello world");

        let files: Vec<FileRecord> = store.list_files().try_collect().await.unwrap();
        assert_eq!(files, vec![record.clone()]);

        store.remove(record.id).await.unwrap();
        assert!(matches!(
            store.open_chunks(record.id).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.remove(record.id).await,
            Err(StoreError::NotFound(_))
        ));

        let orphaned: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM upload_chunks WHERE files_id = $1")
                .bind(record.id)
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_eq!(orphaned.0, 0);
    }
}
