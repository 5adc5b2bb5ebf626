//! Image Store
//!
//! Minimal binary-object storage for image uploads. Files arrive over HTTP,
//! are streamed into chunked storage, listed and served back, and every
//! upload supersedes whatever the bucket held before it.
//!
//! ## Features
//!
//! - **Chunked Storage**: content is split into fixed-size chunks alongside a
//!   metadata record, in PostgreSQL or in memory
//! - **Upload Validation**: only `.png`, `.jpg`, `.JPG` and `.jpeg` filenames
//!   are accepted, checked before any bytes are read
//! - **Reconciliation**: after each upload every other record in the bucket
//!   is removed, best effort with each delete independent
//! - **Image Serving**: stored images stream back chunk by chunk, gated on
//!   their content type
//!
//! ## Architecture
//!
//! ```text
//!  POST /upload                                   GET /files, /image/:name
//! ┌──────────────┐   ┌──────────────┐            ┌──────────────┐
//! │ Upload       │──▶│ Chunked      │◀───────────│ File         │
//! │ Validator    │   │ Blob Store   │            │ Catalog      │
//! └──────────────┘   └──────────────┘            └──────────────┘
//!                       ▲        │                      │
//!                       │        ▼                      ▼
//!                ┌──────────────┐              ┌──────────────┐
//!                │ Upload       │              │ Image        │
//!                │ Reconciler   │              │ Server       │
//!                └──────────────┘              └──────────────┘
//! ```

pub mod api;
pub mod blob_store;
pub mod catalog;
pub mod config;
pub mod error;
pub mod image_server;
pub mod memory_store;
pub mod postgres_store;
pub mod reconciler;
pub mod validator;

pub use api::{AppState, UploadResponse};
pub use blob_store::{ChunkedBlobStore, FileRecord};
pub use catalog::FileCatalog;
pub use config::{Config, RetentionMode, StorageBackend};
pub use error::{MediaRejection, ServiceError, StoreError};
pub use image_server::{ImageServer, ImageStream};
pub use memory_store::MemoryBlobStore;
pub use postgres_store::PgBlobStore;
pub use reconciler::{ReconcileReport, ReconciliationDeleteError, UploadReconciler};
pub use validator::UploadValidator;
