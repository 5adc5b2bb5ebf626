use crate::blob_store::{ChunkedBlobStore, FileRecord};
use crate::config::RetentionMode;
use crate::error::StoreError;
use futures::stream::{self, StreamExt, TryStreamExt};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// A superseded record that could not be deleted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to remove superseded file {id}: {reason}")]
pub struct ReconciliationDeleteError {
    pub id: Uuid,
    pub reason: String,
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Record the pass was run for
    pub kept: Option<Uuid>,
    /// Superseded records that are gone
    pub removed: Vec<Uuid>,
    /// Superseded records still present
    pub failed: Vec<ReconciliationDeleteError>,
}

/// Removes every record other than the one just uploaded.
///
/// The scan and the deletes are separate store calls, not a transaction. A
/// concurrent upload can interleave and leave two survivors, or remove a file
/// another request is streaming. Each delete is attempted on its own and a
/// failure never aborts the rest.
#[derive(Clone)]
pub struct UploadReconciler {
    store: Arc<dyn ChunkedBlobStore>,
    mode: RetentionMode,
    concurrency: usize,
}

impl UploadReconciler {
    pub fn new(store: Arc<dyn ChunkedBlobStore>, mode: RetentionMode, concurrency: usize) -> Self {
        Self {
            store,
            mode,
            concurrency: concurrency.max(1),
        }
    }

    pub fn mode(&self) -> RetentionMode {
        self.mode
    }

    /// Delete every record in the bucket whose id differs from `kept`.
    ///
    /// Only a failure to list the bucket is returned as an error; individual
    /// delete failures are collected in the report.
    #[instrument(skip(self, kept), fields(file_id = %kept.id))]
    pub async fn reconcile(&self, kept: &FileRecord) -> Result<ReconcileReport, StoreError> {
        let mut report = ReconcileReport {
            kept: Some(kept.id),
            ..Default::default()
        };

        if self.mode == RetentionMode::KeepAll {
            debug!("Retention keeps all files, skipping reconciliation");
            return Ok(report);
        }

        let files: Vec<FileRecord> = self.store.list_files().try_collect().await?;

        let superseded: Vec<Uuid> = files
            .iter()
            .filter(|f| f.id != kept.id)
            .map(|f| f.id)
            .collect();

        debug!(
            total = files.len(),
            superseded = superseded.len(),
            "Reconciling bucket"
        );

        let store = self.store.clone();
        let outcomes: Vec<(Uuid, Result<(), StoreError>)> = stream::iter(superseded)
            .map(move |id| {
                let store = store.clone();
                async move { (id, store.remove(id).await) }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => {
                    debug!(removed_id = %id, "Removed superseded file");
                    report.removed.push(id);
                }
                // Someone else already deleted it
                Err(StoreError::NotFound(_)) => {
                    debug!(removed_id = %id, "Superseded file already gone");
                    report.removed.push(id);
                }
                Err(e) => {
                    let failure = ReconciliationDeleteError {
                        id,
                        reason: e.to_string(),
                    };
                    warn!(error = %failure, "Failed to remove superseded file");
                    report.failed.push(failure);
                }
            }
        }

        metrics::counter!("image_store.reconcile.removed").increment(report.removed.len() as u64);
        metrics::counter!("image_store.reconcile.failed").increment(report.failed.len() as u64);

        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "Reconciliation complete"
        );

        Ok(report)
    }
}
