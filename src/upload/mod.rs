//! # Upload Module
//!
//! Resumable delivery of archived samples to the remote collector.
//!
//! This module handles:
//! - Reading unacknowledged records of each archive segment
//! - Posting them in bounded batches with retry
//! - Advancing persistent progress only after the collector acknowledges
//! - Closing fully delivered segments
//!
//! Archive and progress I/O runs on the blocking pool; only the collector
//! round trip stays on the async task.

pub mod collector;
pub mod progress;

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::storage::{run_blocking, ArchiveLog, SegmentId};
use collector::{Collector, RecordBatch, UploadRecord};
use progress::UploadTracker;

/// Batch size and retry behaviour of the uploader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadPolicy {
    pub batch_records: u32,
    pub retry: RetryPolicy,
}

impl Default for UploadPolicy {
    fn default() -> Self {
        Self {
            batch_records: 8,
            retry: RetryPolicy::new(3, std::time::Duration::from_millis(500)),
        }
    }
}

/// What an upload pass achieved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    /// Records newly acknowledged by the collector
    pub acknowledged: u32,
    /// Batches sent
    pub batches: u32,
    /// Segments closed because every record was delivered
    pub completed: Vec<SegmentId>,
}

/// Sends pending archive records to a collector
pub struct Uploader<C: Collector> {
    archive: Arc<ArchiveLog>,
    tracker: Arc<UploadTracker>,
    collector: C,
    policy: UploadPolicy,
}

impl<C: Collector> Uploader<C> {
    /// Create an uploader
    pub fn new(archive: Arc<ArchiveLog>, tracker: UploadTracker, collector: C, policy: UploadPolicy) -> Self {
        Self {
            archive,
            tracker: Arc::new(tracker),
            collector,
            policy,
        }
    }

    /// Progress tracker in use
    pub fn tracker(&self) -> &UploadTracker {
        &self.tracker
    }

    /// Upload everything not yet acknowledged, oldest segment first
    ///
    /// # Errors
    ///
    /// Transport failures stop the pass and leave progress untouched for the
    /// failed batch; the next pass resends it.
    pub async fn upload_pending(&self) -> Result<UploadReport> {
        let mut report = UploadReport::default();
        let active = self.archive.active();

        let segments = self.on_storage(|archive, _| Ok(archive.segments()?)).await?;
        for info in segments {
            if info.uploaded {
                continue;
            }
            self.upload_segment(info.id, &mut report).await?;

            if info.id < active && self.complete_if_delivered(info.id).await? {
                report.completed.push(info.id);
            }
        }

        if report.batches > 0 {
            info!(
                "Upload: {} records acknowledged in {} batches, {} segments completed",
                report.acknowledged,
                report.batches,
                report.completed.len()
            );
        }
        Ok(report)
    }

    /// Mark a closed segment uploaded once every record is acknowledged
    async fn complete_if_delivered(&self, segment: SegmentId) -> Result<bool> {
        self.on_storage(move |archive, tracker| {
            let total = archive.record_count_of(segment)?;
            if tracker.acknowledged(segment)? < total {
                return Ok(false);
            }
            archive.mark_uploaded(segment)?;
            tracker.forget(segment)?;
            Ok(true)
        })
        .await
    }

    async fn upload_segment(&self, segment: SegmentId, report: &mut UploadReport) -> Result<()> {
        let (total, mut acked) = self
            .on_storage(move |archive, tracker| Ok((archive.record_count_of(segment)?, tracker.acknowledged(segment)?)))
            .await?;
        if acked > total {
            warn!("{} claims {} acknowledged of {} records", segment, acked, total);
            return Ok(());
        }

        while acked < total {
            let end = total.min(acked.saturating_add(self.policy.batch_records.max(1)));
            let records = self
                .on_storage(move |archive, _| Ok(archive.read_records(segment, acked..end)?))
                .await?;
            let batch = RecordBatch {
                segment: segment.to_string(),
                first_index: acked,
                records: records.iter().map(UploadRecord::from).collect(),
            };

            debug!("Sending {} records {}..{}", segment, acked, end);
            let ack = self
                .policy
                .retry
                .run_async(
                    |_| self.collector.send(&batch),
                    |attempt, err| warn!("Upload of {} failed ({}), retry {}", segment, err, attempt),
                )
                .await?;
            report.batches += 1;

            // Only records inside this batch can be acknowledged by it
            let confirmed = ack.highest_index.saturating_add(1).min(batch.end_index());
            if confirmed <= acked {
                warn!(
                    "Collector acknowledged nothing new for {} (highest index {})",
                    segment, ack.highest_index
                );
                return Ok(());
            }

            self.on_storage(move |_, tracker| tracker.advance(segment, confirmed)).await?;
            report.acknowledged += confirmed - acked;
            acked = confirmed;
        }
        Ok(())
    }

    async fn on_storage<T, F>(&self, op: F) -> Result<T>
    where
        F: FnOnce(&ArchiveLog, &UploadTracker) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let archive = Arc::clone(&self.archive);
        let tracker = Arc::clone(&self.tracker);
        run_blocking(move || op(&archive, &tracker)).await
    }
}
