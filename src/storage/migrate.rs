//! # Migration
//!
//! Moves data down the storage hierarchy:
//!
//! 1. staging slots into the active archive segment once enough are staged
//! 2. rotation of the active segment once it outgrows its size ceiling
//! 3. closed segments from the archive pool to the overflow pool, chunk by chunk
//!
//! Every step can be re-run after an interruption. Staging slots are released
//! one by one after their append, so an interrupted drain repeats at most one
//! record and never loses one.

use std::io::Write;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::archive::{ArchiveLog, SegmentId};
use super::backend::{read_at, OpenMode, StoragePool};
use super::staging::StagingStore;
use crate::error::StorageError;

/// When and how to migrate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationPolicy {
    /// Staged samples needed before they move to the archive
    pub batch_threshold: usize,
    /// Active segment size that triggers rotation
    pub max_segment_bytes: u64,
    /// Bytes copied per locked step when moving to the overflow pool
    pub chunk_bytes: usize,
}

impl Default for MigrationPolicy {
    fn default() -> Self {
        Self {
            batch_threshold: 10,
            max_segment_bytes: 512 * 1024,
            chunk_bytes: 4096,
        }
    }
}

/// What a migration pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Staged samples appended to the archive
    pub archived: usize,
    /// Segment closed by this pass
    pub rotated: Option<SegmentId>,
    /// Segments moved to the overflow pool
    pub offloaded: Vec<SegmentId>,
    /// Bytes copied to the overflow pool
    pub moved_bytes: u64,
}

impl MigrationReport {
    /// Whether the pass changed anything
    pub fn is_empty(&self) -> bool {
        self.archived == 0 && self.rotated.is_none() && self.offloaded.is_empty() && self.moved_bytes == 0
    }
}

/// Drives staging → archive → overflow migration
pub struct Migrator {
    archive: Arc<ArchiveLog>,
    policy: MigrationPolicy,
}

impl Migrator {
    /// Create a migrator for `archive`
    pub fn new(archive: Arc<ArchiveLog>, policy: MigrationPolicy) -> Self {
        Self { archive, policy }
    }

    /// Policy in use
    pub fn policy(&self) -> &MigrationPolicy {
        &self.policy
    }

    /// Run every migration step whose trigger is met
    ///
    /// # Errors
    ///
    /// Staging is left untouched when the archive append fails, so the same
    /// samples are tried again on the next pass.
    pub fn migrate_if_due(&self, staging: &StagingStore) -> Result<MigrationReport, StorageError> {
        let mut report = MigrationReport::default();

        let staged = staging.staged_count()?;
        if staged >= self.policy.batch_threshold {
            debug!("{} samples staged (threshold {}), migrating", staged, self.policy.batch_threshold);
            self.drain_staging(staging, &mut report)?;
        }

        if self.archive.size_bytes()? > self.policy.max_segment_bytes {
            report.rotated = self.archive.rotate()?;
        }

        self.offload(&mut report)?;

        if !report.is_empty() {
            info!(
                "Migration: {} archived, rotated {:?}, {} segments / {} bytes offloaded",
                report.archived,
                report.rotated.map(|s| s.to_string()),
                report.offloaded.len(),
                report.moved_bytes
            );
        }
        Ok(report)
    }

    /// Move every verified staged sample into the archive, oldest first
    ///
    /// Each slot is released right after its sample is appended. Once all
    /// of them are archived the staging files are reset.
    pub fn drain_staging(&self, staging: &StagingStore, report: &mut MigrationReport) -> Result<(), StorageError> {
        let mut records = staging.load_all()?;
        records.sort_by_key(|r| (r.sample.timestamp(), r.slot_index));

        let tail = self.archive.last_timestamp()?;
        for record in &records {
            if let Some(tail) = tail.filter(|&t| record.sample.timestamp() <= t) {
                warn!("Staged sample {} is not after archive tail {}", record.sample.timestamp(), tail);
            }
            self.archive.append(&record.sample)?;
            staging.discard(record.slot_index)?;
            debug!("Slot {} ({}) archived", record.slot_index, record.sample.timestamp());
            report.archived += 1;
        }

        staging.clear()
    }

    /// Move closed segments to the overflow pool
    fn offload(&self, report: &mut MigrationReport) -> Result<(), StorageError> {
        let Some(overflow) = self.archive.overflow() else {
            return Ok(());
        };

        for segment in self.archive.closed_in_primary()? {
            report.moved_bytes += self.move_segment(segment, overflow.as_ref())?;
            report.offloaded.push(segment);
        }
        Ok(())
    }

    fn move_segment(&self, segment: SegmentId, overflow: &dyn StoragePool) -> Result<u64, StorageError> {
        let primary = self.archive.pool().as_ref();
        let [uploaded_data, uploaded_meta] = segment.uploaded_files();
        let files = [segment.data_file(), segment.meta_file(), uploaded_data, uploaded_meta];

        let mut moved = 0u64;
        for file in &files {
            loop {
                let _guard = self.archive.device().lock();
                let n = copy_chunk(primary, overflow, file, self.policy.chunk_bytes)?;
                if n == 0 {
                    break;
                }
                moved += n as u64;
            }
        }

        let _guard = self.archive.device().lock();
        // Meta before data: readers locate a segment through its meta file
        for file in files.iter().rev() {
            primary
                .delete(file)
                .map_err(|e| StorageError::io(primary.name(), file, e))?;
        }
        debug!("Segment {} moved to {} ({} bytes copied)", segment, overflow.name(), moved);
        Ok(moved)
    }
}

/// Copy the next chunk of `file` from `src` to `dst`
///
/// Resumes from the destination's current size, so repeated calls never
/// duplicate bytes. Returns the number of bytes copied, `0` once the
/// destination is complete (or the source does not exist).
pub fn copy_chunk(src: &dyn StoragePool, dst: &dyn StoragePool, file: &str, chunk: usize) -> Result<usize, StorageError> {
    let Some(src_len) = src.stat(file).map_err(|e| StorageError::io(src.name(), file, e))? else {
        return Ok(0);
    };
    let dst_io = |e| StorageError::io(dst.name(), file, e);
    let dst_len = dst.stat(file).map_err(dst_io)?;

    let done = dst_len.unwrap_or(0);
    if done > src_len {
        warn!("{}/{} is larger than its source", dst.name(), file);
        return Err(StorageError::Corrupt {
            file: format!("{}/{}", dst.name(), file),
            reason: format!("destination has {} bytes, source {}", done, src_len),
        });
    }

    let n = (src_len - done).min(chunk as u64) as usize;
    if n == 0 && dst_len.is_some() {
        return Ok(0);
    }

    let bytes = read_at(src, file, done, n).map_err(|e| StorageError::io(src.name(), file, e))?;
    let mut handle = dst.open(file, OpenMode::Append).map_err(dst_io)?;
    handle.write_all(&bytes).map_err(dst_io)?;
    handle.flush().map_err(dst_io)?;
    handle.sync().map_err(dst_io)?;
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{MatrixGeometry, RangeBounds, Sample};
    use crate::storage::backend::mocks::MemoryPool;
    use crate::storage::device::SharedDevice;
    use crate::retry::RetryPolicy;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    const GEOMETRY: MatrixGeometry = MatrixGeometry::new(2, 2);

    struct Fixture {
        staging_pool: MemoryPool,
        archive_pool: MemoryPool,
        overflow_pool: MemoryPool,
        staging: StagingStore,
        archive: Arc<ArchiveLog>,
    }

    fn fixture(with_overflow: bool) -> Fixture {
        let device = SharedDevice::new();
        let staging_pool = MemoryPool::new("staging");
        let archive_pool = MemoryPool::new("archive");
        let overflow_pool = MemoryPool::new("sd");
        let staging = StagingStore::new(
            Arc::new(staging_pool.clone()),
            device.clone(),
            GEOMETRY,
            4,
            RetryPolicy::new(1, Duration::ZERO),
        );
        let overflow: Option<Arc<dyn StoragePool>> = if with_overflow {
            Some(Arc::new(overflow_pool.clone()))
        } else {
            None
        };
        let archive = Arc::new(ArchiveLog::open(Arc::new(archive_pool.clone()), overflow, device, GEOMETRY).unwrap());
        Fixture {
            staging_pool,
            archive_pool,
            overflow_pool,
            staging,
            archive,
        }
    }

    fn sample(secs: i64) -> Sample {
        Sample::new(
            Utc.timestamp_opt(secs, 0).unwrap(),
            GEOMETRY,
            vec![20.0, 21.0, 22.0, (secs % 100) as f32],
            RangeBounds::default(),
        )
        .unwrap()
    }

    fn policy(batch_threshold: usize) -> MigrationPolicy {
        MigrationPolicy {
            batch_threshold,
            max_segment_bytes: 1024,
            chunk_bytes: 10,
        }
    }

    #[test]
    fn test_below_threshold_does_nothing() {
        let f = fixture(false);
        f.staging.save(0, &sample(1_700_000_000)).unwrap();

        let report = Migrator::new(Arc::clone(&f.archive), policy(2)).migrate_if_due(&f.staging).unwrap();
        assert!(report.is_empty());
        assert_eq!(f.staging.staged_count().unwrap(), 1);
        assert_eq!(f.archive.record_count().unwrap(), 0);
    }

    #[test]
    fn test_staged_samples_move_in_time_order() {
        let f = fixture(false);
        f.staging.save(0, &sample(1_700_000_120)).unwrap();
        f.staging.save(1, &sample(1_700_000_000)).unwrap();

        let report = Migrator::new(Arc::clone(&f.archive), policy(2)).migrate_if_due(&f.staging).unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(f.staging.staged_count().unwrap(), 0);

        let records = f.archive.read_records(f.archive.active(), 0..2).unwrap();
        assert_eq!(records[0].sample, sample(1_700_000_000));
        assert_eq!(records[1].sample, sample(1_700_000_120));
    }

    #[test]
    fn test_migration_is_idempotent() {
        let f = fixture(false);
        let migrator = Migrator::new(Arc::clone(&f.archive), policy(1));
        f.staging.save(0, &sample(1_700_000_000)).unwrap();
        f.staging.save(1, &sample(1_700_000_060)).unwrap();

        migrator.migrate_if_due(&f.staging).unwrap();
        assert_eq!(f.archive.record_count().unwrap(), 2);

        let second = migrator.migrate_if_due(&f.staging).unwrap();
        assert!(second.is_empty());
        assert_eq!(f.archive.record_count().unwrap(), 2);
    }

    #[test]
    fn test_sample_older_than_archive_tail_is_kept() {
        let f = fixture(false);
        // Clock stepped back after the archive was written
        f.archive.append(&sample(1_700_003_600)).unwrap();
        f.staging.save(0, &sample(1_700_000_000)).unwrap();

        let report = Migrator::new(Arc::clone(&f.archive), policy(1)).migrate_if_due(&f.staging).unwrap();
        assert_eq!(report.archived, 1);
        assert_eq!(f.archive.record_count().unwrap(), 2);
        assert_eq!(f.staging.staged_count().unwrap(), 0);

        let records = f.archive.read_records(f.archive.active(), 0..2).unwrap();
        assert_eq!(records[1].sample, sample(1_700_000_000));
    }

    #[test]
    fn test_interrupted_drain_repeats_at_most_one_record() {
        let f = fixture(false);
        f.staging.save(0, &sample(1_700_000_000)).unwrap();
        f.staging.save(1, &sample(1_700_000_060)).unwrap();
        f.staging.save(2, &sample(1_700_000_120)).unwrap();

        // Previous pass archived slot 0, released it, then archived slot 1
        // and lost power before releasing it
        f.archive.append(&sample(1_700_000_000)).unwrap();
        f.staging.discard(0).unwrap();
        f.archive.append(&sample(1_700_000_060)).unwrap();

        let report = Migrator::new(Arc::clone(&f.archive), policy(1)).migrate_if_due(&f.staging).unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(f.staging.staged_count().unwrap(), 0);

        let stamps: Vec<i64> = f
            .archive
            .read_records(f.archive.active(), 0..4)
            .unwrap()
            .iter()
            .map(|r| r.sample.timestamp().timestamp())
            .collect();
        assert_eq!(stamps, vec![1_700_000_000, 1_700_000_060, 1_700_000_060, 1_700_000_120]);
    }

    #[test]
    fn test_append_failure_releases_only_archived_slots() {
        let f = fixture(false);
        f.staging.save(0, &sample(1_700_000_000)).unwrap();
        f.staging.save(1, &sample(1_700_000_060)).unwrap();
        // Room for exactly one 16 + 8 byte record
        f.archive_pool.set_capacity(24 + 4);

        let migrator = Migrator::new(Arc::clone(&f.archive), policy(1));
        assert!(migrator.migrate_if_due(&f.staging).is_err());
        assert_eq!(f.archive.record_count().unwrap(), 1);
        let left: Vec<u32> = f.staging.load_all().unwrap().iter().map(|r| r.slot_index).collect();
        assert_eq!(left, vec![1]);
    }

    #[test]
    fn test_archive_failure_keeps_staging() {
        let f = fixture(false);
        f.staging.save(0, &sample(1_700_000_000)).unwrap();
        f.archive_pool.fail_writes_to(".data");

        let migrator = Migrator::new(Arc::clone(&f.archive), policy(1));
        assert!(migrator.migrate_if_due(&f.staging).is_err());
        assert_eq!(f.staging.staged_count().unwrap(), 1);

        f.archive_pool.heal();
        let report = migrator.migrate_if_due(&f.staging).unwrap();
        assert_eq!(report.archived, 1);
        assert!(f.staging_pool.contents(crate::storage::staging::DATA_FILE).is_none());
    }

    #[test]
    fn test_rotation_and_offload() {
        let f = fixture(true);
        let migrator = Migrator::new(
            Arc::clone(&f.archive),
            MigrationPolicy {
                batch_threshold: 1,
                max_segment_bytes: 40,
                chunk_bytes: 10,
            },
        );

        // Each record is 16 data + 8 meta bytes
        for (slot, secs) in [1_700_000_000, 1_700_000_060].into_iter().enumerate() {
            f.staging.save(slot as u32, &sample(secs)).unwrap();
        }
        let report = migrator.migrate_if_due(&f.staging).unwrap();
        assert_eq!(report.archived, 2);
        assert_eq!(report.rotated, Some(SegmentId(1)));
        assert_eq!(report.offloaded, vec![SegmentId(1)]);
        assert_eq!(report.moved_bytes, 48);

        assert!(f.archive_pool.contents("seg-000001.data").is_none());
        assert_eq!(f.overflow_pool.contents("seg-000001.data").unwrap().len(), 32);
        assert_eq!(f.archive.record_count_of(SegmentId(1)).unwrap(), 2);
        assert_eq!(f.archive.read_records(SegmentId(1), 0..2).unwrap()[1].sample, sample(1_700_000_060));

        let again = migrator.migrate_if_due(&f.staging).unwrap();
        assert!(again.is_empty());
        assert_eq!(f.overflow_pool.contents("seg-000001.meta").unwrap().len(), 16);
    }

    #[test]
    fn test_upload_progress_does_not_trigger_offload() {
        let f = fixture(true);
        let migrator = Migrator::new(
            Arc::clone(&f.archive),
            MigrationPolicy {
                batch_threshold: 1,
                max_segment_bytes: 20,
                chunk_bytes: 64,
            },
        );
        f.staging.save(0, &sample(1_700_000_000)).unwrap();
        let report = migrator.migrate_if_due(&f.staging).unwrap();
        assert_eq!(report.offloaded, vec![SegmentId(1)]);

        // Upload progress for the moved segment stays with the archive pool
        f.archive_pool.put("seg-000001.sent", 1u32.to_le_bytes().to_vec());

        let again = migrator.migrate_if_due(&f.staging).unwrap();
        assert!(again.is_empty());
        assert!(f.archive.closed_in_primary().unwrap().is_empty());
        assert!(f.archive_pool.contents("seg-000001.sent").is_some());
    }

    #[test]
    fn test_interrupted_copy_resumes() {
        let src = MemoryPool::new("archive");
        let dst = MemoryPool::new("sd");
        src.put("seg-000001.data", (0u8..25).collect());
        dst.put("seg-000001.data", (0u8..10).collect());

        let mut copied = 0;
        loop {
            let n = copy_chunk(&src, &dst, "seg-000001.data", 8).unwrap();
            if n == 0 {
                break;
            }
            copied += n;
        }
        assert_eq!(copied, 15);
        assert_eq!(dst.contents("seg-000001.data"), src.contents("seg-000001.data"));
    }

    #[test]
    fn test_copy_empty_file_creates_destination() {
        let src = MemoryPool::new("archive");
        let dst = MemoryPool::new("sd");
        src.put("seg-000001.meta", Vec::new());

        assert_eq!(copy_chunk(&src, &dst, "seg-000001.meta", 8).unwrap(), 0);
        assert_eq!(dst.contents("seg-000001.meta"), Some(Vec::new()));
        assert_eq!(copy_chunk(&src, &dst, "missing", 8).unwrap(), 0);
    }

    #[test]
    fn test_full_overflow_pool_is_reported() {
        let f = fixture(true);
        f.overflow_pool.set_capacity(8);
        let migrator = Migrator::new(
            Arc::clone(&f.archive),
            MigrationPolicy {
                batch_threshold: 1,
                max_segment_bytes: 10,
                chunk_bytes: 16,
            },
        );

        f.staging.save(0, &sample(1_700_000_000)).unwrap();
        let result = migrator.migrate_if_due(&f.staging);
        assert!(matches!(result, Err(StorageError::PoolExhausted { .. })));

        // Nothing was lost from the archive pool
        assert_eq!(f.archive.record_count_of(SegmentId(1)).unwrap(), 1);
        assert!(f.archive_pool.contents("seg-000001.data").is_some());
    }
}
