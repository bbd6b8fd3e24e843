//! # Upload Progress Tracker
//!
//! One small file per archive segment (`seg-NNNNNN.sent`) holding the number
//! of records the collector has acknowledged, as a `u32` LE.
//!
//! The count only moves forward and is synced before [`UploadTracker::advance`]
//! returns. A crash between the collector's acknowledgment and the local
//! write therefore causes a retransmission, never a skipped record. A torn
//! progress file reads as zero for the same reason.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ProgressError, Result, StorageError};
use crate::storage::backend::{read_whole, write_whole, StoragePool};
use crate::storage::{SegmentId, SharedDevice};

/// Persistent acknowledged-record counters
pub struct UploadTracker {
    pool: Arc<dyn StoragePool>,
    device: SharedDevice,
}

impl UploadTracker {
    /// Create a tracker storing its files in `pool`
    pub fn new(pool: Arc<dyn StoragePool>, device: SharedDevice) -> Self {
        Self { pool, device }
    }

    /// Records of `segment` acknowledged so far
    pub fn acknowledged(&self, segment: SegmentId) -> Result<u32> {
        let _guard = self.device.lock();
        Ok(self.read(segment)?)
    }

    /// Record that the collector acknowledged everything below `new_count`
    ///
    /// # Errors
    ///
    /// Returns [`ProgressError::Regression`] if `new_count` is below the stored
    /// count. Advancing to the current count is a no-op.
    pub fn advance(&self, segment: SegmentId, new_count: u32) -> Result<()> {
        let _guard = self.device.lock();
        let current = self.read(segment)?;
        if new_count < current {
            return Err(ProgressError::Regression {
                segment: segment.to_string(),
                current,
                requested: new_count,
            }
            .into());
        }
        if new_count == current {
            return Ok(());
        }

        self.write(segment, new_count)?;
        debug!("{} acknowledged up to record {}", segment, new_count);
        Ok(())
    }

    /// Explicitly restart counting for `segment`
    pub fn reset(&self, segment: SegmentId) -> Result<()> {
        let _guard = self.device.lock();
        warn!("Resetting upload progress of {}", segment);
        Ok(self.write(segment, 0)?)
    }

    /// Drop the counter of a closed, fully uploaded segment
    pub fn forget(&self, segment: SegmentId) -> Result<()> {
        let _guard = self.device.lock();
        let file = segment.progress_file();
        self.pool
            .delete(&file)
            .map_err(|e| StorageError::io(self.pool.name(), &file, e))?;
        Ok(())
    }

    fn read(&self, segment: SegmentId) -> std::result::Result<u32, StorageError> {
        let file = segment.progress_file();
        let bytes = read_whole(self.pool.as_ref(), &file).map_err(|e| StorageError::io(self.pool.name(), &file, e))?;
        match bytes {
            None => Ok(0),
            Some(b) if b.len() == 4 => Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]])),
            Some(b) => {
                warn!("{} has {} bytes, treating as nothing acknowledged", file, b.len());
                Ok(0)
            }
        }
    }

    fn write(&self, segment: SegmentId, count: u32) -> std::result::Result<(), StorageError> {
        let file = segment.progress_file();
        write_whole(self.pool.as_ref(), &file, &count.to_le_bytes())
            .map_err(|e| StorageError::io(self.pool.name(), &file, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ThermalError;
    use crate::storage::backend::mocks::MemoryPool;
    use crate::storage::DirPool;
    use tempfile::TempDir;

    fn tracker(pool: &MemoryPool) -> UploadTracker {
        UploadTracker::new(Arc::new(pool.clone()), SharedDevice::new())
    }

    #[test]
    fn test_starts_at_zero() {
        let pool = MemoryPool::new("archive");
        assert_eq!(tracker(&pool).acknowledged(SegmentId(1)).unwrap(), 0);
    }

    #[test]
    fn test_advance_persists() {
        let dir = TempDir::new().unwrap();
        let pool = Arc::new(DirPool::open_dir("archive", dir.path()).unwrap());
        let t = UploadTracker::new(pool.clone(), SharedDevice::new());
        t.advance(SegmentId(3), 8).unwrap();
        drop(t);

        let t = UploadTracker::new(pool, SharedDevice::new());
        assert_eq!(t.acknowledged(SegmentId(3)).unwrap(), 8);
        assert_eq!(t.acknowledged(SegmentId(4)).unwrap(), 0);
    }

    #[test]
    fn test_regression_is_rejected() {
        let pool = MemoryPool::new("archive");
        let t = tracker(&pool);
        t.advance(SegmentId(1), 16).unwrap();

        let err = t.advance(SegmentId(1), 8).unwrap_err();
        assert!(matches!(
            err,
            ThermalError::Progress(ProgressError::Regression { current: 16, requested: 8, .. })
        ));
        assert_eq!(t.acknowledged(SegmentId(1)).unwrap(), 16);
    }

    #[test]
    fn test_same_count_twice_is_noop() {
        // Replaying an acknowledgment after a crash must not fail
        let pool = MemoryPool::new("archive");
        let t = tracker(&pool);
        t.advance(SegmentId(1), 8).unwrap();
        t.advance(SegmentId(1), 8).unwrap();
        assert_eq!(t.acknowledged(SegmentId(1)).unwrap(), 8);
    }

    #[test]
    fn test_failed_write_keeps_old_count() {
        let pool = MemoryPool::new("archive");
        let t = tracker(&pool);
        t.advance(SegmentId(1), 8).unwrap();

        pool.fail_writes_to(".sent");
        assert!(t.advance(SegmentId(1), 16).is_err());
        pool.heal();

        // The write truncated the file before failing: at worst a resend
        assert!(t.acknowledged(SegmentId(1)).unwrap() <= 8);
    }

    #[test]
    fn test_torn_file_reads_as_zero() {
        let pool = MemoryPool::new("archive");
        pool.put("seg-000001.sent", vec![8, 0]);
        assert_eq!(tracker(&pool).acknowledged(SegmentId(1)).unwrap(), 0);
    }

    #[test]
    fn test_reset_and_forget() {
        let pool = MemoryPool::new("archive");
        let t = tracker(&pool);
        t.advance(SegmentId(1), 8).unwrap();

        t.reset(SegmentId(1)).unwrap();
        assert_eq!(t.acknowledged(SegmentId(1)).unwrap(), 0);

        t.advance(SegmentId(1), 4).unwrap();
        t.forget(SegmentId(1)).unwrap();
        assert_eq!(pool.contents("seg-000001.sent"), None);
        assert_eq!(t.acknowledged(SegmentId(1)).unwrap(), 0);
    }
}
