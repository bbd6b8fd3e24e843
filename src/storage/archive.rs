//! # Archive Log
//!
//! Append-only segments of confirmed samples. Each segment is a pair of files:
//!
//! - `seg-NNNNNN.data`: concatenated matrices (`f32` LE cells)
//! - `seg-NNNNNN.meta`: one `i64` LE unix timestamp per committed record
//!
//! The data file is always written and synced before the meta file, so the
//! meta count is the authoritative number of records. Data bytes beyond
//! `count * matrix_bytes` are uncommitted and are cut off before the next
//! append.
//!
//! The active segment id lives in `archive.head`. Closed segments may sit in
//! the archive pool or in the optional overflow pool; fully uploaded segments
//! carry an `.uploaded` infix.

use std::fmt;
use std::io::Write;
use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::backend::{read_at, read_whole, write_whole, OpenMode, StoragePool};
use super::device::SharedDevice;
use crate::error::StorageError;
use crate::sample::{decode_timestamp, read_matrix, MatrixGeometry, Sample, TIMESTAMP_SIZE};

/// File holding the active segment id
pub const HEAD_FILE: &str = "archive.head";

const SEGMENT_PREFIX: &str = "seg-";
const UPLOADED_INFIX: &str = ".uploaded";

/// Identity of an archive segment; ids are never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u32);

impl SegmentId {
    /// Data file name
    pub fn data_file(&self) -> String {
        format!("{}.data", self)
    }

    /// Meta file name
    pub fn meta_file(&self) -> String {
        format!("{}.meta", self)
    }

    /// Upload progress file name
    pub fn progress_file(&self) -> String {
        format!("{}.sent", self)
    }

    /// Data and meta file names once the segment is fully uploaded
    pub fn uploaded_files(&self) -> [String; 2] {
        [
            format!("{}{}.data", self, UPLOADED_INFIX),
            format!("{}{}.meta", self, UPLOADED_INFIX),
        ]
    }

    /// Parse the segment id out of any file name belonging to it
    pub fn from_file_name(name: &str) -> Option<(SegmentId, bool)> {
        let rest = name.strip_prefix(SEGMENT_PREFIX)?;
        let (digits, suffix) = rest.split_at(rest.find('.')?);
        let id = digits.parse().ok()?;
        Some((SegmentId(id), suffix.starts_with(UPLOADED_INFIX)))
    }

    fn next(self) -> SegmentId {
        SegmentId(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{:06}", SEGMENT_PREFIX, self.0)
    }
}

/// Where a segment's files currently live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentLocation {
    Primary,
    Overflow,
}

/// Summary of one segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    pub id: SegmentId,
    pub location: SegmentLocation,
    pub uploaded: bool,
}

/// A committed archive record
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedRecord {
    pub index: u32,
    pub sample: Sample,
}

/// Durable append-only log of samples
pub struct ArchiveLog {
    pool: Arc<dyn StoragePool>,
    overflow: Option<Arc<dyn StoragePool>>,
    device: SharedDevice,
    geometry: MatrixGeometry,
    head: AtomicU32,
}

impl ArchiveLog {
    /// Open the log, reconciling the active segment after a possible crash
    ///
    /// # Errors
    ///
    /// Returns error if the head file is unreadable or reconciliation fails
    pub fn open(
        pool: Arc<dyn StoragePool>,
        overflow: Option<Arc<dyn StoragePool>>,
        device: SharedDevice,
        geometry: MatrixGeometry,
    ) -> Result<Self, StorageError> {
        let head = {
            let _guard = device.lock();
            match read_whole(pool.as_ref(), HEAD_FILE).map_err(|e| StorageError::io(pool.name(), HEAD_FILE, e))? {
                Some(bytes) if bytes.len() == 4 => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
                Some(_) => {
                    return Err(StorageError::Corrupt {
                        file: HEAD_FILE.to_string(),
                        reason: "head id is not 4 bytes".to_string(),
                    })
                }
                None => {
                    write_whole(pool.as_ref(), HEAD_FILE, &1u32.to_le_bytes())
                        .map_err(|e| StorageError::io(pool.name(), HEAD_FILE, e))?;
                    1
                }
            }
        };

        let log = Self {
            pool,
            overflow,
            device,
            geometry,
            head: AtomicU32::new(head),
        };

        let count = {
            let _guard = log.device.lock();
            log.reconcile()?
        };
        info!("Archive opened at {} with {} committed records", log.active(), count);
        Ok(log)
    }

    /// Segment currently receiving appends
    pub fn active(&self) -> SegmentId {
        SegmentId(self.head.load(Ordering::SeqCst))
    }

    /// Size of one stored matrix
    pub fn record_size(&self) -> usize {
        self.geometry.matrix_bytes()
    }

    /// Append a sample to the active segment
    pub fn append(&self, sample: &Sample) -> Result<(), StorageError> {
        let _guard = self.device.lock();
        self.reconcile()?;

        let segment = self.active();
        let data_file = segment.data_file();
        let meta_file = segment.meta_file();

        let mut matrix = Vec::with_capacity(self.record_size());
        sample.write_matrix(&mut matrix);
        self.append_synced(&data_file, &matrix)?;
        self.append_synced(&meta_file, &sample.timestamp_bytes())?;

        debug!("Archived sample {} into {}", sample.timestamp(), segment);
        Ok(())
    }

    /// Bytes used by the active segment
    pub fn size_bytes(&self) -> Result<u64, StorageError> {
        let _guard = self.device.lock();
        let segment = self.active();
        let data = self.stat(self.pool.as_ref(), &segment.data_file())?.unwrap_or(0);
        let meta = self.stat(self.pool.as_ref(), &segment.meta_file())?.unwrap_or(0);
        Ok(data + meta)
    }

    /// Committed records in the active segment
    pub fn record_count(&self) -> Result<u32, StorageError> {
        self.record_count_of(self.active())
    }

    /// Committed records in any segment
    pub fn record_count_of(&self, segment: SegmentId) -> Result<u32, StorageError> {
        let _guard = self.device.lock();
        let Some((pool, [data_file, meta_file])) = self.locate(segment)? else {
            return Ok(0);
        };
        self.committed(pool, &data_file, &meta_file)
    }

    /// Read committed records of `segment` in `range`
    ///
    /// The range is clamped to the committed count; bytes past it are never
    /// surfaced.
    pub fn read_records(&self, segment: SegmentId, range: Range<u32>) -> Result<Vec<ArchivedRecord>, StorageError> {
        let _guard = self.device.lock();
        let Some((pool, [data_file, meta_file])) = self.locate(segment)? else {
            return Ok(Vec::new());
        };

        let committed = self.committed(pool, &data_file, &meta_file)?;
        let end = range.end.min(committed);
        if range.start >= end {
            return Ok(Vec::new());
        }
        let count = (end - range.start) as usize;

        let meta = read_at(pool, &meta_file, range.start as u64 * TIMESTAMP_SIZE as u64, count * TIMESTAMP_SIZE)
            .map_err(|e| self.io_err(pool, &meta_file, e))?;
        let data = read_at(
            pool,
            &data_file,
            range.start as u64 * self.record_size() as u64,
            count * self.record_size(),
        )
        .map_err(|e| self.io_err(pool, &data_file, e))?;

        let mut records = Vec::with_capacity(count);
        for (i, (ts, matrix)) in meta
            .chunks_exact(TIMESTAMP_SIZE)
            .zip(data.chunks_exact(self.record_size()))
            .enumerate()
        {
            let index = range.start + i as u32;
            let timestamp = self.parse_timestamp(ts, &meta_file)?;
            records.push(ArchivedRecord {
                index,
                sample: Sample::from_persisted(timestamp, self.geometry, read_matrix(matrix)),
            });
        }
        Ok(records)
    }

    /// Timestamp of the most recently archived record
    ///
    /// Looks at the active segment, then at the segment closed just before it.
    pub fn last_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let _guard = self.device.lock();
        let active = self.active();
        let mut candidates = vec![active];
        if active.0 > 1 {
            candidates.push(SegmentId(active.0 - 1));
        }

        for segment in candidates {
            let Some((pool, [data_file, meta_file])) = self.locate(segment)? else {
                continue;
            };
            let committed = self.committed(pool, &data_file, &meta_file)?;
            if committed == 0 {
                continue;
            }
            let offset = (committed as u64 - 1) * TIMESTAMP_SIZE as u64;
            let ts = read_at(pool, &meta_file, offset, TIMESTAMP_SIZE).map_err(|e| self.io_err(pool, &meta_file, e))?;
            return Ok(Some(self.parse_timestamp(&ts, &meta_file)?));
        }
        Ok(None)
    }

    /// Drop every record of the active segment
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.device.lock();
        let segment = self.active();
        for file in [segment.meta_file(), segment.data_file(), segment.progress_file()] {
            self.pool.delete(&file).map_err(|e| self.io_err(self.pool.as_ref(), &file, e))?;
        }
        info!("Archive segment {} cleared", segment);
        Ok(())
    }

    /// Close the active segment and start a fresh one
    ///
    /// Returns the closed segment, or `None` when the active one is empty.
    pub fn rotate(&self) -> Result<Option<SegmentId>, StorageError> {
        let _guard = self.device.lock();
        let closed = self.active();
        let committed = self.committed(self.pool.as_ref(), &closed.data_file(), &closed.meta_file())?;
        if committed == 0 {
            return Ok(None);
        }

        let next = closed.next();
        write_whole(self.pool.as_ref(), HEAD_FILE, &next.0.to_le_bytes())
            .map_err(|e| self.io_err(self.pool.as_ref(), HEAD_FILE, e))?;
        self.head.store(next.0, Ordering::SeqCst);

        info!("Closed archive segment {} ({} records), now writing {}", closed, committed, next);
        Ok(Some(closed))
    }

    /// All known segments, oldest first
    pub fn segments(&self) -> Result<Vec<SegmentInfo>, StorageError> {
        let _guard = self.device.lock();
        let mut found: Vec<SegmentInfo> = Vec::new();

        let mut pools = vec![(self.pool.as_ref(), SegmentLocation::Primary)];
        if let Some(overflow) = &self.overflow {
            pools.push((overflow.as_ref(), SegmentLocation::Overflow));
        }

        for (pool, location) in pools {
            let names = pool.list().map_err(|e| self.io_err(pool, "<list>", e))?;
            for name in names {
                if !name.ends_with(".meta") {
                    continue;
                }
                let Some((id, uploaded)) = SegmentId::from_file_name(&name) else {
                    continue;
                };
                if found.iter().any(|s| s.id == id) {
                    continue;
                }
                found.push(SegmentInfo { id, location, uploaded });
            }
        }

        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    /// Closed segments whose data or meta file is still in the archive pool
    pub fn closed_in_primary(&self) -> Result<Vec<SegmentId>, StorageError> {
        let active = self.active();
        let _guard = self.device.lock();
        let mut ids: Vec<SegmentId> = self
            .pool
            .list()
            .map_err(|e| self.io_err(self.pool.as_ref(), "<list>", e))?
            .iter()
            .filter(|name| name.ends_with(".data") || name.ends_with(".meta"))
            .filter_map(|name| SegmentId::from_file_name(name))
            .map(|(id, _)| id)
            .filter(|&id| id < active)
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Rename a closed segment's files with the `.uploaded` infix
    pub fn mark_uploaded(&self, segment: SegmentId) -> Result<(), StorageError> {
        if segment >= self.active() {
            return Err(StorageError::Corrupt {
                file: segment.data_file(),
                reason: "active segment cannot be marked uploaded".to_string(),
            });
        }

        let _guard = self.device.lock();
        let [uploaded_data, uploaded_meta] = segment.uploaded_files();
        let renames = [(segment.data_file(), uploaded_data), (segment.meta_file(), uploaded_meta)];

        for pool in self.pools() {
            for (from, to) in &renames {
                if self.stat(pool, from)?.is_some() {
                    pool.rename(from, to).map_err(|e| self.io_err(pool, from, e))?;
                }
            }
        }
        info!("Archive segment {} fully uploaded", segment);
        Ok(())
    }

    /// Archive pool
    pub fn pool(&self) -> &Arc<dyn StoragePool> {
        &self.pool
    }

    /// Overflow pool, when configured
    pub fn overflow(&self) -> Option<&Arc<dyn StoragePool>> {
        self.overflow.as_ref()
    }

    /// Device lock shared with the other storage components
    pub fn device(&self) -> &SharedDevice {
        &self.device
    }

    /// Cut uncommitted bytes off the active segment; caller holds the device lock
    fn reconcile(&self) -> Result<u32, StorageError> {
        let segment = self.active();
        let data_file = segment.data_file();
        let meta_file = segment.meta_file();
        let pool = self.pool.as_ref();

        let committed = self.committed(pool, &data_file, &meta_file)?;
        let data_len = self.stat(pool, &data_file)?.unwrap_or(0);
        let meta_len = self.stat(pool, &meta_file)?.unwrap_or(0);
        let data_target = committed as u64 * self.record_size() as u64;
        let meta_target = committed as u64 * TIMESTAMP_SIZE as u64;

        if data_len > data_target {
            warn!(
                "Ignoring {} uncommitted bytes at the end of {}",
                data_len - data_target,
                data_file
            );
            self.truncate(pool, &data_file, data_target)?;
        }
        if meta_len > meta_target {
            warn!("Dropping {} partial bytes at the end of {}", meta_len - meta_target, meta_file);
            self.truncate(pool, &meta_file, meta_target)?;
        }
        Ok(committed)
    }

    /// Committed record count: meta entries backed by a complete matrix
    fn committed(&self, pool: &dyn StoragePool, data_file: &str, meta_file: &str) -> Result<u32, StorageError> {
        let meta_records = self.stat(pool, meta_file)?.unwrap_or(0) / TIMESTAMP_SIZE as u64;
        let data_records = self.stat(pool, data_file)?.unwrap_or(0) / self.record_size() as u64;
        if meta_records > data_records {
            warn!(
                "{} lists {} records but {} holds only {}",
                meta_file, meta_records, data_file, data_records
            );
        }
        Ok(meta_records.min(data_records) as u32)
    }

    /// Find the pool and file names holding `segment`
    fn locate(&self, segment: SegmentId) -> Result<Option<(&dyn StoragePool, [String; 2])>, StorageError> {
        let plain = [segment.data_file(), segment.meta_file()];
        let uploaded = segment.uploaded_files();
        for pool in self.pools() {
            for names in [&plain, &uploaded] {
                if self.stat(pool, &names[1])?.is_some() {
                    return Ok(Some((pool, names.clone())));
                }
            }
        }
        Ok(None)
    }

    fn pools(&self) -> Vec<&dyn StoragePool> {
        let mut pools = vec![self.pool.as_ref()];
        if let Some(overflow) = &self.overflow {
            pools.push(overflow.as_ref());
        }
        pools
    }

    fn append_synced(&self, file: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let pool = self.pool.as_ref();
        let io = |e| self.io_err(pool, file, e);
        let mut handle = pool.open(file, OpenMode::Append).map_err(io)?;
        handle.write_all(bytes).map_err(io)?;
        handle.flush().map_err(io)?;
        handle.sync().map_err(io)
    }

    fn truncate(&self, pool: &dyn StoragePool, file: &str, len: u64) -> Result<(), StorageError> {
        let io = |e| self.io_err(pool, file, e);
        let mut handle = pool.open(file, OpenMode::ReadWrite).map_err(io)?;
        handle.truncate_to(len).map_err(io)?;
        handle.sync().map_err(io)
    }

    fn stat(&self, pool: &dyn StoragePool, file: &str) -> Result<Option<u64>, StorageError> {
        pool.stat(file).map_err(|e| self.io_err(pool, file, e))
    }

    fn parse_timestamp(&self, bytes: &[u8], file: &str) -> Result<DateTime<Utc>, StorageError> {
        bytes
            .try_into()
            .ok()
            .and_then(decode_timestamp)
            .ok_or_else(|| StorageError::Corrupt {
                file: file.to_string(),
                reason: "timestamp out of range".to_string(),
            })
    }

    fn io_err(&self, pool: &dyn StoragePool, file: &str, err: std::io::Error) -> StorageError {
        StorageError::io(pool.name(), file, err)
    }
}
