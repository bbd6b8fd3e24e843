//! # Staging Store
//!
//! Small power-loss-safe slots holding samples until they are migrated into the
//! archive log.
//!
//! Slot layout (fixed size, little-endian):
//!
//! ```text
//! [timestamp: i64][cells: f32 * rows * cols][crc32: u32]
//! ```
//!
//! The CRC covers timestamp and cells. An index file holds one flag byte per
//! slot (`1` = last write verified) and is only ever replaced whole. Slots the
//! index does not cover are recovered from the data file and kept only when
//! their checksum verifies.

use std::io::{Seek, SeekFrom, Write};
use std::sync::Arc;

use tracing::{debug, error, warn};

use super::backend::{read_at, read_whole, replace_whole, OpenMode, StoragePool};
use super::checksum::crc32;
use super::device::SharedDevice;
use crate::error::StorageError;
use crate::retry::RetryPolicy;
use crate::sample::{decode_timestamp, read_matrix, MatrixGeometry, Sample, TIMESTAMP_SIZE};

/// Slot data file name
pub const DATA_FILE: &str = "staging.bin";

/// Slot index file name
pub const INDEX_FILE: &str = "staging.idx";

/// Chunk size used when zero-filling the data file up to a slot
const ZERO_FILL_CHUNK: usize = 4096;

const CHECKSUM_SIZE: usize = 4;
const SLOT_VALID: u8 = 1;
const SLOT_EMPTY: u8 = 0;

/// A staged sample with the slot it was read from
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRecord {
    pub slot_index: u32,
    pub sample: Sample,
    pub checksum: u32,
}

/// Checksum-verified slot storage
pub struct StagingStore {
    pool: Arc<dyn StoragePool>,
    device: SharedDevice,
    geometry: MatrixGeometry,
    capacity: u32,
    retry: RetryPolicy,
}

impl StagingStore {
    /// Create a store with `capacity` slots
    pub fn new(
        pool: Arc<dyn StoragePool>,
        device: SharedDevice,
        geometry: MatrixGeometry,
        capacity: u32,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            pool,
            device,
            geometry,
            capacity,
            retry,
        }
    }

    /// Number of slots
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Bytes used by one slot
    pub fn slot_size(&self) -> usize {
        TIMESTAMP_SIZE + self.geometry.matrix_bytes() + CHECKSUM_SIZE
    }

    /// Persist `sample` into `slot`, verified by reading it back from storage
    ///
    /// # Errors
    ///
    /// * [`StorageError::SlotOutOfRange`] if `slot >= capacity`
    /// * [`StorageError::VerificationFailed`] if the read-back never matched
    /// * I/O errors from the last attempt
    pub fn save(&self, slot: u32, sample: &Sample) -> Result<u32, StorageError> {
        if slot >= self.capacity {
            return Err(StorageError::SlotOutOfRange {
                slot,
                capacity: self.capacity,
            });
        }
        if sample.geometry() != self.geometry {
            return Err(StorageError::Corrupt {
                file: DATA_FILE.to_string(),
                reason: format!(
                    "sample is {}x{}, store expects {}x{}",
                    sample.geometry().rows,
                    sample.geometry().cols,
                    self.geometry.rows,
                    self.geometry.cols
                ),
            });
        }

        let record = self.encode(sample);
        let checksum = crc32(&record[..record.len() - CHECKSUM_SIZE]);
        let offset = slot as u64 * self.slot_size() as u64;

        let result = self.retry.run(
            |attempt| {
                let _guard = self.device.lock();
                self.write_slot(offset, &record)?;
                self.verify_slot(offset, checksum, attempt + 1)
            },
            |attempt, err| warn!("Staging slot {} write failed ({}), retry {}", slot, err, attempt),
        );

        if let Err(e) = result {
            error!("Giving up on staging slot {}: {}", slot, e);
            let _guard = self.device.lock();
            if let Err(flag_err) = self.set_flag(slot, SLOT_EMPTY) {
                warn!("Could not mark staging slot {} empty: {}", slot, flag_err);
            }
            return Err(e);
        }

        {
            let _guard = self.device.lock();
            self.set_flag(slot, SLOT_VALID)?;
        }
        debug!("Staged sample in slot {} (crc {:08X})", slot, checksum);
        Ok(checksum)
    }

    /// Load every slot that verifies
    ///
    /// Slots that fail their checksum are skipped, never fatal.
    pub fn load_all(&self) -> Result<Vec<StagingRecord>, StorageError> {
        let _guard = self.device.lock();

        let data = self.read_data()?;
        let flags = self.flags_for(&data)?;

        let slot_size = self.slot_size();
        let mut records = Vec::new();
        for slot in (0..self.capacity).filter(|&slot| flags[slot as usize] == SLOT_VALID) {
            let start = slot as usize * slot_size;
            let Some(bytes) = data.get(start..start + slot_size) else {
                warn!("Staging slot {} flagged but missing from data file", slot);
                continue;
            };
            match self.decode(slot, bytes) {
                Some(record) => records.push(record),
                None => warn!("Staging slot {} failed verification, treating as empty", slot),
            }
        }

        Ok(records)
    }

    /// First slot not holding a verified sample
    pub fn next_free_slot(&self) -> Result<Option<u32>, StorageError> {
        let _guard = self.device.lock();
        let flags = self.slot_flags()?;
        Ok((0..self.capacity).find(|&slot| flags[slot as usize] != SLOT_VALID))
    }

    /// Number of slots currently flagged as holding a sample
    pub fn staged_count(&self) -> Result<usize, StorageError> {
        let _guard = self.device.lock();
        Ok(self.slot_flags()?.iter().filter(|&&f| f == SLOT_VALID).count())
    }

    /// Mark one slot as empty
    pub fn discard(&self, slot: u32) -> Result<(), StorageError> {
        if slot >= self.capacity {
            return Err(StorageError::SlotOutOfRange {
                slot,
                capacity: self.capacity,
            });
        }
        let _guard = self.device.lock();
        self.set_flag(slot, SLOT_EMPTY)
    }

    /// Drop all staged samples
    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.device.lock();
        // Index first: a crash in between leaves no flags pointing at old data
        replace_whole(self.pool.as_ref(), INDEX_FILE, &vec![SLOT_EMPTY; self.capacity as usize])
            .map_err(|e| self.io_err(INDEX_FILE, e))?;
        self.pool.delete(DATA_FILE).map_err(|e| self.io_err(DATA_FILE, e))?;
        debug!("Staging cleared");
        Ok(())
    }

    fn encode(&self, sample: &Sample) -> Vec<u8> {
        let mut record = Vec::with_capacity(self.slot_size());
        record.extend_from_slice(&sample.timestamp_bytes());
        sample.write_matrix(&mut record);
        let checksum = crc32(&record);
        record.extend_from_slice(&checksum.to_le_bytes());
        record
    }

    fn decode(&self, slot: u32, bytes: &[u8]) -> Option<StagingRecord> {
        let body_len = bytes.len() - CHECKSUM_SIZE;
        let (body, stored) = bytes.split_at(body_len);
        let stored = u32::from_le_bytes(stored.try_into().ok()?);
        if crc32(body) != stored {
            return None;
        }

        let timestamp = decode_timestamp(body[..TIMESTAMP_SIZE].try_into().ok()?)?;
        let values = read_matrix(&body[TIMESTAMP_SIZE..]);
        Some(StagingRecord {
            slot_index: slot,
            sample: Sample::from_persisted(timestamp, self.geometry, values),
            checksum: stored,
        })
    }

    /// Write one record at `offset`, zero-filling any gap past end-of-file
    fn write_slot(&self, offset: u64, record: &[u8]) -> Result<(), StorageError> {
        let io = |e| self.io_err(DATA_FILE, e);
        let mut file = self.pool.open(DATA_FILE, OpenMode::ReadWrite).map_err(io)?;

        let mut end = file.seek(SeekFrom::End(0)).map_err(io)?;
        if end < offset {
            let zeros = [0u8; ZERO_FILL_CHUNK];
            while end < offset {
                let n = (offset - end).min(ZERO_FILL_CHUNK as u64) as usize;
                file.write_all(&zeros[..n]).map_err(io)?;
                end += n as u64;
            }
        }

        file.seek(SeekFrom::Start(offset)).map_err(io)?;
        file.write_all(record).map_err(io)?;
        file.flush().map_err(io)?;
        file.sync().map_err(io)
    }

    /// Re-read the slot from the medium and compare checksums
    fn verify_slot(&self, offset: u64, expected: u32, attempts: u32) -> Result<(), StorageError> {
        let bytes = read_at(self.pool.as_ref(), DATA_FILE, offset, self.slot_size())
            .map_err(|e| self.io_err(DATA_FILE, e))?;
        let (body, stored) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
        let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);

        if crc32(body) == expected && stored == expected {
            Ok(())
        } else {
            Err(StorageError::VerificationFailed {
                file: DATA_FILE.to_string(),
                attempts,
            })
        }
    }

    fn read_data(&self) -> Result<Vec<u8>, StorageError> {
        Ok(read_whole(self.pool.as_ref(), DATA_FILE)
            .map_err(|e| self.io_err(DATA_FILE, e))?
            .unwrap_or_default())
    }

    /// One flag per slot; caller holds the device lock
    fn slot_flags(&self) -> Result<Vec<u8>, StorageError> {
        let data = self.read_data()?;
        self.flags_for(&data)
    }

    /// Index flags, with slots past the end of the index checked against `data`
    fn flags_for(&self, data: &[u8]) -> Result<Vec<u8>, StorageError> {
        let capacity = self.capacity as usize;
        let mut flags = read_whole(self.pool.as_ref(), INDEX_FILE)
            .map_err(|e| self.io_err(INDEX_FILE, e))?
            .unwrap_or_default();
        if flags.len() >= capacity {
            flags.truncate(capacity);
            return Ok(flags);
        }

        let covered = flags.len();
        let slot_size = self.slot_size();
        for slot in covered..capacity {
            let start = slot * slot_size;
            let verified = data
                .get(start..start + slot_size)
                .and_then(|bytes| self.decode(slot as u32, bytes))
                .is_some();
            flags.push(if verified { SLOT_VALID } else { SLOT_EMPTY });
        }

        let recovered = flags[covered..].iter().filter(|&&f| f == SLOT_VALID).count();
        if recovered > 0 {
            warn!(
                "Staging index covers {} of {} slots, recovered {} more by checksum",
                covered, capacity, recovered
            );
        }
        Ok(flags)
    }

    fn set_flag(&self, slot: u32, flag: u8) -> Result<(), StorageError> {
        let mut flags = self.slot_flags()?;
        flags[slot as usize] = flag;
        replace_whole(self.pool.as_ref(), INDEX_FILE, &flags).map_err(|e| self.io_err(INDEX_FILE, e))
    }

    fn io_err(&self, file: &str, err: std::io::Error) -> StorageError {
        StorageError::io(self.pool.name(), file, err)
    }
}
