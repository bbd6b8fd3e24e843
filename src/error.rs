//! # Error Types
//!
//! Custom error types for Thermal Logger using `thiserror`.
//!
//! Each pipeline stage has its own error enum so callers can match on the
//! recovery policy that applies to it; all of them fold into
//! [`ThermalError`] for code that only needs to log and carry on.

use thiserror::Error;

/// Frame recovery problems on the serial link (always recoverable by resync)
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No frame marker found within the resync budget
    #[error("frame marker not found in {scanned} bytes")]
    MarkerNotFound { scanned: usize },

    /// Declared length cannot fit in the working window
    #[error("declared frame size {declared} exceeds window capacity {capacity}")]
    LengthExceedsWindow { declared: usize, capacity: usize },
}

/// Payload could not be turned into a [`crate::sample::Sample`]
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DecodeError {
    /// Payload length is not one of the accepted shapes
    #[error("unexpected payload length {actual} (accepted: {accepted:?})")]
    UnexpectedLength { actual: usize, accepted: [usize; 2] },

    /// At least one value is outside the physical sanity range
    #[error("values out of range: min {min:.2}, max {max:.2} (allowed {low:.2}..={high:.2})")]
    OutOfRange { min: f32, max: f32, low: f32, high: f32 },
}

/// Wall clock is not usable for scheduling yet
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClockError {
    /// Clock has not passed the trust floor (not synchronised)
    #[error("wall clock not trusted yet (unix time {now} <= {floor})")]
    Untrusted { now: i64, floor: i64 },

    /// Computed wait exceeds the sanity ceiling
    #[error("next acquisition is {wait_s}s away, more than the {ceiling_s}s ceiling")]
    ImplausibleWait { wait_s: i64, ceiling_s: i64 },

    /// A schedule slot has no valid local time on the target day
    #[error("cannot place slot {hour:02}:{minute:02} on {date}")]
    InvalidSlot { hour: u32, minute: u32, date: String },

    /// Schedule has no slots at all
    #[error("acquisition schedule is empty")]
    EmptySchedule,
}

/// Durable storage failures
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying pool I/O failure
    #[error("storage I/O error on {file}: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },

    /// Read-after-write checksum mismatch after exhausting retries
    #[error("verification failed for {file} after {attempts} attempts")]
    VerificationFailed { file: String, attempts: u32 },

    /// Slot index beyond the configured staging capacity
    #[error("staging slot {slot} out of range (capacity {capacity})")]
    SlotOutOfRange { slot: u32, capacity: u32 },

    /// Destination pool has no room left
    #[error("storage pool {pool} exhausted")]
    PoolExhausted { pool: String },

    /// Persisted bytes do not have the expected shape
    #[error("corrupt storage file {file}: {reason}")]
    Corrupt { file: String, reason: String },

    /// Blocking storage task panicked or was cancelled
    #[error("storage task failed: {0}")]
    TaskFailed(String),
}

impl StorageError {
    /// Wrap an I/O error with the file it happened on
    ///
    /// Out-of-space conditions are reported as [`StorageError::PoolExhausted`].
    pub fn io(pool: &str, file: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::StorageFull {
            return StorageError::PoolExhausted { pool: pool.to_string() };
        }
        StorageError::Io {
            file: format!("{}/{}", pool, file),
            source,
        }
    }
}

/// Remote collector did not accept a batch
#[derive(Debug, Error)]
pub enum TransportError {
    /// Collector answered with a non-success status
    #[error("collector rejected batch: HTTP {status}")]
    Rejected { status: u16 },

    /// Collector could not be reached
    #[error("collector unreachable: {0}")]
    Unreachable(String),

    /// Collector reply could not be understood
    #[error("malformed collector reply: {0}")]
    Malformed(String),
}

/// Upload bookkeeping violations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProgressError {
    /// Attempt to move the acknowledged count backwards
    #[error("acknowledged count for {segment} cannot go from {current} to {requested}")]
    Regression {
        segment: String,
        current: u32,
        requested: u32,
    },
}

/// Outcome of a failed capture attempt
#[derive(Debug, Error)]
pub enum CaptureError {
    /// No valid frame before the deadline
    #[error("no frame received within {0:?}")]
    Timeout(std::time::Duration),

    /// Frames arrived but the last one was rejected
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Serial link failure
    #[error("serial read failed: {0}")]
    Serial(#[from] std::io::Error),
}

/// Main error type for Thermal Logger
#[derive(Debug, Error)]
pub enum ThermalError {
    /// Frame recovery errors
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Sample decoding errors
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Clock trust / scheduling errors
    #[error("clock error: {0}")]
    Clock(#[from] ClockError),

    /// Storage errors
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Upload transport errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Upload progress errors
    #[error("upload progress error: {0}")]
    Progress(#[from] ProgressError),

    /// Capture errors
    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    /// Serial port errors
    #[error("Serial port error: {0}")]
    Serial(String),

    /// No serial device could be opened
    #[error("No thermal sensor found (tried: {0})")]
    SerialPortNotFound(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Thermal Logger
pub type Result<T> = std::result::Result<T, ThermalError>;
