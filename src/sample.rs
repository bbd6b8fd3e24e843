//! # Samples
//!
//! A decoded, range-validated temperature matrix with its capture time, plus
//! the fixed-size little-endian layouts used to persist it.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::DecodeError;

/// Bytes used to persist a timestamp (unix seconds, `i64` LE)
pub const TIMESTAMP_SIZE: usize = 8;

/// Bytes used to persist one matrix cell (`f32` LE)
pub const CELL_SIZE: usize = 4;

/// Matrix dimensions of the sensor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixGeometry {
    pub rows: usize,
    pub cols: usize,
}

impl MatrixGeometry {
    /// 24×32 thermal array
    pub const THERMAL_24X32: MatrixGeometry = MatrixGeometry { rows: 24, cols: 32 };

    /// Create a geometry
    pub const fn new(rows: usize, cols: usize) -> Self {
        Self { rows, cols }
    }

    /// Number of cells in the matrix
    pub const fn cells(&self) -> usize {
        self.rows * self.cols
    }

    /// Size of one persisted matrix in bytes
    pub const fn matrix_bytes(&self) -> usize {
        self.cells() * CELL_SIZE
    }
}

/// Physical sanity range for decoded values (°C)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeBounds {
    pub low: f32,
    pub high: f32,
}

impl RangeBounds {
    /// Create a range
    pub const fn new(low: f32, high: f32) -> Self {
        Self { low, high }
    }

    /// Whether `min..=max` lies inside the range
    pub fn contains_span(&self, min: f32, max: f32) -> bool {
        !(min < self.low || max > self.high)
    }
}

impl Default for RangeBounds {
    fn default() -> Self {
        Self::new(-40.0, 200.0)
    }
}

/// Summary statistics of one matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleStats {
    pub min: f32,
    pub max: f32,
    pub mean: f32,
}

impl SampleStats {
    /// Compute statistics over a set of values
    ///
    /// NaN compares as neither smaller nor larger, so it is caught by the
    /// caller through `mean`.
    pub fn of(values: &[f32]) -> Self {
        let mut min = f32::INFINITY;
        let mut max = f32::NEG_INFINITY;
        let mut sum = 0.0f64;
        for &v in values {
            min = min.min(v);
            max = max.max(v);
            sum += v as f64;
        }
        let mean = if values.is_empty() {
            0.0
        } else {
            (sum / values.len() as f64) as f32
        };
        Self { min, max, mean }
    }
}

/// A validated sensor reading
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    timestamp: DateTime<Utc>,
    geometry: MatrixGeometry,
    values: Vec<f32>,
}

impl Sample {
    /// Build a sample, rejecting any matrix with a value outside `bounds`
    ///
    /// # Errors
    ///
    /// * [`DecodeError::UnexpectedLength`] if `values` does not match `geometry`
    /// * [`DecodeError::OutOfRange`] if any value is outside `bounds`
    pub fn new(
        timestamp: DateTime<Utc>,
        geometry: MatrixGeometry,
        values: Vec<f32>,
        bounds: RangeBounds,
    ) -> Result<Self, DecodeError> {
        if values.len() != geometry.cells() {
            return Err(DecodeError::UnexpectedLength {
                actual: values.len(),
                accepted: [geometry.cells(), geometry.cells()],
            });
        }

        let stats = SampleStats::of(&values);
        if !bounds.contains_span(stats.min, stats.max) || stats.mean.is_nan() {
            return Err(DecodeError::OutOfRange {
                min: stats.min,
                max: stats.max,
                low: bounds.low,
                high: bounds.high,
            });
        }

        Ok(Self {
            timestamp,
            geometry,
            values,
        })
    }

    /// Rebuild a sample from bytes that were validated before being persisted
    pub(crate) fn from_persisted(
        timestamp: DateTime<Utc>,
        geometry: MatrixGeometry,
        values: Vec<f32>,
    ) -> Self {
        Self {
            timestamp,
            geometry,
            values,
        }
    }

    /// Capture time
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Matrix dimensions
    pub fn geometry(&self) -> MatrixGeometry {
        self.geometry
    }

    /// Row-major matrix values
    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Value at `(row, col)`
    pub fn get(&self, row: usize, col: usize) -> Option<f32> {
        if row >= self.geometry.rows || col >= self.geometry.cols {
            return None;
        }
        self.values.get(row * self.geometry.cols + col).copied()
    }

    /// One matrix row
    pub fn row(&self, row: usize) -> Option<&[f32]> {
        let start = row.checked_mul(self.geometry.cols)?;
        self.values.get(start..start + self.geometry.cols)
    }

    /// Min, max and mean of the matrix
    pub fn stats(&self) -> SampleStats {
        SampleStats::of(&self.values)
    }

    /// Append the matrix as little-endian `f32` cells
    pub fn write_matrix(&self, out: &mut Vec<u8>) {
        out.reserve(self.geometry.matrix_bytes());
        for v in &self.values {
            out.extend_from_slice(&v.to_le_bytes());
        }
    }

    /// Timestamp in the persisted encoding
    pub fn timestamp_bytes(&self) -> [u8; TIMESTAMP_SIZE] {
        encode_timestamp(self.timestamp)
    }
}

/// Read little-endian `f32` cells back into a vector
pub fn read_matrix(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(CELL_SIZE)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Encode a timestamp as unix seconds (`i64` LE)
pub fn encode_timestamp(ts: DateTime<Utc>) -> [u8; TIMESTAMP_SIZE] {
    ts.timestamp().to_le_bytes()
}

/// Decode unix seconds (`i64` LE)
pub fn decode_timestamp(bytes: [u8; TIMESTAMP_SIZE]) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(i64::from_le_bytes(bytes), 0).single()
}
