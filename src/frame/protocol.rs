//! # Thermal Link Protocol Definitions
//!
//! Constants and types for the thermal sensor serial link.
//!
//! Wire format of one frame:
//!
//! ```text
//! +------+------+-----------+------------------+
//! | 0x5A | 0x5A | len (LE)  | payload[len]     |
//! +------+------+-----------+------------------+
//!   marker (2)    length (2)
//! ```

use bytes::Bytes;

/// Two-byte frame start marker
pub const FRAME_MARKER: [u8; 2] = [0x5A, 0x5A];

/// Marker + little-endian length field
pub const FRAME_HEADER_SIZE: usize = 4;

/// Working window reserved for deframing (bytes)
pub const WINDOW_CAPACITY: usize = 8192;

/// Bytes buffered without a marker before forcing a resynchronization
pub const RESYNC_THRESHOLD: usize = 16;

/// Trailer bytes appended to the exact-size payload variant
pub const PAYLOAD_TRAILER_SIZE: usize = 2;

/// Leading variant-tag bytes of the tagged payload variant
pub const PAYLOAD_TAG_SIZE: usize = 5;

/// Raw-value scale: sensor counts per degree Celsius
pub const VALUE_SCALE: f32 = 100.0;

/// A delimited unit recovered from the serial stream
///
/// Holds only the payload; the marker and length field are consumed by the
/// deframer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Payload bytes (length equals the header's length field)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame around a payload
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Declared payload length
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Accepted payload layouts
///
/// Both normalise to `rows * cols * 2` bytes of little-endian `i16` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// Values followed by a 2-byte trailer
    Trailer,
    /// 5-byte variant tag followed by values and the 2-byte trailer
    Tagged,
}

impl PayloadShape {
    /// Total payload length for a matrix with `value_count` cells
    pub const fn payload_len(self, value_count: usize) -> usize {
        match self {
            PayloadShape::Trailer => value_count * 2 + PAYLOAD_TRAILER_SIZE,
            PayloadShape::Tagged => value_count * 2 + PAYLOAD_TAG_SIZE + PAYLOAD_TRAILER_SIZE,
        }
    }

    /// Offset of the first value byte inside the payload
    pub const fn value_offset(self) -> usize {
        match self {
            PayloadShape::Trailer => 0,
            PayloadShape::Tagged => PAYLOAD_TAG_SIZE,
        }
    }

    /// Identify the shape of a payload by its length
    pub fn detect(payload_len: usize, value_count: usize) -> Option<Self> {
        [PayloadShape::Trailer, PayloadShape::Tagged]
            .into_iter()
            .find(|shape| shape.payload_len(value_count) == payload_len)
    }
}
