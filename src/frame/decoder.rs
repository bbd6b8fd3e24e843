//! # Sample Decoder
//!
//! Decodes thermal frame payloads into validated [`Sample`]s.

use chrono::{DateTime, Utc};

use super::protocol::*;
use crate::error::DecodeError;
use crate::sample::{MatrixGeometry, RangeBounds, Sample};

/// Turns frame payloads into range-checked samples
#[derive(Debug, Clone, Copy)]
pub struct SampleDecoder {
    geometry: MatrixGeometry,
    bounds: RangeBounds,
}

impl SampleDecoder {
    /// Create a decoder for a sensor of the given geometry and sanity range
    pub fn new(geometry: MatrixGeometry, bounds: RangeBounds) -> Self {
        Self { geometry, bounds }
    }

    /// Matrix geometry this decoder expects
    pub fn geometry(&self) -> MatrixGeometry {
        self.geometry
    }

    /// Payload lengths accepted by this decoder
    pub fn accepted_lengths(&self) -> [usize; 2] {
        [
            PayloadShape::Trailer.payload_len(self.geometry.cells()),
            PayloadShape::Tagged.payload_len(self.geometry.cells()),
        ]
    }

    /// Decode a frame payload into a sample
    ///
    /// # Arguments
    ///
    /// * `frame` - Frame recovered by the deframer
    /// * `timestamp` - Capture time to attach to the sample
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Payload length is not one of the two accepted shapes
    /// - Any decoded value lies outside the sanity range (the whole frame is rejected)
    pub fn decode(&self, frame: &Frame, timestamp: DateTime<Utc>) -> Result<Sample, DecodeError> {
        let payload = &frame.payload[..];
        let cells = self.geometry.cells();

        let shape = PayloadShape::detect(payload.len(), cells).ok_or(DecodeError::UnexpectedLength {
            actual: payload.len(),
            accepted: self.accepted_lengths(),
        })?;

        let start = shape.value_offset();
        let raw = &payload[start..start + cells * 2];

        // Signed little-endian centi-degrees
        let values: Vec<f32> = raw
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / VALUE_SCALE)
            .collect();

        Sample::new(timestamp, self.geometry, values, self.bounds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encoder::encode_matrix_payload;
    use bytes::Bytes;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn decoder() -> SampleDecoder {
        SampleDecoder::new(MatrixGeometry::THERMAL_24X32, RangeBounds::default())
    }

    fn gradient() -> Vec<f32> {
        (0..768).map(|i| -39.99 + (i as f32) * 0.3).collect()
    }

    #[test]
    fn test_accepted_lengths() {
        assert_eq!(decoder().accepted_lengths(), [1538, 1543]);
    }

    #[test]
    fn test_decode_both_shapes_roundtrip() {
        let values = gradient();
        for shape in [PayloadShape::Trailer, PayloadShape::Tagged] {
            let payload = encode_matrix_payload(&values, shape);
            let frame = Frame::new(Bytes::from(payload));
            let sample = decoder().decode(&frame, ts()).unwrap();

            assert_eq!(sample.timestamp(), ts());
            for (decoded, original) in sample.values().iter().zip(&values) {
                assert!((decoded - original).abs() <= 0.01, "{} vs {}", decoded, original);
            }
        }
    }

    #[test]
    fn test_decode_unexpected_length() {
        for len in [0usize, 1536, 1537, 1539, 1542, 1544] {
            let frame = Frame::new(Bytes::from(vec![0u8; len]));
            let result = decoder().decode(&frame, ts());
            assert_eq!(
                result,
                Err(DecodeError::UnexpectedLength { actual: len, accepted: [1538, 1543] })
            );
        }
    }

    #[test]
    fn test_single_hot_value_rejects_whole_frame() {
        let mut payload = encode_matrix_payload(&vec![25.0f32; 768], PayloadShape::Trailer);
        // Hottest reading the wire can carry
        let at = PayloadShape::Trailer.value_offset() + 400 * 2;
        payload[at..at + 2].copy_from_slice(&i16::MAX.to_le_bytes());
        let frame = Frame::new(Bytes::from(payload));

        match decoder().decode(&frame, ts()) {
            Err(DecodeError::OutOfRange { max, .. }) => assert!((max - 327.67).abs() < 0.01),
            other => panic!("Expected OutOfRange, got: {:?}", other),
        }
    }

    #[test]
    fn test_single_cold_value_rejects_whole_frame() {
        let mut values = vec![25.0f32; 768];
        values[0] = -41.0;
        let frame = Frame::new(Bytes::from(encode_matrix_payload(&values, PayloadShape::Tagged)));
        assert!(matches!(
            decoder().decode(&frame, ts()),
            Err(DecodeError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_tag_and_trailer_bytes_are_ignored() {
        let values = vec![21.5f32; 768];
        let mut payload = encode_matrix_payload(&values, PayloadShape::Tagged);
        // Scribble over the tag and trailer
        for b in &mut payload[..5] {
            *b = 0xEE;
        }
        let n = payload.len();
        payload[n - 2] = 0x7F;
        payload[n - 1] = 0x7F;

        let sample = decoder().decode(&Frame::new(Bytes::from(payload)), ts()).unwrap();
        assert!(sample.values().iter().all(|v| (v - 21.5).abs() < 0.001));
    }

    #[test]
    fn test_little_endian_signed_values() {
        let geometry = MatrixGeometry::new(1, 2);
        let decoder = SampleDecoder::new(geometry, RangeBounds::default());
        // -1234 = 0xFB2E, 3456 = 0x0D80
        let payload = vec![0x2E, 0xFB, 0x80, 0x0D, 0x00, 0x00];
        let sample = decoder.decode(&Frame::new(Bytes::from(payload)), ts()).unwrap();
        assert!((sample.values()[0] - (-12.34)).abs() < 0.001);
        assert!((sample.values()[1] - 34.56).abs() < 0.001);
    }
}
