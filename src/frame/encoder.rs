//! # Thermal Frame Encoder
//!
//! Builds wire frames in the sensor's format. Used by the bench simulator and
//! by tests to produce realistic byte streams.

use super::protocol::*;

/// Wrap a payload in a complete frame
///
/// # Arguments
///
/// * `payload` - Payload bytes (at most 65535)
///
/// # Returns
///
/// * `Vec<u8>` - Marker + little-endian length + payload
///
/// # Examples
///
/// ```
/// use thermal_logger::frame::encoder::encode_frame;
///
/// let frame = encode_frame(&[0x01, 0x02]);
/// assert_eq!(frame, vec![0x5A, 0x5A, 0x02, 0x00, 0x01, 0x02]);
/// ```
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let length = payload.len().min(u16::MAX as usize);

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + length);
    frame.extend_from_slice(&FRAME_MARKER);
    frame.extend_from_slice(&(length as u16).to_le_bytes());
    frame.extend_from_slice(&payload[..length]);
    frame
}

/// Encode temperatures into a payload of the given shape
///
/// Values are rounded to centi-degrees and clamped to the `i16` range.
/// Tag and trailer bytes are zero.
pub fn encode_matrix_payload(values: &[f32], shape: PayloadShape) -> Vec<u8> {
    let mut payload = vec![0u8; shape.payload_len(values.len())];
    let start = shape.value_offset();

    for (i, &v) in values.iter().enumerate() {
        let raw = to_raw(v);
        payload[start + 2 * i..start + 2 * i + 2].copy_from_slice(&raw.to_le_bytes());
    }

    payload
}

/// Encode temperatures straight into a complete frame
pub fn encode_matrix_frame(values: &[f32], shape: PayloadShape) -> Vec<u8> {
    encode_frame(&encode_matrix_payload(values, shape))
}

/// Convert °C to the sensor's signed centi-degree representation
fn to_raw(celsius: f32) -> i16 {
    (celsius * VALUE_SCALE)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
