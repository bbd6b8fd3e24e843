//! Simulated thermal sensor for bench runs without hardware
//!
//! Emits one matrix frame per period, prefixed with a few bytes of line noise
//! and alternating between the two payload shapes.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::SerialReader;
use crate::frame::encoder::encode_matrix_frame;
use crate::frame::protocol::PayloadShape;
use crate::sample::MatrixGeometry;

/// Line noise sent ahead of every frame (contains a lone marker byte)
const NOISE: [u8; 5] = [0x00, 0xFF, 0x5A, 0x13, 0x37];

/// [`SerialReader`] producing synthetic frames
pub struct SimulatedSensor {
    geometry: MatrixGeometry,
    period: Duration,
    next_frame: Instant,
    pending: VecDeque<u8>,
    frames_sent: u64,
}

impl SimulatedSensor {
    /// Sensor emitting one frame every `period`, the first one immediately
    pub fn new(geometry: MatrixGeometry, period: Duration) -> Self {
        Self {
            geometry,
            period,
            next_frame: Instant::now(),
            pending: VecDeque::new(),
            frames_sent: 0,
        }
    }

    /// Frames generated so far
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent
    }

    /// Synthetic scene: a warm spot drifting over a 20-30°C gradient
    fn matrix(&self) -> Vec<f32> {
        let cols = self.geometry.cols.max(1);
        let rows = self.geometry.rows.max(1);
        let spot = (self.frames_sent as usize) % (rows * cols);

        (0..rows * cols)
            .map(|i| {
                let gradient = 20.0 + 10.0 * (i % cols) as f32 / cols as f32;
                if i == spot {
                    gradient + 15.0
                } else {
                    gradient + (i / cols) as f32 * 0.05
                }
            })
            .collect()
    }

    fn emit_frame(&mut self) {
        let shape = if self.frames_sent % 2 == 0 {
            PayloadShape::Trailer
        } else {
            PayloadShape::Tagged
        };
        let frame = encode_matrix_frame(&self.matrix(), shape);
        debug!("Simulated frame #{} ({} bytes)", self.frames_sent, frame.len());

        self.pending.extend(NOISE);
        self.pending.extend(frame);
        self.frames_sent += 1;
        self.next_frame += self.period;
    }
}

#[async_trait]
impl SerialReader for SimulatedSensor {
    async fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        if self.pending.is_empty() {
            let deadline = Instant::now() + timeout;
            if self.next_frame > deadline {
                tokio::time::sleep_until(deadline).await;
                return Ok(0);
            }
            tokio::time::sleep_until(self.next_frame).await;
            self.emit_frame();
        }

        let n = buf.len().min(self.pending.len());
        for (slot, byte) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decoder::SampleDecoder;
    use crate::frame::deframer::Deframer;
    use crate::sample::RangeBounds;
    use chrono::Utc;

    #[tokio::test(start_paused = true)]
    async fn test_frames_decode() {
        let geometry = MatrixGeometry::new(4, 8);
        let mut sensor = SimulatedSensor::new(geometry, Duration::from_secs(1));
        let mut deframer = Deframer::new();
        let decoder = SampleDecoder::new(geometry, RangeBounds::default());
        let mut buf = [0u8; 16];
        let mut samples = Vec::new();

        while samples.len() < 3 {
            let n = sensor.read_bytes(&mut buf, Duration::from_secs(5)).await.unwrap();
            for frame in deframer.feed(&buf[..n]) {
                samples.push(decoder.decode(&frame, Utc::now()).unwrap());
            }
        }

        assert_eq!(sensor.frames_sent(), 3);
        assert!(samples.iter().all(|s| s.stats().max <= 45.0 && s.stats().min >= 20.0));
        assert!(deframer.stats().discarded_bytes >= 3 * NOISE.len() as u64);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_between_frames() {
        let mut sensor = SimulatedSensor::new(MatrixGeometry::new(2, 2), Duration::from_secs(10));
        let mut buf = [0u8; 256];

        let n = sensor.read_bytes(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert!(n > 0);

        let start = Instant::now();
        let n = sensor.read_bytes(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
