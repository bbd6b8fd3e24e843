//! # Frame Recovery
//!
//! Turns the raw serial byte stream into [`Frame`]s. The stream may begin
//! mid-frame or carry garbage; alignment is recovered by scanning for the
//! `0x5A 0x5A` marker.

use bytes::{Buf, BytesMut};
use tracing::{debug, warn};

use super::cursor::ByteCursor;
use super::protocol::*;
use crate::error::ProtocolError;

/// Counters describing how much work resynchronization has done
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeframerStats {
    /// Frames emitted
    pub frames: u64,
    /// Forced resynchronizations (no marker within the threshold)
    pub resyncs: u64,
    /// Frames dropped because their length could not fit the window
    pub oversize_frames: u64,
    /// Bytes thrown away while hunting for a marker
    pub discarded_bytes: u64,
}

/// Persistent deframing state across `feed` calls
#[derive(Debug)]
pub struct Deframer {
    cursor: ByteCursor,
    /// Input handed to `feed` but not yet admitted into the window
    backlog: BytesMut,
    stats: DeframerStats,
}

impl Default for Deframer {
    fn default() -> Self {
        Self::new()
    }
}

impl Deframer {
    /// Create a deframer with the standard 8 KiB window
    pub fn new() -> Self {
        Self::with_capacity(WINDOW_CAPACITY)
    }

    /// Create a deframer with a custom window size
    ///
    /// The window is never smaller than the resync threshold.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cursor: ByteCursor::with_capacity(capacity.max(RESYNC_THRESHOLD)),
            backlog: BytesMut::new(),
            stats: DeframerStats::default(),
        }
    }

    /// Feed bytes and lazily iterate over the frames they complete
    ///
    /// Bytes that do not complete a frame stay buffered for the next call. If
    /// the iterator is dropped early the unread input is kept as well.
    ///
    /// # Examples
    ///
    /// ```
    /// use thermal_logger::frame::deframer::Deframer;
    ///
    /// let mut deframer = Deframer::new();
    /// let frames: Vec<_> = deframer.feed(&[0x00, 0x5A, 0x5A, 0x02, 0x00, 0xAB]).collect();
    /// assert!(frames.is_empty());
    ///
    /// let frames: Vec<_> = deframer.feed(&[0xCD]).collect();
    /// assert_eq!(&frames[0].payload[..], &[0xAB, 0xCD]);
    /// ```
    pub fn feed<'a>(&'a mut self, input: &'a [u8]) -> Frames<'a> {
        Frames {
            deframer: self,
            input,
        }
    }

    /// Number of bytes waiting in the window and backlog
    pub fn buffered(&self) -> usize {
        self.cursor.len() + self.backlog.len()
    }

    /// Resynchronization counters
    pub fn stats(&self) -> DeframerStats {
        self.stats
    }

    /// Drop all buffered bytes
    pub fn reset(&mut self) {
        let buffered = self.cursor.len();
        self.cursor.discard(buffered);
        self.backlog.clear();
    }

    /// Move backlog bytes into the window, returning how many were admitted
    fn admit_backlog(&mut self) -> usize {
        let taken = self.cursor.extend(&self.backlog);
        self.backlog.advance(taken);
        taken
    }

    /// Try to cut one frame out of the window
    fn next_buffered(&mut self) -> Option<Frame> {
        loop {
            let window = self.cursor.as_slice();

            let Some(start) = find_marker(window, 0) else {
                if window.len() >= RESYNC_THRESHOLD {
                    let err = ProtocolError::MarkerNotFound { scanned: window.len() };
                    // Last byte may be the first half of a marker
                    let dropped = self.cursor.discard_all_but_last();
                    self.stats.resyncs += 1;
                    self.stats.discarded_bytes += dropped as u64;
                    warn!("{}; dropped {} bytes to resynchronize", err, dropped);
                }
                return None;
            };

            if start > 0 {
                debug!("Frame marker at offset {}, discarding {} bytes", start, start);
                self.cursor.discard(start);
                self.stats.discarded_bytes += start as u64;
            }

            let window = self.cursor.as_slice();
            if window.len() < FRAME_HEADER_SIZE {
                return None;
            }

            let length = u16::from_le_bytes([window[2], window[3]]) as usize;
            let total = FRAME_HEADER_SIZE + length;

            if total > self.cursor.capacity() {
                let err = ProtocolError::LengthExceedsWindow {
                    declared: total,
                    capacity: self.cursor.capacity(),
                };
                self.stats.oversize_frames += 1;
                let dropped = match find_marker(window, 1) {
                    Some(next) => {
                        self.cursor.discard(next);
                        next
                    }
                    None => self.cursor.discard_all_but_last(),
                };
                self.stats.discarded_bytes += dropped as u64;
                warn!("{}; skipped {} bytes to the next marker", err, dropped);
                continue;
            }

            if window.len() < total {
                return None;
            }

            let mut raw = self.cursor.take(total);
            let payload = raw.split_off(FRAME_HEADER_SIZE);
            self.stats.frames += 1;
            debug!("Frame recovered ({} byte payload)", payload.len());
            return Some(Frame::new(payload));
        }
    }
}

/// Lazy sequence of frames produced by one [`Deframer::feed`] call
#[derive(Debug)]
pub struct Frames<'a> {
    deframer: &'a mut Deframer,
    input: &'a [u8],
}

impl Iterator for Frames<'_> {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.deframer.next_buffered() {
                return Some(frame);
            }

            if !self.deframer.backlog.is_empty() {
                if self.deframer.admit_backlog() > 0 {
                    continue;
                }
                return None;
            }

            if self.input.is_empty() {
                return None;
            }

            let taken = self.deframer.cursor.extend(self.input);
            self.input = &self.input[taken..];
            if taken == 0 {
                return None;
            }
        }
    }
}

impl Drop for Frames<'_> {
    fn drop(&mut self) {
        if !self.input.is_empty() {
            self.deframer.backlog.extend_from_slice(self.input);
        }
    }
}

/// Offset of the first marker at or after `from`
fn find_marker(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(FRAME_MARKER.len())
        .position(|pair| pair == FRAME_MARKER)
        .map(|pos| pos + from)
}
