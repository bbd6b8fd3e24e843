//! # Acquisition Pipeline
//!
//! The single task owning serial read → deframe → decode → stage. It also
//! consults the scheduler and triggers staging → archive migration, so the
//! staging store only ever has one writer. Storage work runs on the blocking
//! pool, one operation at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{CaptureError, ClockError, StorageError};
use crate::frame::decoder::SampleDecoder;
use crate::frame::deframer::Deframer;
use crate::sample::{Sample, SampleStats};
use crate::schedule::{AcquisitionScheduler, Clock, Step};
use crate::serial::SerialReader;
use crate::storage::{run_blocking, MigrationReport, Migrator, StagingStore};

/// Bytes requested from the serial link per read
const READ_CHUNK: usize = 1024;

/// Serial timing of a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureTiming {
    /// Longest single read
    pub read_timeout: Duration,
    /// Longest wait for a valid frame per cycle
    pub capture_timeout: Duration,
}

impl Default for CaptureTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
            capture_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of one acquisition cycle
#[derive(Debug)]
pub enum CycleOutcome {
    /// Sample captured and persisted in a staging slot
    Staged { slot: u32, stats: SampleStats },
    /// No valid sample this cycle
    CaptureFailed(CaptureError),
    /// Sample captured but could not be persisted; it is dropped
    StagingFailed(StorageError),
}

/// Storage side of the acquisition task
pub struct StagingSide {
    pub staging: StagingStore,
    pub migrator: Migrator,
}

impl StagingSide {
    /// Persist `sample` in the first free slot, draining staging when full
    pub fn stage(&self, sample: &Sample) -> Result<u32, StorageError> {
        let staging = &self.staging;
        let slot = match staging.next_free_slot()? {
            Some(slot) => slot,
            None => {
                warn!("All {} staging slots in use, migrating early", staging.capacity());
                let mut report = MigrationReport::default();
                self.migrator.drain_staging(staging, &mut report)?;
                staging.next_free_slot()?.ok_or(StorageError::SlotOutOfRange {
                    slot: staging.capacity(),
                    capacity: staging.capacity(),
                })?
            }
        };

        staging.save(slot, sample)?;
        Ok(slot)
    }

    /// Run migration steps whose trigger is met
    pub fn migrate_if_due(&self) -> Result<MigrationReport, StorageError> {
        self.migrator.migrate_if_due(&self.staging)
    }
}

/// Acquisition task state
pub struct Acquisition<R: SerialReader, Tz: TimeZone> {
    reader: R,
    deframer: Deframer,
    decoder: SampleDecoder,
    scheduler: AcquisitionScheduler<Tz>,
    clock: Arc<dyn Clock>,
    store: Arc<StagingSide>,
    timing: CaptureTiming,
    cycles: u64,
}

impl<R: SerialReader, Tz: TimeZone> Acquisition<R, Tz> {
    /// Assemble the pipeline
    pub fn new(
        reader: R,
        decoder: SampleDecoder,
        scheduler: AcquisitionScheduler<Tz>,
        clock: Arc<dyn Clock>,
        store: StagingSide,
        timing: CaptureTiming,
    ) -> Self {
        Self {
            reader,
            deframer: Deframer::new(),
            decoder,
            scheduler,
            clock,
            store: Arc::new(store),
            timing,
            cycles: 0,
        }
    }

    /// Read frames until one decodes or `timeout` expires
    ///
    /// # Errors
    ///
    /// * [`CaptureError::Decode`] if the deadline passed after at least one
    ///   frame was rejected (the last rejection is returned)
    /// * [`CaptureError::Timeout`] if no frame arrived at all
    /// * [`CaptureError::Serial`] if the link failed
    pub async fn try_capture(&mut self, timeout: Duration) -> Result<Sample, CaptureError> {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_CHUNK];
        let mut last_rejection = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(match last_rejection {
                    Some(e) => CaptureError::Decode(e),
                    None => CaptureError::Timeout(timeout),
                });
            }

            let n = self
                .reader
                .read_bytes(&mut buf, remaining.min(self.timing.read_timeout))
                .await?;

            // Empty input still drains frames left over from earlier reads
            for frame in self.deframer.feed(&buf[..n]) {
                debug!("Frame received ({} byte payload)", frame.len());
                match self.decoder.decode(&frame, self.clock.now()) {
                    Ok(sample) => {
                        let stats = sample.stats();
                        info!(
                            "Captured {}x{} matrix: min {:.2}°C, max {:.2}°C, avg {:.2}°C",
                            sample.geometry().rows,
                            sample.geometry().cols,
                            stats.min,
                            stats.max,
                            stats.mean
                        );
                        return Ok(sample);
                    }
                    Err(e) => {
                        warn!("Rejected frame: {}", e);
                        last_rejection = Some(e);
                    }
                }
            }
        }
    }

    /// Capture one sample and stage it, then migrate if due
    ///
    /// Never fails: every problem is reported in the outcome and logged, so
    /// the next cycle always runs. Migration runs whether or not a sample
    /// was captured.
    pub async fn run_cycle(&mut self) -> CycleOutcome {
        self.cycles += 1;
        let outcome = match self.try_capture(self.timing.capture_timeout).await {
            Ok(sample) => {
                let stats = sample.stats();
                let store = Arc::clone(&self.store);
                match run_blocking(move || store.stage(&sample)).await {
                    Ok(slot) => CycleOutcome::Staged { slot, stats },
                    Err(e) => {
                        error!("Cycle {}: sample dropped, staging failed: {}", self.cycles, e);
                        CycleOutcome::StagingFailed(e)
                    }
                }
            }
            Err(e) => {
                warn!("Cycle {}: no sample ({})", self.cycles, e);
                CycleOutcome::CaptureFailed(e)
            }
        };

        if let Err(e) = self.migrate_if_due().await {
            error!("Migration failed, will retry next cycle: {}", e);
        }
        outcome
    }

    /// Run migration steps whose trigger is met
    pub async fn migrate_if_due(&self) -> Result<MigrationReport, StorageError> {
        let store = Arc::clone(&self.store);
        run_blocking(move || store.migrate_if_due()).await
    }

    /// Seconds until the scheduler's next slot
    pub fn seconds_until_next_acquisition(&self) -> Result<u64, ClockError> {
        self.scheduler.seconds_until_next_acquisition()
    }

    /// Scheduler driving this pipeline
    pub fn scheduler(&self) -> &AcquisitionScheduler<Tz> {
        &self.scheduler
    }

    /// Frame recovery counters
    pub fn deframer(&self) -> &Deframer {
        &self.deframer
    }

    /// Follow the schedule until `shutdown` flips to `true`
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!("Acquisition task started");
        while !*shutdown.borrow() {
            match self.scheduler.poll() {
                Step::Capture => {
                    self.run_cycle().await;
                    self.scheduler.capture_done();
                }
                Step::Sleep(duration) => {
                    tokio::select! {
                        _ = tokio::time::sleep(duration) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        let stats = self.deframer.stats();
        info!(
            "Acquisition task stopped after {} cycles ({} frames, {} resyncs, {} bytes discarded)",
            self.cycles, stats.frames, stats.resyncs, stats.discarded_bytes
        );
    }
}
