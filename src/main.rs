//! # Thermal Logger
//!
//! Acquire thermal matrix frames from a serial sensor and keep them durably
//! until a remote collector has acknowledged them.
//!
//! # Control Flow
//!
//! 1. **Initialization**
//!    - Load configuration (built-in defaults when no file is given)
//!    - Set up logging to the console and, optionally, a daily log file
//!    - Mount the staging, archive and overflow pools on one shared device
//!
//! 2. **Acquisition task**
//!    - Wait for a trusted clock and the next schedule slot
//!    - Capture one frame, stage it with read-after-write verification
//!    - Move staged samples to the archive once enough have accumulated
//!
//! 3. **Maintenance task**
//!    - Periodically upload unacknowledged archive records
//!
//! 4. **Graceful Shutdown**
//!    - Ctrl+C stops both tasks between operations
//!
//! # Examples
//!
//! ```bash
//! thermal-logger --config config/thermal-logger.toml
//! thermal-logger --simulate --once
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use clap::Parser;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use thermal_logger::config::Config;
use thermal_logger::frame::decoder::SampleDecoder;
use thermal_logger::pipeline::{Acquisition, CaptureTiming, CycleOutcome, StagingSide};
use thermal_logger::schedule::{humanize_duration, AcquisitionScheduler, Clock, ScheduleTable, SystemClock};
use thermal_logger::serial::{SerialReader, SimulatedSensor, ThermalSerial};
use thermal_logger::storage::{
    ArchiveLog, DirPool, Migrator, SharedDevice, StagingStore, StoragePool,
};
use thermal_logger::upload::collector::HttpCollector;
use thermal_logger::upload::progress::UploadTracker;
use thermal_logger::upload::Uploader;

/// Frame period of the simulated sensor
const SIMULATED_FRAME_PERIOD: Duration = Duration::from_secs(2);

/// Command line arguments
#[derive(Debug, Parser)]
#[command(name = "thermal-logger", version)]
#[command(about = "Scheduled thermal matrix acquisition with durable storage and upload")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Feed synthetic frames instead of opening the serial port
    #[arg(long)]
    simulate: bool,

    /// Capture and stage one sample immediately, then exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };

    let _log_guard = init_logging(&config)?;
    info!("Thermal Logger v{} starting...", env!("CARGO_PKG_VERSION"));

    if cli.simulate {
        info!("Using simulated sensor ({:?} frame period)", SIMULATED_FRAME_PERIOD);
        let sensor = SimulatedSensor::new(config.geometry(), SIMULATED_FRAME_PERIOD);
        run(sensor, &config, cli.once).await
    } else {
        let serial = ThermalSerial::open(&config.serial.port, config.serial.baud_rate)?;
        info!("Thermal sensor serial port opened at: {}", serial.device_path());
        run(serial, &config, cli.once).await
    }
}

/// Console logging, plus a daily-rolling file when `logging.dir` is set
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
fn init_logging(config: &Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());

    let (file_layer, guard) = match &config.logging.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).with_context(|| format!("creating log dir {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, &config.logging.file_prefix);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

/// Mount pools, assemble both tasks and run until Ctrl+C
async fn run<R: SerialReader + Sync + 'static>(reader: R, config: &Config, once: bool) -> Result<()> {
    let device = SharedDevice::new();
    let geometry = config.geometry();

    let staging_pool: Arc<dyn StoragePool> = Arc::new(
        DirPool::open_dir("staging", &config.staging.dir)
            .with_context(|| format!("mounting staging pool {}", config.staging.dir.display()))?,
    );
    let archive_pool: Arc<dyn StoragePool> = Arc::new(
        DirPool::open_dir("archive", &config.archive.dir)
            .with_context(|| format!("mounting archive pool {}", config.archive.dir.display()))?,
    );
    let overflow_pool: Option<Arc<dyn StoragePool>> = match &config.archive.overflow_dir {
        Some(dir) => match DirPool::open_dir("overflow", dir) {
            Ok(pool) => Some(Arc::new(pool)),
            Err(e) => {
                // Removable medium missing: closed segments stay in the archive pool
                warn!("Overflow pool {} unavailable: {}", dir.display(), e);
                None
            }
        },
        None => None,
    };

    let archive = Arc::new(ArchiveLog::open(
        Arc::clone(&archive_pool),
        overflow_pool,
        device.clone(),
        geometry,
    )?);
    info!(
        "Archive segment {} holds {} records",
        archive.active(),
        archive.record_count()?
    );

    let staging = StagingStore::new(
        staging_pool,
        device.clone(),
        geometry,
        config.staging.slots,
        config.staging_retry(),
    );
    let recovered = staging.staged_count()?;
    if recovered > 0 {
        info!("Recovered {} staged samples from previous run", recovered);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new(config.schedule.trusted_after_unix));
    let scheduler = AcquisitionScheduler::new(
        ScheduleTable::new(config.schedule.slots.clone())?,
        Arc::clone(&clock),
        Local,
        config.schedule_policy(),
    );

    let mut acquisition = Acquisition::new(
        reader,
        SampleDecoder::new(geometry, config.bounds()),
        scheduler,
        clock,
        StagingSide {
            staging,
            migrator: Migrator::new(Arc::clone(&archive), config.migration_policy()),
        },
        CaptureTiming {
            read_timeout: Duration::from_millis(config.serial.read_timeout_ms),
            capture_timeout: Duration::from_millis(config.serial.capture_timeout_ms),
        },
    );

    if once {
        return match acquisition.run_cycle().await {
            CycleOutcome::Staged { slot, stats } => {
                info!(
                    "Staged sample in slot {} (min {:.2}°C, max {:.2}°C, avg {:.2}°C)",
                    slot, stats.min, stats.max, stats.mean
                );
                Ok(())
            }
            CycleOutcome::CaptureFailed(e) => Err(e).context("capture failed"),
            CycleOutcome::StagingFailed(e) => Err(e).context("staging failed"),
        };
    }

    match acquisition.seconds_until_next_acquisition() {
        Ok(secs) => info!("First acquisition in {}", humanize_duration(secs)),
        Err(e) => warn!("First acquisition deferred: {}", e),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let acquisition_task: JoinHandle<()> = {
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { acquisition.run(shutdown).await })
    };

    let maintenance_task: Option<JoinHandle<()>> = if config.upload.enabled {
        let uploader = Uploader::new(
            Arc::clone(&archive),
            UploadTracker::new(archive_pool, device),
            HttpCollector::new(&config.upload.url, Duration::from_millis(config.upload.timeout_ms)),
            config.upload_policy(),
        );
        info!(
            "Uploading to {} every {}",
            config.upload.url,
            humanize_duration(config.upload.interval_s)
        );
        Some(tokio::spawn(maintain(
            uploader,
            Duration::from_secs(config.upload.interval_s),
            shutdown_rx,
        )))
    } else {
        info!("Upload disabled");
        None
    };

    info!("Press Ctrl+C to exit");
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down...");
    // Receivers may already be gone if a task ended
    let _ = shutdown_tx.send(true);

    if let Err(e) = acquisition_task.await {
        error!("Acquisition task ended abnormally: {}", e);
    }
    if let Some(task) = maintenance_task {
        if let Err(e) = task.await {
            error!("Maintenance task ended abnormally: {}", e);
        }
    }

    info!("Archive holds {} records in segment {}", archive.record_count()?, archive.active());
    Ok(())
}

/// Upload pending records every `interval` until shutdown
async fn maintain(uploader: Uploader<HttpCollector>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = uploader.upload_pending().await {
                    warn!("Upload pass failed, will retry: {}", e);
                }
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
    info!("Maintenance task stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::try_parse_from(["thermal-logger", "--config", "a.toml", "--simulate", "--once"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("a.toml")));
        assert!(cli.simulate);
        assert!(cli.once);
    }

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["thermal-logger"]).unwrap();
        assert!(cli.config.is_none());
        assert!(!cli.simulate);
        assert!(!cli.once);
    }

    #[test]
    fn test_simulated_period_fits_capture_timeout() {
        let config = Config::default();
        assert!(SIMULATED_FRAME_PERIOD < Duration::from_millis(config.serial.capture_timeout_ms));
    }
}
