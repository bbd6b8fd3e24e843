//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::de::Error;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, ThermalError};
use crate::frame::protocol::{PayloadShape, FRAME_HEADER_SIZE, WINDOW_CAPACITY};
use crate::retry::RetryPolicy;
use crate::sample::{MatrixGeometry, RangeBounds};
use crate::schedule::{SchedulePolicy, ScheduleSlot};
use crate::serial::SENSOR_BAUD_RATE;
use crate::storage::MigrationPolicy;
use crate::upload::UploadPolicy;

/// Baud rates the sensor link can be configured for
pub const ALLOWED_BAUD_RATES: &[u32] = &[9600, 57600, 115200, 230400, 460800, 921600];

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub sensor: SensorConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub staging: StagingConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SerialConfig {
    /// Device path; empty means auto-detect
    #[serde(default = "default_serial_port")]
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

/// Thermal sensor geometry and sanity range
#[derive(Debug, Deserialize, Clone)]
pub struct SensorConfig {
    #[serde(default = "default_rows")]
    pub rows: usize,

    #[serde(default = "default_cols")]
    pub cols: usize,

    #[serde(default = "default_min_celsius")]
    pub min_celsius: f32,

    #[serde(default = "default_max_celsius")]
    pub max_celsius: f32,
}

/// Acquisition schedule configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    /// Daily slots as "HH:MM"
    #[serde(default = "default_slots")]
    pub slots: Vec<ScheduleSlot>,

    /// Wall clock readings at or before this unix time are not trusted
    #[serde(default = "default_trusted_after_unix")]
    pub trusted_after_unix: i64,

    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,

    #[serde(default = "default_clock_retry_s")]
    pub clock_retry_s: u64,

    #[serde(default = "default_max_wait_s")]
    pub max_wait_s: u64,
}

/// Staging store configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StagingConfig {
    #[serde(default = "default_staging_dir")]
    pub dir: PathBuf,

    /// Slot count; a full store is migrated to the archive
    #[serde(default = "default_staging_slots")]
    pub slots: u32,

    #[serde(default = "default_staging_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_staging_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Archive log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    #[serde(default = "default_archive_dir")]
    pub dir: PathBuf,

    /// Removable pool closed segments are moved to
    #[serde(default)]
    pub overflow_dir: Option<PathBuf>,

    #[serde(default = "default_max_segment_bytes")]
    pub max_segment_bytes: u64,

    #[serde(default = "default_migration_chunk_bytes")]
    pub migration_chunk_bytes: usize,
}

/// Upload configuration
#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_upload_url")]
    pub url: String,

    #[serde(default = "default_batch_records")]
    pub batch_records: u32,

    #[serde(default = "default_upload_retry_attempts")]
    pub retry_attempts: u32,

    #[serde(default = "default_upload_retry_delay_ms")]
    pub retry_delay_ms: u64,

    #[serde(default = "default_upload_interval_s")]
    pub interval_s: u64,

    #[serde(default = "default_upload_timeout_ms")]
    pub timeout_ms: u64,
}

/// Log file configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// Directory for daily log files; console only when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

// Default value functions
fn default_serial_port() -> String { "/dev/ttyUSB0".to_string() }
fn default_baud_rate() -> u32 { SENSOR_BAUD_RATE }
fn default_read_timeout_ms() -> u64 { 50 }
fn default_capture_timeout_ms() -> u64 { 10000 }

fn default_rows() -> usize { 24 }
fn default_cols() -> usize { 32 }
fn default_min_celsius() -> f32 { -40.0 }
fn default_max_celsius() -> f32 { 200.0 }

fn default_slots() -> Vec<ScheduleSlot> {
    [(0, 0), (6, 0), (12, 0), (18, 0)]
        .into_iter()
        .filter_map(|(h, m)| ScheduleSlot::new(h, m))
        .collect()
}
fn default_trusted_after_unix() -> i64 { 1_577_836_800 }
fn default_poll_interval_s() -> u64 { 60 }
fn default_clock_retry_s() -> u64 { 5 }
fn default_max_wait_s() -> u64 { 90000 }

fn default_staging_dir() -> PathBuf { PathBuf::from("./data/staging") }
fn default_staging_slots() -> u32 { 10 }
fn default_staging_retry_attempts() -> u32 { 3 }
fn default_staging_retry_delay_ms() -> u64 { 100 }

fn default_archive_dir() -> PathBuf { PathBuf::from("./data/archive") }
fn default_max_segment_bytes() -> u64 { 512 * 1024 }
fn default_migration_chunk_bytes() -> usize { 4096 }

fn default_upload_url() -> String { "http://localhost:8080/api/thermal".to_string() }
fn default_batch_records() -> u32 { 8 }
fn default_upload_retry_attempts() -> u32 { 3 }
fn default_upload_retry_delay_ms() -> u64 { 500 }
fn default_upload_interval_s() -> u64 { 300 }
fn default_upload_timeout_ms() -> u64 { 15000 }

fn default_file_prefix() -> String { "thermal-logger.log".to_string() }

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_serial_port(),
            baud_rate: default_baud_rate(),
            read_timeout_ms: default_read_timeout_ms(),
            capture_timeout_ms: default_capture_timeout_ms(),
        }
    }
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            rows: default_rows(),
            cols: default_cols(),
            min_celsius: default_min_celsius(),
            max_celsius: default_max_celsius(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            slots: default_slots(),
            trusted_after_unix: default_trusted_after_unix(),
            poll_interval_s: default_poll_interval_s(),
            clock_retry_s: default_clock_retry_s(),
            max_wait_s: default_max_wait_s(),
        }
    }
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            dir: default_staging_dir(),
            slots: default_staging_slots(),
            retry_attempts: default_staging_retry_attempts(),
            retry_delay_ms: default_staging_retry_delay_ms(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            dir: default_archive_dir(),
            overflow_dir: None,
            max_segment_bytes: default_max_segment_bytes(),
            migration_chunk_bytes: default_migration_chunk_bytes(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_upload_url(),
            batch_records: default_batch_records(),
            retry_attempts: default_upload_retry_attempts(),
            retry_delay_ms: default_upload_retry_delay_ms(),
            interval_s: default_upload_interval_s(),
            timeout_ms: default_upload_timeout_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: None,
            file_prefix: default_file_prefix(),
        }
    }
}

fn invalid(msg: impl std::fmt::Display) -> ThermalError {
    ThermalError::Config(toml::de::Error::custom(msg))
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails (including malformed "HH:MM" slots)
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use thermal_logger::config::Config;
    ///
    /// let config = Config::load("config/thermal-logger.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<()> {
        // Serial port may be empty (auto-detect)
        if !ALLOWED_BAUD_RATES.contains(&self.serial.baud_rate) {
            return Err(invalid(
                "baud_rate must be one of: 9600, 57600, 115200, 230400, 460800, 921600",
            ));
        }

        if self.serial.read_timeout_ms == 0 || self.serial.read_timeout_ms > 10000 {
            return Err(invalid("read_timeout_ms must be between 1 and 10000"));
        }

        if self.serial.capture_timeout_ms < self.serial.read_timeout_ms || self.serial.capture_timeout_ms > 600_000 {
            return Err(invalid("capture_timeout_ms must be between read_timeout_ms and 600000"));
        }

        if self.sensor.rows == 0 || self.sensor.cols == 0 {
            return Err(invalid("sensor rows and cols must be greater than 0"));
        }

        // The largest payload shape must fit the deframer window
        let cells = self.sensor.rows * self.sensor.cols;
        if FRAME_HEADER_SIZE + PayloadShape::Tagged.payload_len(cells) > WINDOW_CAPACITY {
            return Err(invalid(format!(
                "sensor matrix of {} cells does not fit a {}-byte frame",
                cells, WINDOW_CAPACITY
            )));
        }

        let (low, high) = (self.sensor.min_celsius, self.sensor.max_celsius);
        if low.is_nan() || high.is_nan() || low >= high {
            return Err(invalid("min_celsius must be less than max_celsius"));
        }

        if self.schedule.slots.is_empty() {
            return Err(invalid("schedule must contain at least one slot"));
        }

        if let Some(pair) = self.schedule.slots.windows(2).find(|pair| pair[0] >= pair[1]) {
            return Err(invalid(format!(
                "schedule slots must be distinct and in ascending order ({} then {})",
                pair[0], pair[1]
            )));
        }

        if self.schedule.poll_interval_s == 0 || self.schedule.poll_interval_s > 3600 {
            return Err(invalid("poll_interval_s must be between 1 and 3600"));
        }

        if self.schedule.clock_retry_s == 0 || self.schedule.clock_retry_s > 3600 {
            return Err(invalid("clock_retry_s must be between 1 and 3600"));
        }

        // A full day must fit in one wait
        if self.schedule.max_wait_s < 86400 {
            return Err(invalid("max_wait_s must be at least 86400"));
        }

        if self.staging.dir.as_os_str().is_empty() {
            return Err(invalid("staging dir cannot be empty"));
        }

        if self.staging.slots == 0 || self.staging.slots > 1024 {
            return Err(invalid("staging slots must be between 1 and 1024"));
        }

        if self.staging.retry_attempts == 0 {
            return Err(invalid("staging retry_attempts must be greater than 0"));
        }

        if self.archive.dir.as_os_str().is_empty() {
            return Err(invalid("archive dir cannot be empty"));
        }

        if self.archive.overflow_dir.as_ref() == Some(&self.archive.dir) {
            return Err(invalid("archive overflow_dir must differ from archive dir"));
        }

        if self.archive.max_segment_bytes == 0 {
            return Err(invalid("max_segment_bytes must be greater than 0"));
        }

        if self.archive.migration_chunk_bytes == 0 || self.archive.migration_chunk_bytes > 1024 * 1024 {
            return Err(invalid("migration_chunk_bytes must be between 1 and 1048576"));
        }

        if self.upload.enabled && self.upload.url.is_empty() {
            return Err(invalid("upload url cannot be empty when enabled"));
        }

        if self.upload.batch_records == 0 {
            return Err(invalid("upload batch_records must be greater than 0"));
        }

        if self.upload.retry_attempts == 0 {
            return Err(invalid("upload retry_attempts must be greater than 0"));
        }

        if self.upload.interval_s == 0 {
            return Err(invalid("upload interval_s must be greater than 0"));
        }

        if self.upload.timeout_ms == 0 || self.upload.timeout_ms > 120_000 {
            return Err(invalid("upload timeout_ms must be between 1 and 120000"));
        }

        if self.logging.dir.is_some() && self.logging.file_prefix.is_empty() {
            return Err(invalid("logging file_prefix cannot be empty when dir is set"));
        }

        Ok(())
    }

    /// Matrix shape of the sensor
    pub fn geometry(&self) -> MatrixGeometry {
        MatrixGeometry::new(self.sensor.rows, self.sensor.cols)
    }

    /// Physical range a decoded matrix must lie in
    pub fn bounds(&self) -> RangeBounds {
        RangeBounds::new(self.sensor.min_celsius, self.sensor.max_celsius)
    }

    /// Scheduler timing
    pub fn schedule_policy(&self) -> SchedulePolicy {
        SchedulePolicy {
            poll_interval: Duration::from_secs(self.schedule.poll_interval_s),
            clock_retry: Duration::from_secs(self.schedule.clock_retry_s),
            max_wait: Duration::from_secs(self.schedule.max_wait_s),
        }
    }

    /// Read-after-write retry of staging saves
    pub fn staging_retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.staging.retry_attempts,
            Duration::from_millis(self.staging.retry_delay_ms),
        )
    }

    /// Staging drain, rotation and offload thresholds
    pub fn migration_policy(&self) -> MigrationPolicy {
        MigrationPolicy {
            batch_threshold: self.staging.slots as usize,
            max_segment_bytes: self.archive.max_segment_bytes,
            chunk_bytes: self.archive.migration_chunk_bytes,
        }
    }

    /// Batch size and retry of uploads
    pub fn upload_policy(&self) -> UploadPolicy {
        UploadPolicy {
            batch_records: self.upload.batch_records,
            retry: RetryPolicy::new(
                self.upload.retry_attempts,
                Duration::from_millis(self.upload.retry_delay_ms),
            ),
        }
    }
}
