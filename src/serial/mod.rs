//! # Serial Communication Module
//!
//! Handles the serial link to the thermal sensor.
//!
//! This module handles:
//! - Opening the serial port at 115,200 baud (8N1)
//! - Auto-detecting the sensor among common device paths
//! - Bounded-timeout reads for the acquisition loop
//! - A simulated sensor for bench runs

pub mod port_trait;
pub mod simulator;

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::error::{Result, ThermalError};
pub use port_trait::{SerialReader, StreamReader};
pub use simulator::SimulatedSensor;

/// Sensor link baud rate
pub const SENSOR_BAUD_RATE: u32 = 115_200;

/// Device paths tried when no port is configured (in order of preference)
pub const DEFAULT_DEVICE_PATHS: &[&str] = &[
    "/dev/ttyUSB0", // USB-to-serial adapters
    "/dev/ttyACM0", // USB CDC devices
];

/// Thermal sensor serial port
pub struct ThermalSerial {
    reader: StreamReader<tokio_serial::SerialStream>,
    device_path: String,
}

impl std::fmt::Debug for ThermalSerial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThermalSerial")
            .field("device_path", &self.device_path)
            .finish_non_exhaustive()
    }
}

impl ThermalSerial {
    /// Open the sensor on the configured port, or auto-detect when `port` is empty
    ///
    /// # Errors
    ///
    /// Returns error if no candidate device could be opened
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use thermal_logger::serial::ThermalSerial;
    ///
    /// #[tokio::main]
    /// async fn main() -> anyhow::Result<()> {
    ///     let serial = ThermalSerial::open("", 115_200)?;
    ///     println!("Sensor on {}", serial.device_path());
    ///     Ok(())
    /// }
    /// ```
    pub fn open(port: &str, baud_rate: u32) -> Result<Self> {
        if port.is_empty() {
            Self::open_with_paths(DEFAULT_DEVICE_PATHS, baud_rate)
        } else {
            Self::open_with_paths(&[port], baud_rate)
        }
    }

    /// Open the first device in `paths` that accepts the connection
    pub fn open_with_paths(paths: &[&str], baud_rate: u32) -> Result<Self> {
        for path in paths {
            debug!("Trying to open serial port: {}", path);

            match Self::open_port(path, baud_rate) {
                Ok(port) => {
                    info!("Opened thermal sensor at {} ({} baud)", path, baud_rate);
                    return Ok(Self {
                        reader: StreamReader::new(port),
                        device_path: path.to_string(),
                    });
                }
                Err(e) => {
                    warn!("Failed to open {}: {}", path, e);
                    continue;
                }
            }
        }

        Err(ThermalError::SerialPortNotFound(paths.join(", ")))
    }

    /// Open a specific serial port with 8N1 settings
    fn open_port(path: &str, baud_rate: u32) -> Result<tokio_serial::SerialStream> {
        let port = tokio_serial::new(path, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| ThermalError::Serial(format!("Failed to open {}: {}", path, e)))?;

        Ok(port)
    }

    /// Path of the opened device
    pub fn device_path(&self) -> &str {
        &self.device_path
    }
}

#[async_trait]
impl SerialReader for ThermalSerial {
    async fn read_bytes(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.reader.read_bytes(buf, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(SENSOR_BAUD_RATE, 115_200);
        assert_eq!(DEFAULT_DEVICE_PATHS, &["/dev/ttyUSB0", "/dev/ttyACM0"]);
    }

    #[test]
    fn test_open_with_invalid_paths_returns_error() {
        let invalid_paths = &["/dev/nonexistent0", "/dev/nonexistent1"];
        let result = ThermalSerial::open_with_paths(invalid_paths, SENSOR_BAUD_RATE);

        match result {
            Err(ThermalError::SerialPortNotFound(msg)) => {
                assert!(msg.contains("/dev/nonexistent0"));
                assert!(msg.contains("/dev/nonexistent1"));
            }
            other => panic!("Expected SerialPortNotFound error, got: {:?}", other),
        }
    }

    #[test]
    fn test_open_with_empty_paths_returns_error() {
        let empty_paths: &[&str] = &[];
        let result = ThermalSerial::open_with_paths(empty_paths, SENSOR_BAUD_RATE);
        assert!(matches!(result, Err(ThermalError::SerialPortNotFound(_))));
    }

    #[test]
    fn test_configured_port_is_the_only_candidate() {
        match ThermalSerial::open("/dev/nonexistent_thermal", SENSOR_BAUD_RATE) {
            Err(ThermalError::SerialPortNotFound(msg)) => assert_eq!(msg, "/dev/nonexistent_thermal"),
            other => panic!("Expected SerialPortNotFound error, got: {:?}", other),
        }
    }

    #[test]
    fn test_open_port_with_invalid_path_returns_error() {
        let result = ThermalSerial::open_port("/dev/nonexistent_serial_device_12345", SENSOR_BAUD_RATE);

        match result {
            Err(ThermalError::Serial(msg)) => {
                assert!(msg.contains("/dev/nonexistent_serial_device_12345"));
                assert!(msg.contains("Failed to open"));
            }
            other => panic!("Expected Serial error, got: {:?}", other.map(|_| ())),
        }
    }

    // Integration test - only runs if the sensor is connected
    #[tokio::test]
    #[ignore] // Run with: cargo test -- --ignored
    async fn test_read_with_real_hardware() {
        if let Ok(mut serial) = ThermalSerial::open("", SENSOR_BAUD_RATE) {
            let mut buf = [0u8; 4096];
            let n = serial.read_bytes(&mut buf, Duration::from_secs(2)).await.unwrap();
            println!("Read {} bytes from {}", n, serial.device_path());
        } else {
            println!("No thermal sensor detected (skipping read test)");
        }
    }
}
