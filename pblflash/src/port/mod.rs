//! Serial port abstraction.
//!
//! The transfer engine talks to a [`Port`], never to `serialport` directly.
//! [`native::NativePort`] opens a real TTY; [`crate::device::sim::SimPort`]
//! stands in for a device during tests.
//!
//! ```text
//! +------------------+
//! |  SerialLink      |  write packet, read ACK / frame
//! +--------+---------+
//!          |
//! +--------v---------+
//! |   Port trait     |
//! +--------+---------+
//!          |
//!    +-----+------------------+
//!    |                        |
//! +--v---------------+  +-----v----------+
//! | NativePort       |  | SimPort        |
//! | (serialport)     |  | (Bootloader)   |
//! +------------------+  +----------------+
//! ```

#[cfg(feature = "native")]
pub mod native;

use {
    crate::error::Result,
    std::{
        io::{Read, Write},
        time::Duration,
    },
};

/// Serial line settings. The bootloader UART is fixed at 8N1 without flow
/// control, so only the rate and timeout vary.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// How long a read waits for the first reply byte.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            timeout: Duration::from_secs(1),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the read timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Byte stream to a bootloader.
///
/// Reads that see no data within [`Port::timeout`] fail with
/// [`std::io::ErrorKind::TimedOut`].
pub trait Port: Read + Write + Send {
    /// Port name/path, for logs.
    fn name(&self) -> &str;

    /// Line rate.
    fn baud_rate(&self) -> u32;

    /// Read timeout.
    fn timeout(&self) -> Duration;

    /// Discard anything pending in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

#[cfg(feature = "native")]
pub use native::NativePort;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_config_default() {
        let config = SerialConfig::default();
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout, Duration::from_secs(1));
        assert!(config.port_name.is_empty());
    }

    #[test]
    fn test_serial_config_builder() {
        let config =
            SerialConfig::new("/dev/ttyUSB0", 57600).with_timeout(Duration::from_millis(250));

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.timeout, Duration::from_millis(250));
    }
}
