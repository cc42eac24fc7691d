//! Error types for pblflash.

use std::io;
use thiserror::Error;

use crate::protocol::packet::Command;

/// Result type for pblflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for pblflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// CRC checksum mismatch.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Expected CRC value.
        expected: u16,
        /// Actual CRC value.
        actual: u16,
    },

    /// Communication timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The device answered NAK to a command that is never retried.
    #[error("{command:?} command rejected by device")]
    Rejected {
        /// Command that was rejected.
        command: Command,
    },

    /// The retry budget for one packet was used up.
    #[error("{command:?} command failed after {attempts} attempts")]
    RetriesExhausted {
        /// Command being sent.
        command: Command,
        /// Number of transmissions made.
        attempts: usize,
    },

    /// The device reported a corrupt application image.
    #[error("Application integrity check failed")]
    IntegrityCheckFailed,

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Image cannot be programmed into the device.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Malformed Intel HEX input.
    #[error("Intel HEX error on line {line}: {reason}")]
    HexParse {
        /// 1-based line number.
        line: usize,
        /// What went wrong.
        reason: String,
    },

    /// Relay daemon reported a failure.
    #[error("Relay error: {0}")]
    Relay(String),

    /// Relay daemon structure layout differs from ours.
    #[error("Relay daemon is not compatible: {0}")]
    RelayIncompatible(String),

    /// Unsupported device or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation stopped by the embedding application.
    #[error("Operation interrupted")]
    Interrupted,
}
