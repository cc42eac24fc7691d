//! Device side of the bootloader.
//!
//! The state machine in [`bootloader`] and the row primitives in [`flash`]
//! are written against the [`Target`] trait, which exposes the handful of
//! MCU facilities the protocol needs: NVM control, data EEPROM,
//! configuration memory, the UART and the watchdog. [`sim::SimTarget`]
//! implements it in memory so the host can be tested end to end.
//!
//! ```text
//! +---------------------+
//! |  Bootloader<T>      |  framing, validation, dispatch
//! +----------+----------+
//!            |
//! +----------v----------+
//! |  flash              |  row erase/program/read, integrity check
//! +----------+----------+
//!            |
//! +----------v----------+     +------------------+
//! |  Target trait       +---->|  SimTarget (RAM) |
//! +---------------------+     +------------------+
//! ```

pub mod bootloader;
pub mod flash;
pub mod sim;

use crate::{
    error::{Error, Result},
    protocol::packet::PAYLOAD_LEN,
};

/// EEPROM cell holding the boot sentinel.
pub const EE_BOOT_SENTINEL: u8 = 0xFE;

/// EEPROM cell holding the node address.
pub const EE_NODE_ADDRESS: u8 = 0xFF;

/// Sentinel value forcing the bootloader to stay resident.
pub const BOOT_SENTINEL: u8 = 0x55;

/// Node address used while the address cell is erased.
pub const TEST_ADDRESS: u8 = 0x1F;

/// NVM unlock sequence written before every erase or latch strobe.
pub const UNLOCK_KEYS: [u8; 2] = [0x55, 0xAA];

/// Value of an erased 14-bit program memory word.
pub const ERASED_WORD: u16 = 0x3FFF;

/// Number of configuration words reported by a query.
pub const CONFIG_BLOCK_WORDS: u8 = 16;

/// Memory geometry and identity of one bootloader build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceProfile {
    /// Human readable name.
    pub name: &'static str,
    /// Program memory size in words.
    pub total_words: u16,
    /// Words reserved for the loader; the application starts here.
    pub loader_words: u16,
    /// Erase row size in words.
    pub row_words: u16,
    /// Words committed per write latch group.
    pub latch_words: u16,
    /// Data EEPROM size in bytes.
    pub eeprom_bytes: u16,
    /// Product identifier reported by queries.
    pub product_id: u16,
    /// Boot program version reported by queries.
    pub boot_version: u8,
    /// Protocol number reported by queries.
    pub protocol: u8,
}

impl DeviceProfile {
    /// PIC16F193x, 1K-word loader.
    pub const PIC16F193X: Self = Self {
        name: "PIC16F193x",
        total_words: 0x4000,
        loader_words: 0x0400,
        row_words: 32,
        latch_words: 32,
        eeprom_bytes: 256,
        product_id: 0x3FFF,
        boot_version: 0,
        protocol: 0,
    };

    /// PIC16F193x, 2K-word loader with 8-word latch groups.
    pub const PIC16F193X_LARGE: Self = Self {
        name: "PIC16F193x (2K loader)",
        total_words: 0x4000,
        loader_words: 0x0800,
        row_words: 32,
        latch_words: 8,
        eeprom_bytes: 256,
        product_id: 0x3FFF,
        boot_version: 0,
        protocol: 0,
    };

    /// First application word; writes below it are refused.
    pub const fn app_start(&self) -> u16 {
        self.loader_words
    }

    /// Application region size in words.
    pub const fn app_words(&self) -> u16 {
        self.total_words - self.loader_words
    }

    /// Row size in bytes.
    pub const fn row_bytes(&self) -> usize {
        self.row_words as usize * 2
    }

    /// Word address of the row carrying the image trailer.
    pub const fn trailer_row(&self) -> u16 {
        self.total_words - self.row_words
    }

    /// Check that the geometry fits the packet format.
    pub fn validate(&self) -> Result<()> {
        if self.row_bytes() != PAYLOAD_LEN {
            return Err(Error::Unsupported(format!(
                "{}: row of {} bytes does not match the {PAYLOAD_LEN}-byte payload",
                self.name,
                self.row_bytes()
            )));
        }
        if !self.row_words.is_power_of_two()
            || self.latch_words == 0
            || self.row_words % self.latch_words != 0
        {
            return Err(Error::Unsupported(format!(
                "{}: latch group of {} words does not divide the row",
                self.name, self.latch_words
            )));
        }
        if self.loader_words % self.row_words != 0 || self.loader_words >= self.total_words {
            return Err(Error::Unsupported(format!(
                "{}: loader size {:#06x} is not a row multiple inside program memory",
                self.name, self.loader_words
            )));
        }
        if self.eeprom_bytes > 256 {
            return Err(Error::Unsupported(format!(
                "{}: EEPROM larger than 256 bytes",
                self.name
            )));
        }
        Ok(())
    }
}

/// One NVM write strobe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmOp {
    /// Erase the row containing `addr`.
    EraseRow {
        /// Any word address inside the row.
        addr: u16,
    },
    /// Load one write latch; `commit` programs all loaded latches.
    LoadLatch {
        /// Word address.
        addr: u16,
        /// 14-bit word.
        word: u16,
        /// Program the latch group after loading this word.
        commit: bool,
    },
}

/// MCU facilities used by the bootloader.
///
/// On hardware [`Target::getc`] blocks until a byte arrives and
/// [`Target::reset`] / [`Target::start_app`] do not return. Host
/// implementations return so the caller can observe the outcome.
pub trait Target {
    /// Geometry of this device.
    fn profile(&self) -> &DeviceProfile;

    /// Read one program memory word.
    fn nvm_read(&mut self, addr: u16) -> u16;

    /// Write the two-byte unlock sequence.
    fn nvm_unlock(&mut self, keys: [u8; 2]);

    /// Start an erase or latch write. Requires a preceding unlock.
    fn nvm_write(&mut self, op: NvmOp);

    /// Read a data EEPROM byte.
    fn eeprom_read(&mut self, addr: u8) -> u8;

    /// Write a data EEPROM byte.
    fn eeprom_write(&mut self, addr: u8, value: u8);

    /// Read configuration memory word `index`.
    fn config_read(&mut self, index: u8) -> u16;

    /// Receive one byte; `None` once the receiver is closed.
    fn getc(&mut self) -> Option<u8>;

    /// Queue one byte for transmission.
    fn putc(&mut self, byte: u8);

    /// Drive the line transmitter enable.
    fn set_tx_enable(&mut self, enabled: bool);

    /// Wait until the holding and shift registers are empty.
    fn tx_wait_empty(&mut self);

    /// Service the watchdog.
    fn restart_wdt(&mut self);

    /// Whether the bootloader button is held.
    fn button_pressed(&mut self) -> bool;

    /// Restart the MCU.
    fn reset(&mut self);

    /// Transfer control to the application at word address `entry`.
    fn start_app(&mut self, entry: u16);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_are_valid() {
        DeviceProfile::PIC16F193X.validate().unwrap();
        DeviceProfile::PIC16F193X_LARGE.validate().unwrap();
    }

    #[test]
    fn test_profile_geometry() {
        let p = DeviceProfile::PIC16F193X;
        assert_eq!(p.app_start(), 0x0400);
        assert_eq!(p.app_words(), 0x3C00);
        assert_eq!(p.row_bytes(), 64);
        assert_eq!(p.trailer_row(), 0x3FE0);

        let p = DeviceProfile::PIC16F193X_LARGE;
        assert_eq!(p.app_start(), 0x0800);
        assert_eq!(p.app_words(), 0x3800);
    }

    #[test]
    fn test_profile_rejects_bad_geometry() {
        let mut p = DeviceProfile::PIC16F193X;
        p.row_words = 16;
        assert!(p.validate().is_err());

        let mut p = DeviceProfile::PIC16F193X;
        p.latch_words = 12;
        assert!(p.validate().is_err());

        let mut p = DeviceProfile::PIC16F193X;
        p.loader_words = 0x0410;
        assert!(p.validate().is_err());
    }
}
