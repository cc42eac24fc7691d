//! # pblflash
//!
//! Host tools and device logic for a serial bootloader on PIC16-class
//! microcontrollers with row-erased program flash.
//!
//! The crate covers both ends of the link:
//!
//! - CRC-16/XMODEM, packet codec and STX/ETX framing
//! - Flash row access and application integrity check
//! - The bootloader state machine, driven one received byte at a time
//! - Intel HEX / binary image building with the integrity trailer
//! - A transfer engine over a direct serial port or a relay daemon
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use pblflash::{Flasher, Image, Layout, Memory, NativePort, SerialConfig, SerialLink, Source};
//! use pblflash::flasher::{FlashOptions, Finish};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layout = Layout::addressed(0x1F)?;
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", layout.baud_rate()))?;
//!     let mut flasher = Flasher::new(SerialLink::new(port), layout);
//!
//!     let response = flasher.query()?;
//!     let source = Source::from_file("app.hex", &response, Memory::Program)?;
//!     let image = Image::program(&source, &response)?;
//!     flasher.flash(
//!         &image,
//!         FlashOptions::default().with_finish(Finish::Execute),
//!         |row, total| println!("{row}/{total}"),
//!     )?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod device;
pub mod error;
pub mod flasher;
pub mod image;
pub mod link;
pub mod port;
pub mod protocol;

type StopCheck = Arc<dyn Fn() -> bool + Send + Sync>;

static STOP_CHECK: OnceLock<StopCheck> = OnceLock::new();

/// Install the process-wide stop check polled by [`Flasher`] before each row.
///
/// Only the first call takes effect. A row already on the wire when the check
/// turns `true` is still acknowledged; the transfer then ends with
/// [`Error::Interrupted`] and the device keeps its bootloader running.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    if STOP_CHECK
        .set(Arc::new(checker))
        .is_err()
    {
        log::debug!("Interrupt checker already installed");
    }
}

/// Whether the installed stop check asks the current transfer to end.
#[must_use]
pub fn interrupt_requested() -> bool {
    STOP_CHECK
        .get()
        .is_some_and(|stop| stop())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    flasher::{FlashOptions, Flasher, FlasherConfig},
    image::{Image, Memory, Source},
    link::{Link, RelayLink, SerialLink, relay::RelayClient},
    port::{Port, SerialConfig},
    protocol::{
        Layout,
        packet::{Command, Response},
    },
};
