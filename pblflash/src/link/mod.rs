//! Transports carrying bootloader packets.
//!
//! A [`Link`] sends the wire bytes of one packet and returns the reply. The
//! orchestrator builds and frames packets once; links only move bytes.
//!
//! - [`serial::SerialLink`] writes straight to a [`crate::port::Port`].
//! - [`relay::RelayLink`] wraps the frame in a raw-packet request to the
//!   network daemon that owns the bus.

pub mod relay;
pub mod serial;

use crate::error::Result;

pub use {relay::RelayLink, serial::SerialLink};

/// Shape of the reply expected for a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    /// A single acknowledgement byte.
    Byte,
    /// A byte-stuffed frame; the body is returned.
    Frame,
    /// Exactly this many raw bytes.
    Exact(usize),
}

/// Request/reply transport to one bootloader.
pub trait Link {
    /// Send `wire` and wait for a reply of the given shape.
    fn exchange(&mut self, wire: &[u8], reply: ReplyKind) -> Result<Vec<u8>>;

    /// Drop stale input before a new exchange.
    fn clear(&mut self) -> Result<()> {
        Ok(())
    }

    /// Human readable description for logs.
    fn describe(&self) -> String;
}

impl<L: Link + ?Sized> Link for Box<L> {
    fn exchange(&mut self, wire: &[u8], reply: ReplyKind) -> Result<Vec<u8>> {
        (**self).exchange(wire, reply)
    }

    fn clear(&mut self) -> Result<()> {
        (**self).clear()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
