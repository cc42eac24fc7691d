//! CRC-16 (polynomial 0x1021, MSB first, no final XOR).
//!
//! The same fold is used for packet integrity and for the application image
//! trailer, on both the device and the host. Starting from zero it is the
//! CRC-16/XMODEM variant.

/// Generator polynomial `x^16 + x^12 + x^5 + 1`.
pub const POLYNOMIAL: u16 = 0x1021;

/// Fold `data` into a running CRC `state`.
///
/// There is no finalization step: the returned state is the CRC of everything
/// folded so far and can be fed back in to continue.
pub fn crc16(mut state: u16, data: &[u8]) -> u16 {
    for &byte in data {
        state ^= u16::from(byte) << 8;
        for _ in 0..8 {
            if state & 0x8000 != 0 {
                state = (state << 1) ^ POLYNOMIAL;
            } else {
                state <<= 1;
            }
        }
    }
    state
}

/// Incremental CRC accumulator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Crc16 {
    state: u16,
}

impl Crc16 {
    /// Start from a zero state.
    pub const fn new() -> Self {
        Self { state: 0 }
    }

    /// Fold more bytes into the accumulator.
    pub fn update(&mut self, data: &[u8]) {
        self.state = crc16(self.state, data);
    }

    /// Current CRC value.
    pub const fn value(&self) -> u16 {
        self.state
    }
}
