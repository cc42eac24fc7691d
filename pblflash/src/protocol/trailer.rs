//! Application image trailer.
//!
//! Lives in the upper half of the last program memory row. Every value byte
//! sits in the low byte of a 14-bit word; the high byte is zero.
//!
//! ```text
//! offset  0x30  0x32  0x34  0x36  0x38   0x3A   0x3C   0x3E
//!         SIGLO SIGHI RULO  RUHI  RFULO  RFUHI  CRCLO  CRCHI
//!         0xAA  0x55  rows used   reserved      CRC16
//! ```

/// Signature low byte offset.
pub const SIGLO: usize = 0x30;
/// Signature high byte offset.
pub const SIGHI: usize = 0x32;
/// Used row count, low byte.
pub const RULO: usize = 0x34;
/// Used row count, high byte.
pub const RUHI: usize = 0x36;
/// Reserved, low byte.
pub const RFULO: usize = 0x38;
/// Reserved, high byte.
pub const RFUHI: usize = 0x3A;
/// Image CRC, low byte.
pub const CRCLO: usize = 0x3C;
/// Image CRC, high byte.
pub const CRCHI: usize = 0x3E;

/// Value stored at [`SIGLO`].
pub const SIGNATURE_LO: u8 = 0xAA;
/// Value stored at [`SIGHI`].
pub const SIGNATURE_HI: u8 = 0x55;

/// First byte offset occupied by the trailer.
pub const TRAILER_START: usize = SIGLO;

/// Decoded trailer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    /// Number of rows, counted from the application base, covered by `crc`.
    pub rows_used: u16,
    /// CRC-16 over the used rows.
    pub crc: u16,
}

impl Trailer {
    /// Write the trailer into the last row of an image.
    pub fn write_into(&self, row: &mut [u8]) {
        let [ru_lo, ru_hi] = self.rows_used.to_le_bytes();
        let [crc_lo, crc_hi] = self.crc.to_le_bytes();
        let fields = [
            (SIGLO, SIGNATURE_LO),
            (SIGHI, SIGNATURE_HI),
            (RULO, ru_lo),
            (RUHI, ru_hi),
            (RFULO, 0),
            (RFUHI, 0),
            (CRCLO, crc_lo),
            (CRCHI, crc_hi),
        ];
        for (offset, value) in fields {
            row[offset] = value;
            row[offset + 1] = 0;
        }
    }

    /// Read the trailer from the last row, `None` without a valid signature.
    pub fn read_from(row: &[u8]) -> Option<Self> {
        if row.len() <= CRCHI || row[SIGLO] != SIGNATURE_LO || row[SIGHI] != SIGNATURE_HI {
            return None;
        }
        Some(Self {
            rows_used: u16::from_le_bytes([row[RULO], row[RUHI]]),
            crc: u16::from_le_bytes([row[CRCLO], row[CRCHI]]),
        })
    }
}
