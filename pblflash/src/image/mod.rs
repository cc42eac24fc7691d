//! Host-side image builder.
//!
//! A [`Source`] holds the raw bytes of a `.hex` or `.bin` file together with
//! its load address. [`Image::program`] lays it out over the device's
//! application region and stamps the trailer; [`Image::eeprom`] splits a
//! 256-byte EEPROM image into rows.

pub mod hex;

use {
    crate::{
        error::{Error, Result},
        protocol::{
            crc::crc16,
            packet::{Command, PAYLOAD_LEN, Response},
            trailer::Trailer,
        },
    },
    log::debug,
    std::path::Path,
};

/// Words carried by one row payload.
pub const ROW_WORDS: u16 = (PAYLOAD_LEN / 2) as u16;

/// Exact size of an EEPROM image.
pub const EEPROM_IMAGE_LEN: usize = 256;

/// Bits kept in the high byte of a program word.
pub const WORD_HIGH_MASK: u8 = 0x3F;

/// Memory an image is written to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Memory {
    /// Program flash, written with [`Command::WriteProgramMemory`].
    Program,
    /// Data EEPROM, written with [`Command::WriteEeprom`].
    Eeprom,
}

impl Memory {
    /// Write command for this memory.
    pub fn command(self) -> Command {
        match self {
            Self::Program => Command::WriteProgramMemory,
            Self::Eeprom => Command::WriteEeprom,
        }
    }

    /// Erased value of the byte at image offset `i`.
    ///
    /// Erased program words read back as 0x3FFF; erased EEPROM bytes as 0xFF.
    pub fn erased_byte(self, i: usize) -> u8 {
        match self {
            Self::Program if i % 2 == 1 => WORD_HIGH_MASK,
            _ => 0xFF,
        }
    }
}

/// Raw file contents with their load address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Image bytes, two per program word, low byte first.
    pub data: Vec<u8>,
    /// Program memory word address of `data[0]`.
    pub load_address: u16,
}

impl Source {
    /// Parse Intel HEX text for `memory`. HEX byte addresses become word
    /// addresses.
    pub fn from_hex(text: &str, max_bytes: usize, memory: Memory) -> Result<Self> {
        let image = hex::parse(text, max_bytes, memory)?;
        Ok(Self {
            data: image.data,
            load_address: image.load_address >> 1,
        })
    }

    /// Use a raw binary loaded at `load_address`.
    pub fn from_bin(mut data: Vec<u8>, load_address: u16, max_bytes: usize) -> Self {
        data.truncate(max_bytes);
        Self { data, load_address }
    }

    /// Load a `.hex` or `.bin` file destined for `memory` of the device
    /// described by `response`.
    ///
    /// Binary files are loaded at the application base.
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        response: &Response,
        memory: Memory,
    ) -> Result<Self> {
        let path = path.as_ref();
        let max_bytes = usize::from(response.app_words) * 2;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match extension {
            "hex" => {
                let text = std::fs::read_to_string(path)?;
                Self::from_hex(&text, max_bytes, memory)
            },
            "bin" => {
                let data = std::fs::read(path)?;
                Ok(Self::from_bin(data, response.loader_words, max_bytes))
            },
            "" => Err(Error::InvalidImage(format!(
                "{}: missing file extension",
                path.display()
            ))),
            other => Err(Error::InvalidImage(format!(
                "unrecognizable file format {other}"
            ))),
        }
    }
}

/// One row to transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Command parameter: word address for program memory, byte offset for
    /// EEPROM.
    pub param: u16,
    /// Row contents.
    pub data: [u8; PAYLOAD_LEN],
}

/// Image ready for transfer.
#[derive(Debug, Clone)]
pub struct Image {
    memory: Memory,
    rows: Vec<Row>,
    trailer: Option<Trailer>,
}

impl Image {
    /// Lay out a program memory image for the device described by `response`.
    ///
    /// The application region is pre-filled with erased words, the source is
    /// copied to its start and the trailer is written into the last row.
    /// Program words are 14 bits wide, so high bytes are masked before the
    /// CRC is taken; the device reads back exactly what is checksummed.
    /// Transfer order is every used row ascending, then the trailer row.
    pub fn program(source: &Source, response: &Response) -> Result<Self> {
        let base = response.loader_words;
        let max_bytes = usize::from(response.app_words) * 2;

        if source.load_address != base {
            return Err(Error::InvalidImage(format!(
                "wrong application load address {:#06x}, expected {base:#06x}",
                source.load_address
            )));
        }
        if source
            .data
            .is_empty()
        {
            return Err(Error::InvalidImage("image contains no data".into()));
        }
        if max_bytes < 2 * PAYLOAD_LEN {
            return Err(Error::InvalidImage(format!(
                "application region of {} words is too small",
                response.app_words
            )));
        }
        if source.data.len() > max_bytes {
            return Err(Error::InvalidImage(format!(
                "image of {} bytes exceeds the {max_bytes}-byte application region",
                source.data.len()
            )));
        }

        let mut buffer: Vec<u8> = (0..max_bytes)
            .map(|i| Memory::Program.erased_byte(i))
            .collect();
        buffer[..source.data.len()].copy_from_slice(&source.data);
        let mut masked = 0;
        for high in buffer.iter_mut().skip(1).step_by(2) {
            if *high & !WORD_HIGH_MASK != 0 {
                *high &= WORD_HIGH_MASK;
                masked += 1;
            }
        }
        if masked > 0 {
            debug!("Masked {masked} program word high bytes to 14 bits");
        }

        let used_rows = source
            .data
            .len()
            .div_ceil(PAYLOAD_LEN);
        let top_row = (max_bytes - PAYLOAD_LEN) / PAYLOAD_LEN;
        if used_rows > top_row {
            return Err(Error::InvalidImage(format!(
                "image uses {used_rows} rows and overlaps the trailer row {top_row}"
            )));
        }

        let crc = crc16(0, &buffer[..used_rows * PAYLOAD_LEN]);
        let trailer = Trailer {
            rows_used: used_rows as u16,
            crc,
        };
        trailer.write_into(&mut buffer[top_row * PAYLOAD_LEN..]);
        debug!("Image: {used_rows} rows, CRC {crc:#06x}, trailer row {top_row}");

        let rows = (0..used_rows)
            .chain(std::iter::once(top_row))
            .map(|index| row_at(&buffer, index, base + index as u16 * ROW_WORDS))
            .collect();

        Ok(Self {
            memory: Memory::Program,
            rows,
            trailer: Some(trailer),
        })
    }

    /// Split a 256-byte EEPROM image into rows at byte offsets 0, 64, 128, 192.
    pub fn eeprom(source: &Source) -> Result<Self> {
        if source.data.len() != EEPROM_IMAGE_LEN {
            return Err(Error::InvalidImage(format!(
                "EEPROM image must contain exactly {EEPROM_IMAGE_LEN} bytes, got {}",
                source.data.len()
            )));
        }
        let rows = (0..EEPROM_IMAGE_LEN / PAYLOAD_LEN)
            .map(|index| row_at(&source.data, index, (index * PAYLOAD_LEN) as u16))
            .collect();

        Ok(Self {
            memory: Memory::Eeprom,
            rows,
            trailer: None,
        })
    }

    /// Target memory.
    pub fn memory(&self) -> Memory {
        self.memory
    }

    /// Rows in transfer order.
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Trailer stamped into a program image.
    pub fn trailer(&self) -> Option<Trailer> {
        self.trailer
    }
}

fn row_at(buffer: &[u8], index: usize, param: u16) -> Row {
    let mut data = [0u8; PAYLOAD_LEN];
    let start = index * PAYLOAD_LEN;
    data.copy_from_slice(&buffer[start..start + PAYLOAD_LEN]);
    Row { param, data }
}
