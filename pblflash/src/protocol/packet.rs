//! Bootloader packet layouts.
//!
//! ## Addressed packet (80 bytes)
//!
//! ```text
//! +--------+---------+-----+-------+-------+-----------+-------+-------+
//! | Marker | Address | CMD | Param |  Seq  |  Payload  |  Pad  | CRC16 |
//! +--------+---------+-----+-------+-------+-----------+-------+-------+
//! |   1    |    1    |  1  | 2 LE  | 2 LE  |    64     |   7   | 2 LE  |
//! +--------+---------+-----+-------+-------+-----------+-------+-------+
//! ```
//!
//! ## Legacy packet (72 bytes)
//!
//! ```text
//! +-----+-----+-------+-------+-----------+-------+
//! | STX | CMD | Param |  Seq  |  Payload  | CRC16 |
//! +-----+-----+-------+-------+-----------+-------+
//! |  1  |  1  | 2 LE  | 2 LE  |    64     | 2 LE  |
//! +-----+-----+-------+-------+-----------+-------+
//! ```
//!
//! The CRC covers every byte before it.

use {
    crate::{
        error::{Error, Result},
        protocol::crc::crc16,
    },
    byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt},
    std::io::{Cursor, Read},
};

/// Payload size, equal to one program memory row.
pub const PAYLOAD_LEN: usize = 64;

/// Zero padding between payload and CRC in the addressed layout.
pub const PAD_LEN: usize = 7;

/// Size of an addressed packet.
pub const PACKET_LEN: usize = 5 + 2 + PAYLOAD_LEN + PAD_LEN + 2;

/// Size of a legacy packet.
pub const LEGACY_PACKET_LEN: usize = 1 + 1 + 2 + 2 + PAYLOAD_LEN + 2;

/// Header tag identifying a host command packet.
pub const FRAME_MARKER: u8 = 0xFF;

/// Parameter value the host puts in query packets. The device ignores it.
pub const QUERY_PARAM: u16 = 0x55AA;

/// Number of configuration words carried in a query response.
pub const CONFIG_WORDS: usize = 16;

/// Wire control bytes.
pub mod control {
    /// Null, also the "ignore" reply.
    pub const NUL: u8 = 0x00;
    /// Query reply follows.
    pub const SOH: u8 = 0x01;
    /// Start of frame; also the integrity check failure reply.
    pub const STX: u8 = 0x02;
    /// End of frame; also the terminal reply code.
    pub const ETX: u8 = 0x03;
    /// Escape prefix.
    pub const SUBST: u8 = 0x04;
    /// Acknowledge (addressed layout).
    pub const ACK: u8 = 0xC1;
    /// Negative acknowledge (addressed layout).
    pub const NAK: u8 = 0x81;
    /// Acknowledge (legacy layout).
    pub const LEGACY_ACK: u8 = 0x06;
    /// Negative acknowledge (legacy layout).
    pub const LEGACY_NAK: u8 = 0x15;
}

/// Boot commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum Command {
    /// Read loader geometry and configuration, resynchronize the session.
    Query = 0x00,
    /// Verify the application image trailer and CRC.
    CheckApp = 0x08,
    /// Allow memory writes for this session.
    WriteEnable = 0x10,
    /// Erase and program one program memory row.
    WriteProgramMemory = 0x40,
    /// Program one row worth of EEPROM bytes.
    WriteEeprom = 0xA5,
    /// Jump to the application.
    Execute = 0x55,
    /// Restart the device.
    Reset = 0xAA,
}

impl Command {
    /// Look up a command by its op-code.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::Query),
            0x08 => Some(Self::CheckApp),
            0x10 => Some(Self::WriteEnable),
            0x40 => Some(Self::WriteProgramMemory),
            0xA5 => Some(Self::WriteEeprom),
            0x55 => Some(Self::Execute),
            0xAA => Some(Self::Reset),
            _ => None,
        }
    }

    /// Whether the command changes device memory.
    pub fn is_write(self) -> bool {
        matches!(self, Self::WriteProgramMemory | Self::WriteEeprom)
    }
}

/// Addressed packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Header tag, [`FRAME_MARKER`] for host commands.
    pub marker: u8,
    /// Destination node.
    pub address: u8,
    /// Raw op-code, see [`Command`].
    pub command: u8,
    /// Command parameter (word address or EEPROM offset).
    pub param: u16,
    /// Session sequence number.
    pub seq: u16,
    /// Row payload.
    pub payload: [u8; PAYLOAD_LEN],
}

impl Packet {
    /// Create a command packet for `address`.
    pub fn new(address: u8, command: Command) -> Self {
        Self {
            marker: FRAME_MARKER,
            address,
            command: command as u8,
            param: 0,
            seq: 0,
            payload: [0; PAYLOAD_LEN],
        }
    }

    /// All-zero packet, the base of a query response.
    pub fn zeroed() -> Self {
        Self {
            marker: 0,
            address: 0,
            command: 0,
            param: 0,
            seq: 0,
            payload: [0; PAYLOAD_LEN],
        }
    }

    /// Set the parameter.
    #[must_use]
    pub fn with_param(mut self, param: u16) -> Self {
        self.param = param;
        self
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: u16) -> Self {
        self.seq = seq;
        self
    }

    /// Copy `data` into the payload. Short data is zero padded.
    #[must_use]
    pub fn with_payload(mut self, data: &[u8]) -> Self {
        let n = data.len().min(PAYLOAD_LEN);
        self.payload = [0; PAYLOAD_LEN];
        self.payload[..n].copy_from_slice(&data[..n]);
        self
    }

    /// Decoded op-code, if known.
    pub fn command(&self) -> Option<Command> {
        Command::from_u8(self.command)
    }

    /// Serialize with the CRC computed over the preceding 78 bytes.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(PACKET_LEN);
        buf.push(self.marker);
        buf.push(self.address);
        buf.push(self.command);
        buf.write_u16::<LittleEndian>(self.param)
            .unwrap();
        buf.write_u16::<LittleEndian>(self.seq)
            .unwrap();
        buf.extend_from_slice(&self.payload);
        buf.extend_from_slice(&[0; PAD_LEN]);
        let crc = crc16(0, &buf);
        buf.write_u16::<LittleEndian>(crc)
            .unwrap();
        buf
    }

    /// Parse a packet and verify its CRC.
    ///
    /// Bytes beyond [`PACKET_LEN`] are ignored.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < PACKET_LEN {
            return Err(Error::Protocol(format!(
                "short packet: {} of {PACKET_LEN} bytes",
                data.len()
            )));
        }
        check_crc(&data[..PACKET_LEN])?;

        let mut cur = Cursor::new(data);
        let marker = cur.read_u8()?;
        let address = cur.read_u8()?;
        let command = cur.read_u8()?;
        let param = cur.read_u16::<LittleEndian>()?;
        let seq = cur.read_u16::<LittleEndian>()?;
        let mut payload = [0; PAYLOAD_LEN];
        cur.read_exact(&mut payload)?;

        Ok(Self {
            marker,
            address,
            command,
            param,
            seq,
            payload,
        })
    }
}

/// Non-addressed packet used by the legacy direct protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyPacket {
    /// Raw op-code.
    pub command: u8,
    /// Command parameter.
    pub param: u16,
    /// Session sequence number.
    pub seq: u16,
    /// Row payload.
    pub payload: [u8; PAYLOAD_LEN],
}

impl LegacyPacket {
    /// Create a legacy command packet.
    pub fn new(command: Command) -> Self {
        Self {
            command: command as u8,
            param: 0,
            seq: 0,
            payload: [0; PAYLOAD_LEN],
        }
    }

    /// Serialize with a leading STX and trailing CRC.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(LEGACY_PACKET_LEN);
        buf.push(control::STX);
        buf.push(self.command);
        buf.write_u16::<LittleEndian>(self.param)
            .unwrap();
        buf.write_u16::<LittleEndian>(self.seq)
            .unwrap();
        buf.extend_from_slice(&self.payload);
        let crc = crc16(0, &buf);
        buf.write_u16::<LittleEndian>(crc)
            .unwrap();
        buf
    }

    /// Parse a legacy packet and verify its CRC.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < LEGACY_PACKET_LEN {
            return Err(Error::Protocol(format!(
                "short packet: {} of {LEGACY_PACKET_LEN} bytes",
                data.len()
            )));
        }
        check_crc(&data[..LEGACY_PACKET_LEN])?;

        let mut cur = Cursor::new(data);
        let _id = cur.read_u8()?;
        let command = cur.read_u8()?;
        let param = cur.read_u16::<LittleEndian>()?;
        let seq = cur.read_u16::<LittleEndian>()?;
        let mut payload = [0; PAYLOAD_LEN];
        cur.read_exact(&mut payload)?;

        Ok(Self {
            command,
            param,
            seq,
            payload,
        })
    }
}

fn check_crc(packet: &[u8]) -> Result<()> {
    let (body, tail) = packet.split_at(packet.len() - 2);
    let expected = u16::from_le_bytes([tail[0], tail[1]]);
    let actual = crc16(0, body);
    if expected != actual {
        return Err(Error::CrcMismatch { expected, actual });
    }
    Ok(())
}

/// Query response carried in the payload of the reply packet.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Response {
    /// Loader size in words; also the application base address.
    pub loader_words: u16,
    /// Application region size in words.
    pub app_words: u16,
    /// Product identifier.
    pub product_id: u16,
    /// Boot program version.
    pub boot_version: u8,
    /// Protocol number.
    pub protocol: u8,
    /// Raw configuration memory words.
    pub config: [u16; CONFIG_WORDS],
}

impl Response {
    /// Serialize into a row payload; unused bytes are zero.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_payload(&self) -> [u8; PAYLOAD_LEN] {
        let mut buf = Vec::with_capacity(PAYLOAD_LEN);
        buf.write_u16::<LittleEndian>(self.loader_words)
            .unwrap();
        buf.write_u16::<LittleEndian>(self.app_words)
            .unwrap();
        buf.write_u16::<LittleEndian>(self.product_id)
            .unwrap();
        buf.push(self.boot_version);
        buf.push(self.protocol);
        for word in self.config {
            buf.write_u16::<LittleEndian>(word)
                .unwrap();
        }

        let mut payload = [0; PAYLOAD_LEN];
        payload[..buf.len()].copy_from_slice(&buf);
        payload
    }

    /// Parse from a row payload.
    pub fn from_payload(payload: &[u8; PAYLOAD_LEN]) -> Result<Self> {
        let mut cur = Cursor::new(&payload[..]);
        let loader_words = cur.read_u16::<LittleEndian>()?;
        let app_words = cur.read_u16::<LittleEndian>()?;
        let product_id = cur.read_u16::<LittleEndian>()?;
        let boot_version = cur.read_u8()?;
        let protocol = cur.read_u8()?;
        let mut config = [0u16; CONFIG_WORDS];
        cur.read_u16_into::<LittleEndian>(&mut config)?;

        Ok(Self {
            loader_words,
            app_words,
            product_id,
            boot_version,
            protocol,
            config,
        })
    }

    /// Named view of the configuration words.
    pub fn config_area(&self) -> ConfigArea {
        let c = &self.config;
        ConfigArea {
            user: [c[0], c[1], c[2], c[3]],
            device_id: c[6],
            config1: c[7],
            config2: c[8],
            calibration: [c[9], c[10]],
        }
    }
}

/// Configuration memory words as laid out on the PIC16F193x.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ConfigArea {
    /// User ID words 1 to 4.
    pub user: [u16; 4],
    /// Device ID and revision.
    pub device_id: u16,
    /// Configuration word 1.
    pub config1: u16,
    /// Configuration word 2.
    pub config2: u16,
    /// Calibration words.
    pub calibration: [u16; 2],
}
