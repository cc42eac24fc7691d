//! Wire protocol: CRC, packet layouts and framing.

pub mod crc;
pub mod frame;
pub mod packet;
pub mod trailer;

use crate::error::{Error, Result};
use packet::{Command, LegacyPacket, Packet, Response, control};

/// Highest node address accepted in addressed mode.
pub const MAX_NODE_ADDRESS: u8 = 31;

/// Packet layout spoken on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// 80-byte addressed packets, byte-stuffed and framed.
    Addressed {
        /// Destination node.
        address: u8,
    },
    /// 72-byte non-addressed packets, sent raw.
    Legacy,
}

impl Layout {
    /// Addressed layout for `address`, which must not exceed [`MAX_NODE_ADDRESS`].
    pub fn addressed(address: u8) -> Result<Self> {
        if address > MAX_NODE_ADDRESS {
            return Err(Error::Config(format!(
                "node address {address} out of range 0..={MAX_NODE_ADDRESS}"
            )));
        }
        Ok(Self::Addressed { address })
    }

    /// Serial line rate used with this layout.
    pub fn baud_rate(self) -> u32 {
        match self {
            Self::Addressed { .. } => 9600,
            Self::Legacy => 57600,
        }
    }

    /// Acknowledge byte.
    pub fn ack(self) -> u8 {
        match self {
            Self::Addressed { .. } => control::ACK,
            Self::Legacy => control::LEGACY_ACK,
        }
    }

    /// Negative acknowledge byte.
    pub fn nak(self) -> u8 {
        match self {
            Self::Addressed { .. } => control::NAK,
            Self::Legacy => control::LEGACY_NAK,
        }
    }

    /// Unframed packet size.
    pub fn packet_len(self) -> usize {
        match self {
            Self::Addressed { .. } => packet::PACKET_LEN,
            Self::Legacy => packet::LEGACY_PACKET_LEN,
        }
    }

    /// Whether packets are byte-stuffed on the wire.
    pub fn is_framed(self) -> bool {
        matches!(self, Self::Addressed { .. })
    }

    /// Build the wire bytes for one command.
    pub fn encode(self, command: Command, param: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        match self {
            Self::Addressed { address } => {
                let packet = Packet::new(address, command)
                    .with_param(param)
                    .with_seq(seq)
                    .with_payload(payload);
                frame::encode(&packet.to_bytes())
            },
            Self::Legacy => {
                let mut legacy = LegacyPacket::new(command);
                legacy.param = param;
                legacy.seq = seq;
                let n = payload
                    .len()
                    .min(packet::PAYLOAD_LEN);
                legacy.payload[..n].copy_from_slice(&payload[..n]);
                legacy.to_bytes()
            },
        }
    }

    /// Parse a query reply (frame body or raw legacy packet).
    pub fn decode_response(self, reply: &[u8]) -> Result<Response> {
        let payload = match self {
            Self::Addressed { .. } => Packet::from_bytes(reply)?.payload,
            Self::Legacy => LegacyPacket::from_bytes(reply)?.payload,
        };
        Response::from_payload(&payload)
    }
}
