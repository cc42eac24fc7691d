//! Byte-stuffed framing.
//!
//! A frame is `STX`, the escaped packet bytes, then `ETX`. Any byte less
//! than or equal to `SUBST` is sent as `SUBST` followed by the byte, so an
//! unescaped `ETX` can only mean end of frame.

use {
    crate::protocol::packet::control::{ETX, STX, SUBST},
    log::trace,
};

/// Frame `packet` for the wire.
pub fn encode(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() * 2 + 2);
    out.push(STX);
    for &byte in packet {
        if byte <= SUBST {
            out.push(SUBST);
        }
        out.push(byte);
    }
    out.push(ETX);
    out
}

/// Extract the first complete frame from `data`.
///
/// At most `capacity` body bytes are kept. Returns `None` if no STX is
/// found or the frame is never terminated.
pub fn decode(data: &[u8], capacity: usize) -> Option<Vec<u8>> {
    let mut deframer = Deframer::new(capacity);
    data.iter()
        .find_map(|&byte| deframer.push(byte))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Hunt,
    Body,
    Escape,
}

/// Streaming frame receiver, fed one byte at a time.
#[derive(Debug, Clone)]
pub struct Deframer {
    state: State,
    body: Vec<u8>,
    capacity: usize,
    dropped: usize,
}

impl Deframer {
    /// Create a receiver keeping at most `capacity` bytes per frame.
    pub fn new(capacity: usize) -> Self {
        Self {
            state: State::Hunt,
            body: Vec::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Feed one byte; returns the frame body when `ETX` closes it.
    pub fn push(&mut self, byte: u8) -> Option<Vec<u8>> {
        match self.state {
            State::Hunt => {
                if byte == STX {
                    self.body.clear();
                    self.dropped = 0;
                    self.state = State::Body;
                }
                None
            },
            State::Body if byte == ETX => {
                self.state = State::Hunt;
                if self.dropped > 0 {
                    trace!("Frame overflow, {} bytes discarded", self.dropped);
                }
                Some(std::mem::take(&mut self.body))
            },
            State::Body if byte == SUBST => {
                self.state = State::Escape;
                None
            },
            State::Body | State::Escape => {
                self.state = State::Body;
                self.store(byte);
                None
            },
        }
    }

    /// Whether a frame has started but not yet ended.
    pub fn in_frame(&self) -> bool {
        self.state != State::Hunt
    }

    /// Drop any partial frame.
    pub fn reset(&mut self) {
        self.state = State::Hunt;
        self.body.clear();
        self.dropped = 0;
    }

    fn store(&mut self, byte: u8) {
        if self.body.len() < self.capacity {
            self.body.push(byte);
        } else {
            self.dropped += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::packet::{Command, PACKET_LEN, Packet};

    #[test]
    fn test_encode_escapes_control_bytes() {
        let framed = encode(&[0x00, 0x05, 0x02, 0x03, 0x04, 0xFF]);
        assert_eq!(
            framed,
            vec![STX, SUBST, 0x00, 0x05, SUBST, 0x02, SUBST, 0x03, SUBST, 0x04, 0xFF, ETX]
        );
    }

    #[test]
    fn test_encode_never_leaves_bare_etx() {
        let body: Vec<u8> = (0..=255).collect();
        let framed = encode(&body);
        let inner = &framed[1..framed.len() - 1];

        let mut i = 0;
        while i < inner.len() {
            if inner[i] == SUBST {
                assert!(inner[i + 1] <= SUBST, "escape before {:#04x}", inner[i + 1]);
                i += 2;
            } else {
                assert!(inner[i] > SUBST, "bare control byte at {i}");
                i += 1;
            }
        }
    }

    #[test]
    fn test_decode_packet() {
        let packet = Packet::new(0x1F, Command::WriteProgramMemory)
            .with_param(0x0400)
            .with_seq(3)
            .with_payload(&[0x01, 0x02, 0x03, 0x04, 0x00, 0xFF]);
        let bytes = packet.to_bytes();
        let body = decode(&encode(&bytes), PACKET_LEN).unwrap();
        assert_eq!(body, bytes);
        assert_eq!(Packet::from_bytes(&body).unwrap(), packet);
    }

    #[test]
    fn test_decode_skips_noise_before_stx() {
        let mut data = vec![0xC1, 0x55, 0x81];
        data.extend(encode(b"hello"));
        assert_eq!(decode(&data, 16).unwrap(), b"hello");
    }

    #[test]
    fn test_decode_without_stx() {
        assert!(decode(&[0x10, 0x20, ETX], 16).is_none());
    }

    #[test]
    fn test_decode_without_etx() {
        let framed = encode(b"abc");
        assert!(decode(&framed[..framed.len() - 1], 16).is_none());
    }

    #[test]
    fn test_decode_escaped_etx_is_data() {
        let data = [STX, 0x41, SUBST, ETX, 0x42, ETX];
        assert_eq!(decode(&data, 16).unwrap(), vec![0x41, ETX, 0x42]);
    }

    #[test]
    fn test_decode_truncates_oversized_frame() {
        let framed = encode(&[0x55; 20]);
        assert_eq!(decode(&framed, 8).unwrap(), vec![0x55; 8]);
    }

    #[test]
    fn test_deframer_consecutive_frames() {
        let mut deframer = Deframer::new(16);
        let mut frames = Vec::new();
        for byte in encode(b"one")
            .into_iter()
            .chain(encode(b"two"))
        {
            if let Some(frame) = deframer.push(byte) {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![b"one".to_vec(), b"two".to_vec()]);
        assert!(!deframer.in_frame());
    }

    #[test]
    fn test_deframer_reset_drops_partial() {
        let mut deframer = Deframer::new(16);
        deframer.push(STX);
        deframer.push(0x41);
        assert!(deframer.in_frame());
        deframer.reset();
        assert!(!deframer.in_frame());
        assert!(deframer.push(ETX).is_none());
    }
}
