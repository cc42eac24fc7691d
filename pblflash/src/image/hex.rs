//! Intel HEX reader.
//!
//! Only data records are loaded. The first record fixes the load address,
//! and the first record of any other type ends the image. Gaps between
//! records keep the erased pattern of the target memory.

use {
    super::Memory,
    crate::error::{Error, Result},
    log::trace,
};

/// Record type of a data record.
const RECORD_DATA: u8 = 0x00;

/// Bytes in a record besides its data: count, address (2), type, checksum.
const RECORD_OVERHEAD: usize = 5;

/// Data loaded from a HEX file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HexImage {
    /// Byte address of the first record.
    pub load_address: u16,
    /// Image bytes from the load address to the highest byte written.
    pub data: Vec<u8>,
}

/// Parse Intel HEX text for `memory`, rejecting images larger than
/// `max_bytes`.
pub fn parse(text: &str, max_bytes: usize, memory: Memory) -> Result<HexImage> {
    let mut load_address = None;
    let mut data = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let lineno = index + 1;
        let Some(record) = line
            .trim_end()
            .strip_prefix(':')
        else {
            continue;
        };
        let bytes = decode_record(record).map_err(|reason| Error::HexParse {
            line: lineno,
            reason,
        })?;

        let count = usize::from(bytes[0]);
        let address = u16::from_be_bytes([bytes[1], bytes[2]]);
        let kind = bytes[3];
        let base = *load_address.get_or_insert(address);

        if kind != RECORD_DATA {
            trace!("Record type {kind:#04x} on line {lineno} ends the image");
            return Ok(HexImage {
                load_address: base,
                data,
            });
        }

        let offset = address
            .checked_sub(base)
            .map(usize::from)
            .ok_or_else(|| Error::HexParse {
                line: lineno,
                reason: format!("address {address:#06x} below load address {base:#06x}"),
            })?;
        let end = offset + count;
        if end > max_bytes {
            return Err(Error::InvalidImage(format!(
                "line {lineno}: image exceeds {max_bytes} bytes"
            )));
        }

        if data.len() < end {
            let start = data.len();
            data.extend((start..end).map(|i| memory.erased_byte(i)));
        }
        data[offset..end].copy_from_slice(&bytes[4..4 + count]);
    }

    Err(Error::HexParse {
        line: text.lines().count(),
        reason: "premature end of file".into(),
    })
}

/// Decode the hex digits of one record and verify length and checksum.
fn decode_record(record: &str) -> std::result::Result<Vec<u8>, String> {
    if !record.is_ascii() || record.len() % 2 != 0 {
        return Err("malformed record".into());
    }
    let bytes = (0..record.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&record[i..i + 2], 16))
        .collect::<std::result::Result<Vec<u8>, _>>()
        .map_err(|e| format!("invalid hex digit: {e}"))?;

    if bytes.len() < RECORD_OVERHEAD || bytes.len() != usize::from(bytes[0]) + RECORD_OVERHEAD {
        return Err(format!("record length {} does not match its count", bytes.len()));
    }
    let sum = bytes
        .iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b));
    if sum != 0 {
        return Err("checksum error".into());
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build one data record line with a valid checksum.
    fn record(address: u16, kind: u8, data: &[u8]) -> String {
        let mut bytes = vec![data.len() as u8];
        bytes.extend(address.to_be_bytes());
        bytes.push(kind);
        bytes.extend_from_slice(data);
        let sum = bytes
            .iter()
            .fold(0u8, |acc, &b| acc.wrapping_add(b));
        bytes.push(sum.wrapping_neg());
        let digits: String = bytes
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect();
        format!(":{digits}")
    }

    const EOF: &str = ":00000001FF";

    #[test]
    fn test_parse_known_record() {
        let text = ":0408000001020304EA\n:00000001FF\n";
        let image = parse(text, 1024, Memory::Program).unwrap();
        assert_eq!(image.load_address, 0x0800);
        assert_eq!(image.data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_parse_skips_non_record_lines() {
        let text = format!("; comment\n\n{}\r\n{EOF}\n", record(0x0800, 0, &[0xAA, 0x55]));
        let image = parse(&text, 1024, Memory::Program).unwrap();
        assert_eq!(image.data, vec![0xAA, 0x55]);
    }

    #[test]
    fn test_parse_fills_gaps_with_erased_words() {
        let text = format!(
            "{}\n{}\n{EOF}\n",
            record(0x0800, 0, &[1, 2]),
            record(0x0806, 0, &[3, 4])
        );
        let image = parse(&text, 1024, Memory::Program).unwrap();
        assert_eq!(image.data, vec![1, 2, 0xFF, 0x3F, 0xFF, 0x3F, 3, 4]);
    }

    #[test]
    fn test_parse_eeprom_gaps_are_erased_bytes() {
        let text = format!(
            "{}
{}
{EOF}
",
            record(0x0000, 0, &[1, 2]),
            record(0x0005, 0, &[3])
        );
        let image = parse(&text, 256, Memory::Eeprom).unwrap();
        assert_eq!(image.data, vec![1, 2, 0xFF, 0xFF, 0xFF, 3]);
    }

    #[test]
    fn test_parse_out_of_order_records() {
        let text = format!(
            "{}\n{}\n{}\n{EOF}\n",
            record(0x0800, 0, &[1, 2]),
            record(0x0810, 0, &[9, 9]),
            record(0x0802, 0, &[3, 4]),
        );
        let image = parse(&text, 1024, Memory::Program).unwrap();
        assert_eq!(image.data.len(), 0x12);
        assert_eq!(&image.data[..6], &[1, 2, 3, 4, 0xFF, 0x3F]);
        assert_eq!(&image.data[0x10..], &[9, 9]);
    }

    #[test]
    fn test_parse_stops_at_first_non_data_record() {
        let text = format!(
            "{}\n{}\n{}\n{EOF}\n",
            record(0x0800, 0, &[1, 2]),
            record(0x0000, 4, &[0x00, 0x01]),
            record(0x0802, 0, &[3, 4]),
        );
        let image = parse(&text, 1024, Memory::Program).unwrap();
        assert_eq!(image.data, vec![1, 2]);
    }

    #[test]
    fn test_parse_bad_checksum() {
        let text = ":0408000001020304EB\n:00000001FF\n";
        assert!(matches!(
            parse(text, 1024, Memory::Program),
            Err(Error::HexParse { line: 1, .. })
        ));
    }

    #[test]
    fn test_parse_premature_eof() {
        let text = format!("{}\n", record(0x0800, 0, &[1, 2]));
        assert!(matches!(
            parse(&text, 1024, Memory::Program),
            Err(Error::HexParse { reason, .. }) if reason.contains("premature")
        ));
    }

    #[test]
    fn test_parse_too_large() {
        let text = format!("{}\n{EOF}\n", record(0x0800, 0, &[0; 16]));
        assert!(matches!(
            parse(&text, 8, Memory::Program),
            Err(Error::InvalidImage(_))
        ));
        assert!(parse(&text, 16, Memory::Program).is_ok());
    }

    #[test]
    fn test_parse_address_below_load_address() {
        let text = format!(
            "{}\n{}\n{EOF}\n",
            record(0x0800, 0, &[1, 2]),
            record(0x07F0, 0, &[3, 4])
        );
        assert!(matches!(
            parse(&text, 1024, Memory::Program),
            Err(Error::HexParse { line: 2, .. })
        ));
    }

    #[test]
    fn test_parse_length_mismatch() {
        assert!(matches!(
            parse(":0508000001020304E5\n:00000001FF\n", 1024, Memory::Program),
            Err(Error::HexParse { line: 1, .. })
        ));
        assert!(parse(":0408000001020304E\n", 1024, Memory::Program).is_err());
        assert!(parse(":04080000010203ZZE5\n", 1024, Memory::Program).is_err());
    }
}
