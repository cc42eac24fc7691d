//! Program memory row I/O and the application integrity check.

use {
    crate::{
        device::{ERASED_WORD, NvmOp, Target, UNLOCK_KEYS},
        protocol::{crc::Crc16, trailer::Trailer},
    },
    log::{debug, trace},
};

/// Align `addr` down to the start of its row.
pub fn row_base(row_words: u16, addr: u16) -> u16 {
    addr & !(row_words - 1)
}

/// Erase the row containing `addr` and program it from `data`.
///
/// `data` holds little-endian words; missing words are programmed erased.
/// Every strobe is preceded by the unlock sequence, and each latch group is
/// committed by its last word.
pub fn write_row<T: Target>(target: &mut T, addr: u16, data: &[u8]) {
    let profile = *target.profile();
    let base = row_base(profile.row_words, addr);
    trace!("Writing row at {base:#06x}");

    target.nvm_unlock(UNLOCK_KEYS);
    target.nvm_write(NvmOp::EraseRow { addr: base });

    for i in 0..profile.row_words {
        let at = usize::from(i) * 2;
        let word = match data.get(at..at + 2) {
            Some(pair) => u16::from_le_bytes([pair[0], pair[1]]),
            None => ERASED_WORD,
        };
        let commit = (i + 1) % profile.latch_words == 0;
        target.nvm_unlock(UNLOCK_KEYS);
        target.nvm_write(NvmOp::LoadLatch {
            addr: base + i,
            word,
            commit,
        });
    }
}

/// Read the whole row containing `addr` into `buf` as little-endian words.
pub fn read_row<T: Target>(target: &mut T, addr: u16, buf: &mut [u8]) {
    let base = row_base(target.profile().row_words, addr);
    for (offset, pair) in (0u16..).zip(buf.chunks_exact_mut(2)) {
        if offset == target.profile().row_words {
            break;
        }
        pair.copy_from_slice(&target.nvm_read(base + offset).to_le_bytes());
    }
}

/// Outcome of the application integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    /// Signature present and CRC matches.
    Intact,
    /// The last row carries no signature.
    NoSignature,
    /// Used row count reaches into the trailer row or beyond.
    BadRowCount(u16),
    /// CRC over the used rows differs from the trailer.
    CrcMismatch {
        /// CRC stored in the trailer.
        expected: u16,
        /// CRC computed from flash.
        actual: u16,
    },
}

impl Integrity {
    /// Whether the application may be started.
    pub fn is_intact(self) -> bool {
        self == Self::Intact
    }
}

/// Verify the application image against its trailer.
///
/// The watchdog is serviced once per row folded.
pub fn check_app<T: Target>(target: &mut T) -> Integrity {
    let profile = *target.profile();
    let mut row = vec![0u8; profile.row_bytes()];

    read_row(target, profile.trailer_row(), &mut row);
    let Some(trailer) = Trailer::read_from(&row) else {
        debug!("No application signature");
        return Integrity::NoSignature;
    };

    let app_rows = profile.app_words() / profile.row_words;
    if trailer.rows_used >= app_rows {
        debug!("Row count {} out of range", trailer.rows_used);
        return Integrity::BadRowCount(trailer.rows_used);
    }

    let mut crc = Crc16::new();
    let mut addr = profile.app_start();
    for _ in 0..trailer.rows_used {
        read_row(target, addr, &mut row);
        crc.update(&row);
        addr += profile.row_words;
        target.restart_wdt();
    }

    if crc.value() == trailer.crc {
        Integrity::Intact
    } else {
        debug!(
            "Application CRC {:#06x}, trailer says {:#06x}",
            crc.value(),
            trailer.crc
        );
        Integrity::CrcMismatch {
            expected: trailer.crc,
            actual: crc.value(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{DeviceProfile, sim::SimTarget},
        protocol::crc::crc16,
    };

    fn ramp_row(seed: u16) -> Vec<u8> {
        (0..32u16)
            .flat_map(|i| ((seed + i) & 0x3FFF).to_le_bytes())
            .collect()
    }

    /// Program `rows` ramp rows from the application base plus a trailer.
    fn install_app(target: &mut SimTarget, rows: u16) -> u16 {
        let profile = *target.profile();
        let mut crc = 0;
        for r in 0..rows {
            let data = ramp_row(r * 32);
            crc = crc16(crc, &data);
            write_row(target, profile.app_start() + r * 32, &data);
        }
        let mut last = vec![0xFF, 0x3F].repeat(32);
        Trailer {
            rows_used: rows,
            crc,
        }
        .write_into(&mut last);
        write_row(target, profile.trailer_row(), &last);
        crc
    }

    #[test]
    fn test_row_base() {
        assert_eq!(row_base(32, 0x0400), 0x0400);
        assert_eq!(row_base(32, 0x041F), 0x0400);
        assert_eq!(row_base(32, 0x0420), 0x0420);
    }

    #[test]
    fn test_write_then_read_row() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        let data = ramp_row(0x100);
        write_row(&mut target, 0x0410, &data);

        let mut buf = [0u8; 64];
        read_row(&mut target, 0x0400, &mut buf);
        assert_eq!(buf.to_vec(), data);
        assert_eq!(target.erase_count(), 1);
    }

    #[test]
    fn test_write_row_commits_per_latch_group() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X_LARGE);
        write_row(&mut target, 0x0800, &ramp_row(0));
        assert_eq!(target.commit_count(), 4);

        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        write_row(&mut target, 0x0400, &ramp_row(0));
        assert_eq!(target.commit_count(), 1);
    }

    #[test]
    fn test_write_row_erases_previous_content() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        write_row(&mut target, 0x0400, &ramp_row(7));
        write_row(&mut target, 0x0400, &[0x34, 0x12]);

        assert_eq!(target.word(0x0400), 0x1234);
        assert_eq!(target.word(0x0401), ERASED_WORD);
        assert_eq!(target.word(0x041F), ERASED_WORD);
    }

    #[test]
    fn test_words_are_fourteen_bits() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        write_row(&mut target, 0x0400, &[0xFF, 0xFF]);
        assert_eq!(target.word(0x0400), 0x3FFF);
    }

    #[test]
    fn test_check_app_intact() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        install_app(&mut target, 3);
        let before = target.watchdog_restarts();
        assert_eq!(check_app(&mut target), Integrity::Intact);
        assert_eq!(target.watchdog_restarts() - before, 3);
    }

    #[test]
    fn test_check_app_blank_device() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        assert_eq!(check_app(&mut target), Integrity::NoSignature);
    }

    #[test]
    fn test_check_app_detects_single_corrupt_byte() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        install_app(&mut target, 3);

        let addr = 0x0400 + 32 + 5;
        let word = target.word(addr);
        target.set_word(addr, word ^ 0x0001);

        assert!(matches!(
            check_app(&mut target),
            Integrity::CrcMismatch { .. }
        ));
    }

    #[test]
    fn test_check_app_folds_exactly_rows_used() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        install_app(&mut target, 2);

        // Data past the used rows is not covered.
        write_row(&mut target, 0x0400 + 64, &ramp_row(0x2000));
        assert_eq!(check_app(&mut target), Integrity::Intact);

        // Claiming one more row breaks the match.
        let mut last = [0u8; 64];
        read_row(&mut target, 0x3FE0, &mut last);
        let mut trailer = Trailer::read_from(&last).unwrap();
        trailer.rows_used = 3;
        trailer.write_into(&mut last);
        write_row(&mut target, 0x3FE0, &last);
        assert!(!check_app(&mut target).is_intact());
    }

    #[test]
    fn test_check_app_rejects_row_count_into_trailer() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        let mut last = [0u8; 64];
        Trailer {
            rows_used: 0x3C00 / 32,
            crc: 0,
        }
        .write_into(&mut last);
        write_row(&mut target, 0x3FE0, &last);
        assert_eq!(check_app(&mut target), Integrity::BadRowCount(480));
    }
}
