//! In-memory target for host-side testing.
//!
//! [`SimTarget`] models program memory with write latches and the unlock
//! requirement, data EEPROM, configuration words and a UART. [`SimPort`]
//! wraps a [`Bootloader`] running on a `SimTarget` behind the [`Port`]
//! trait, so the host transfer engine can talk to it like a serial device.

use {
    crate::{
        device::{
            CONFIG_BLOCK_WORDS, DeviceProfile, EE_BOOT_SENTINEL, EE_NODE_ADDRESS, ERASED_WORD,
            NvmOp, Target, UNLOCK_KEYS,
            bootloader::{Bootloader, Terminal},
        },
        error::Result,
        port::Port,
        protocol::{frame::Deframer, packet::PACKET_LEN},
    },
    std::{
        collections::VecDeque,
        io::{self, Read, Write},
        time::Duration,
    },
};

/// Mask applied to every programmed word.
const WORD_MASK: u16 = 0x3FFF;

/// Simulated microcontroller.
#[derive(Debug, Clone)]
pub struct SimTarget {
    profile: DeviceProfile,
    flash: Vec<u16>,
    latches: Vec<(u16, u16)>,
    unlocked: bool,
    eeprom: Vec<u8>,
    config: [u16; CONFIG_BLOCK_WORDS as usize],
    rx: VecDeque<u8>,
    tx: Vec<u8>,
    tx_enabled: bool,
    button: bool,
    erases: usize,
    commits: usize,
    rejected_strobes: usize,
    wdt_restarts: usize,
    resets: usize,
    app_entry: Option<u16>,
}

impl SimTarget {
    /// Blank device: program memory and EEPROM erased.
    pub fn new(profile: DeviceProfile) -> Self {
        let mut config = [0u16; CONFIG_BLOCK_WORDS as usize];
        config[..4].copy_from_slice(&[0x3FFF; 4]);
        // PIC16F1938 rev A4
        config[6] = 0x2384;
        config[7] = 0x3FE4;
        config[8] = 0x3EFF;

        Self {
            profile,
            flash: vec![ERASED_WORD; usize::from(profile.total_words)],
            latches: Vec::new(),
            unlocked: false,
            eeprom: vec![0xFF; usize::from(profile.eeprom_bytes)],
            config,
            rx: VecDeque::new(),
            tx: Vec::new(),
            tx_enabled: false,
            button: false,
            erases: 0,
            commits: 0,
            rejected_strobes: 0,
            wdt_restarts: 0,
            resets: 0,
            app_entry: None,
        }
    }

    /// Program the node address cell.
    #[must_use]
    pub fn with_address(mut self, address: u8) -> Self {
        self.eeprom_write(EE_NODE_ADDRESS, address);
        self
    }

    /// Set the boot sentinel cell.
    #[must_use]
    pub fn with_boot_sentinel(mut self) -> Self {
        self.eeprom_write(EE_BOOT_SENTINEL, super::BOOT_SENTINEL);
        self
    }

    /// Hold or release the bootloader button.
    #[must_use]
    pub fn with_button(mut self, pressed: bool) -> Self {
        self.button = pressed;
        self
    }

    /// Program memory word at `addr`.
    pub fn word(&self, addr: u16) -> u16 {
        self.flash
            .get(usize::from(addr))
            .copied()
            .unwrap_or(ERASED_WORD)
    }

    /// Overwrite a word directly, bypassing the NVM controller.
    pub fn set_word(&mut self, addr: u16, word: u16) {
        if let Some(slot) = self.flash.get_mut(usize::from(addr)) {
            *slot = word & WORD_MASK;
        }
    }

    /// Data EEPROM contents.
    pub fn eeprom(&self) -> &[u8] {
        &self.eeprom
    }

    /// Queue bytes on the receiver.
    pub fn feed(&mut self, data: &[u8]) {
        self.rx.extend(data);
    }

    /// Take everything transmitted so far.
    pub fn take_tx(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.tx)
    }

    /// Number of row erases performed.
    pub fn erase_count(&self) -> usize {
        self.erases
    }

    /// Number of latch group commits performed.
    pub fn commit_count(&self) -> usize {
        self.commits
    }

    /// Strobes ignored for lack of an unlock sequence.
    pub fn rejected_strobes(&self) -> usize {
        self.rejected_strobes
    }

    /// Number of watchdog services.
    pub fn watchdog_restarts(&self) -> usize {
        self.wdt_restarts
    }

    /// Number of resets requested.
    pub fn reset_count(&self) -> usize {
        self.resets
    }

    /// Application entry point, once control was handed over.
    pub fn app_entry(&self) -> Option<u16> {
        self.app_entry
    }

    /// Whether the transmitter is currently enabled.
    pub fn tx_enabled(&self) -> bool {
        self.tx_enabled
    }
}

impl Target for SimTarget {
    fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    fn nvm_read(&mut self, addr: u16) -> u16 {
        self.word(addr)
    }

    fn nvm_unlock(&mut self, keys: [u8; 2]) {
        self.unlocked = keys == UNLOCK_KEYS;
    }

    fn nvm_write(&mut self, op: NvmOp) {
        if !std::mem::take(&mut self.unlocked) {
            self.rejected_strobes += 1;
            return;
        }
        match op {
            NvmOp::EraseRow { addr } => {
                let base = usize::from(addr & !(self.profile.row_words - 1));
                let end = (base + usize::from(self.profile.row_words)).min(self.flash.len());
                if base < end {
                    self.flash[base..end].fill(ERASED_WORD);
                }
                self.latches.clear();
                self.erases += 1;
            },
            NvmOp::LoadLatch { addr, word, commit } => {
                self.latches.push((addr, word & WORD_MASK));
                if commit {
                    for (addr, word) in self.latches.drain(..) {
                        if let Some(slot) = self.flash.get_mut(usize::from(addr)) {
                            *slot = word;
                        }
                    }
                    self.commits += 1;
                }
            },
        }
    }

    fn eeprom_read(&mut self, addr: u8) -> u8 {
        self.eeprom
            .get(usize::from(addr))
            .copied()
            .unwrap_or(0xFF)
    }

    fn eeprom_write(&mut self, addr: u8, value: u8) {
        if let Some(cell) = self.eeprom.get_mut(usize::from(addr)) {
            *cell = value;
        }
    }

    fn config_read(&mut self, index: u8) -> u16 {
        self.config
            .get(usize::from(index))
            .copied()
            .unwrap_or(ERASED_WORD)
    }

    fn getc(&mut self) -> Option<u8> {
        self.rx.pop_front()
    }

    fn putc(&mut self, byte: u8) {
        self.tx.push(byte);
    }

    fn set_tx_enable(&mut self, enabled: bool) {
        self.tx_enabled = enabled;
    }

    fn tx_wait_empty(&mut self) {}

    fn restart_wdt(&mut self) {
        self.wdt_restarts += 1;
    }

    fn button_pressed(&mut self) -> bool {
        self.button
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn start_app(&mut self, entry: u16) {
        self.app_entry = Some(entry);
    }
}

/// [`Port`] connected to a simulated bootloader.
///
/// Bytes written are processed immediately; replies are queued for reading.
/// Reads with nothing queued fail with `TimedOut`, like a silent device.
pub struct SimPort {
    bootloader: Bootloader<SimTarget>,
    output: VecDeque<u8>,
    terminal: Option<Terminal>,
    timeout: Duration,
    baud_rate: u32,
    drop_frames: usize,
    drop_watch: Deframer,
}

impl SimPort {
    /// Attach to a running bootloader.
    pub fn new(bootloader: Bootloader<SimTarget>) -> Self {
        Self {
            bootloader,
            output: VecDeque::new(),
            terminal: None,
            timeout: Duration::from_millis(10),
            baud_rate: 9600,
            drop_frames: 0,
            drop_watch: Deframer::new(PACKET_LEN),
        }
    }

    /// Lose the next `count` host frames on the way to the device.
    pub fn drop_next_frames(&mut self, count: usize) {
        self.drop_frames = count;
    }

    /// The simulated bootloader.
    pub fn bootloader(&self) -> &Bootloader<SimTarget> {
        &self.bootloader
    }

    /// Terminal action taken by the device, if any.
    pub fn terminal(&self) -> Option<Terminal> {
        self.terminal
    }

    /// Detach and return the bootloader.
    pub fn into_bootloader(self) -> Bootloader<SimTarget> {
        self.bootloader
    }

    fn deliver(&mut self, byte: u8) {
        if self.terminal.is_some() {
            return;
        }
        if self.drop_frames > 0 {
            if self
                .drop_watch
                .push(byte)
                .is_some()
            {
                self.drop_frames -= 1;
            }
            return;
        }
        self.terminal = self.bootloader.on_byte(byte);
        let tx = self
            .bootloader
            .target_mut()
            .take_tx();
        self.output.extend(tx);
    }
}

impl Port for SimPort {
    fn name(&self) -> &str {
        "sim"
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn clear_buffers(&mut self) -> Result<()> {
        self.output.clear();
        Ok(())
    }
}

impl Read for SimPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.output.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply"));
        }
        let n = buf.len().min(self.output.len());
        for (slot, byte) in buf.iter_mut().zip(self.output.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for &byte in buf {
            self.deliver(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strobe_without_unlock_is_ignored() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        target.nvm_write(NvmOp::LoadLatch {
            addr: 0x0400,
            word: 0x0123,
            commit: true,
        });
        assert_eq!(target.word(0x0400), ERASED_WORD);
        assert_eq!(target.rejected_strobes(), 1);

        target.nvm_unlock([0x55, 0xAB]);
        target.nvm_write(NvmOp::EraseRow { addr: 0x0400 });
        assert_eq!(target.erase_count(), 0);
        assert_eq!(target.rejected_strobes(), 2);
    }

    #[test]
    fn test_unlock_covers_one_strobe() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        target.nvm_unlock(UNLOCK_KEYS);
        target.nvm_write(NvmOp::LoadLatch {
            addr: 0x0400,
            word: 0x0001,
            commit: false,
        });
        target.nvm_write(NvmOp::LoadLatch {
            addr: 0x0401,
            word: 0x0002,
            commit: true,
        });
        assert_eq!(target.rejected_strobes(), 1);
        assert_eq!(target.commit_count(), 0);
        assert_eq!(target.word(0x0400), ERASED_WORD);
    }

    #[test]
    fn test_eeprom_cells() {
        let target = SimTarget::new(DeviceProfile::PIC16F193X)
            .with_address(7)
            .with_boot_sentinel();
        assert_eq!(target.eeprom()[0xFF], 7);
        assert_eq!(target.eeprom()[0xFE], 0x55);
        assert_eq!(target.eeprom().len(), 256);
    }

    #[test]
    fn test_sim_port_times_out_when_silent() {
        let target = SimTarget::new(DeviceProfile::PIC16F193X);
        let mut port = SimPort::new(Bootloader::new(target).unwrap());
        let mut buf = [0u8; 1];
        let err = port
            .read(&mut buf)
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
