//! Device-side session state machine.
//!
//! One [`Bootloader`] owns the target and all per-session state: the receive
//! deframer, the sequence counter, the write-enable latch and the node
//! address. Each complete frame goes through [`Bootloader::process_packet`],
//! which validates and dispatches it, then [`Bootloader::send_reply`] puts the
//! answer on the wire and performs any terminal action.

use {
    crate::{
        device::{
            BOOT_SENTINEL, CONFIG_BLOCK_WORDS, DeviceProfile, EE_BOOT_SENTINEL, EE_NODE_ADDRESS,
            TEST_ADDRESS, Target,
            flash::{self, Integrity},
        },
        error::Result,
        protocol::{
            frame::{self, Deframer},
            packet::{
                CONFIG_WORDS, Command, FRAME_MARKER, PACKET_LEN, PAYLOAD_LEN, Packet, Response,
                control,
            },
        },
    },
    log::{debug, info, trace, warn},
};

/// Reply decided for one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Frame failed validation; nothing is sent.
    Ignore,
    /// Command accepted.
    Ack,
    /// Command refused.
    Nak,
    /// Send the query response packet.
    QueryResponse,
    /// The application image failed its integrity check.
    CheckFailed,
    /// Acknowledge, then leave the bootloader.
    Terminal(Terminal),
}

/// Action ending a bootloader session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Restart the device.
    Reset,
    /// Jump to the application.
    Execute,
}

/// Why the bootloader stayed resident at power-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryReason {
    /// The bootloader button was held.
    Button,
    /// The EEPROM boot sentinel was set.
    Sentinel,
    /// The application failed its integrity check.
    CorruptApplication(Integrity),
}

/// Outcome of the power-on decision.
pub enum PowerOn<T: Target> {
    /// Control went to the application.
    Application(T),
    /// The bootloader is running.
    Bootloader(Bootloader<T>, EntryReason),
}

/// Bootloader session.
pub struct Bootloader<T: Target> {
    target: T,
    address: u8,
    seq: u16,
    write_enabled: bool,
    deframer: Deframer,
}

impl<T: Target> Bootloader<T> {
    /// Decide between the application and the bootloader.
    ///
    /// The bootloader stays resident if the button is held, the boot
    /// sentinel is set, or the application is not intact. Otherwise control
    /// is handed to the application entry point.
    pub fn power_on(mut target: T) -> Result<PowerOn<T>> {
        target.profile().validate()?;
        let reason = if target.button_pressed() {
            Some(EntryReason::Button)
        } else if target.eeprom_read(EE_BOOT_SENTINEL) == BOOT_SENTINEL {
            Some(EntryReason::Sentinel)
        } else {
            match flash::check_app(&mut target) {
                Integrity::Intact => None,
                integrity => Some(EntryReason::CorruptApplication(integrity)),
            }
        };

        match reason {
            Some(reason) => {
                info!("Staying in bootloader: {reason:?}");
                Ok(PowerOn::Bootloader(Self::new(target)?, reason))
            },
            None => {
                let entry = target.profile().app_start();
                debug!("Starting application at {entry:#06x}");
                target.start_app(entry);
                Ok(PowerOn::Application(target))
            },
        }
    }

    /// Start a session, reading the node address from EEPROM.
    ///
    /// Fails if the target's geometry does not fit the packet format.
    pub fn new(mut target: T) -> Result<Self> {
        target.profile().validate()?;
        let address = match target.eeprom_read(EE_NODE_ADDRESS) {
            0xFF => TEST_ADDRESS,
            address => address,
        };
        Ok(Self {
            target,
            address,
            seq: 0,
            write_enabled: false,
            deframer: Deframer::new(PACKET_LEN),
        })
    }

    /// Node address this session answers to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Current sequence counter.
    pub fn seq(&self) -> u16 {
        self.seq
    }

    /// Whether memory writes are allowed.
    pub fn write_enabled(&self) -> bool {
        self.write_enabled
    }

    /// The underlying target.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// The underlying target, mutably.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// End the session and return the target.
    pub fn into_target(self) -> T {
        self.target
    }

    fn profile(&self) -> DeviceProfile {
        *self.target.profile()
    }

    /// Receive until the line closes or a terminal command is handled.
    pub fn run(&mut self) -> Option<Terminal> {
        while let Some(byte) = self.target.getc() {
            if let Some(terminal) = self.on_byte(byte) {
                return Some(terminal);
            }
        }
        None
    }

    /// Feed one received byte.
    pub fn on_byte(&mut self, byte: u8) -> Option<Terminal> {
        let body = self.deframer.push(byte)?;
        let reply = self.process_packet(&body);
        self.send_reply(reply)
    }

    /// Validate and dispatch one frame body.
    pub fn process_packet(&mut self, body: &[u8]) -> Reply {
        let packet = match Packet::from_bytes(body) {
            Ok(packet) => packet,
            Err(e) => {
                trace!("Dropping frame: {e}");
                return Reply::Ignore;
            },
        };
        if packet.marker != FRAME_MARKER {
            trace!("Dropping frame with marker {:#04x}", packet.marker);
            return Reply::Ignore;
        }
        if packet.address != self.address {
            trace!("Frame for node {} ignored", packet.address);
            return Reply::Ignore;
        }

        let Some(command) = packet.command() else {
            debug!("Unknown command {:#04x}", packet.command);
            return Reply::Nak;
        };
        debug!(
            "{command:?} param={:#06x} seq={} (expecting {})",
            packet.param, packet.seq, self.seq
        );

        match command {
            Command::Query => {
                self.seq = 0;
                self.write_enabled = false;
                Reply::QueryResponse
            },
            Command::WriteEnable => {
                self.write_enabled = true;
                Reply::Ack
            },
            Command::WriteProgramMemory => {
                let profile = self.profile();
                if self.write_allowed(packet.seq)
                    && packet.param >= profile.app_start()
                    && packet.param < profile.total_words
                {
                    flash::write_row(&mut self.target, packet.param, &packet.payload);
                    Reply::Ack
                } else {
                    Reply::Nak
                }
            },
            Command::WriteEeprom => {
                let offset = packet.param as u8;
                let fits =
                    usize::from(offset) + PAYLOAD_LEN <= usize::from(self.profile().eeprom_bytes);
                if self.write_allowed(packet.seq) && fits {
                    for (i, &value) in packet.payload.iter().enumerate() {
                        self.target.eeprom_write(offset + i as u8, value);
                    }
                    Reply::Ack
                } else {
                    Reply::Nak
                }
            },
            Command::CheckApp => match flash::check_app(&mut self.target) {
                Integrity::Intact => Reply::Ack,
                integrity => {
                    warn!("Application check failed: {integrity:?}");
                    Reply::CheckFailed
                },
            },
            Command::Reset => Reply::Terminal(Terminal::Reset),
            Command::Execute => Reply::Terminal(Terminal::Execute),
        }
    }

    fn write_allowed(&self, seq: u16) -> bool {
        self.write_enabled && seq == self.seq
    }

    /// Transmit `reply`; performs and returns the terminal action, if any.
    pub fn send_reply(&mut self, reply: Reply) -> Option<Terminal> {
        if reply == Reply::Ignore {
            return None;
        }

        self.target.set_tx_enable(true);
        let terminal = match reply {
            Reply::Ignore => None,
            Reply::Ack => {
                self.target.putc(control::ACK);
                self.seq = self.seq.wrapping_add(1);
                None
            },
            Reply::Nak => {
                self.target.putc(control::NAK);
                None
            },
            Reply::CheckFailed => {
                self.target.putc(control::STX);
                None
            },
            Reply::QueryResponse => {
                self.send_query_response();
                None
            },
            Reply::Terminal(terminal) => {
                self.target.putc(control::ACK);
                Some(terminal)
            },
        };
        self.target.tx_wait_empty();
        self.target.set_tx_enable(false);

        match terminal {
            Some(Terminal::Reset) => {
                info!("Resetting");
                self.target.reset();
            },
            Some(Terminal::Execute) => {
                let entry = self.profile().app_start();
                info!("Starting application at {entry:#06x}");
                self.target.eeprom_write(EE_BOOT_SENTINEL, 0xFF);
                self.target.start_app(entry);
            },
            None => {},
        }
        terminal
    }

    fn send_query_response(&mut self) {
        let profile = self.profile();
        let mut config = [0u16; CONFIG_WORDS];
        for (index, word) in (0..CONFIG_BLOCK_WORDS).zip(config.iter_mut()) {
            *word = self.target.config_read(index);
        }
        let response = Response {
            loader_words: profile.loader_words,
            app_words: profile.app_words(),
            product_id: profile.product_id,
            boot_version: profile.boot_version,
            protocol: profile.protocol,
            config,
        };

        let packet = Packet::zeroed().with_payload(&response.to_payload());
        for byte in frame::encode(&packet.to_bytes()) {
            self.target.putc(byte);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::{ERASED_WORD, sim::SimTarget},
        error::Error,
        protocol::trailer::Trailer,
    };

    const NODE: u8 = 0x1F;

    fn session() -> Bootloader<SimTarget> {
        Bootloader::new(SimTarget::new(DeviceProfile::PIC16F193X)).unwrap()
    }

    fn body(command: Command, param: u16, seq: u16, payload: &[u8]) -> Vec<u8> {
        Packet::new(NODE, command)
            .with_param(param)
            .with_seq(seq)
            .with_payload(payload)
            .to_bytes()
    }

    /// Send one command through the wire path and return what came back.
    fn exchange(
        bl: &mut Bootloader<SimTarget>,
        command: Command,
        param: u16,
        seq: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        for byte in frame::encode(&body(command, param, seq, payload)) {
            bl.on_byte(byte);
        }
        bl.target_mut().take_tx()
    }

    #[test]
    fn test_address_from_eeprom() {
        assert_eq!(session().address(), TEST_ADDRESS);
        let target = SimTarget::new(DeviceProfile::PIC16F193X).with_address(5);
        let bl = Bootloader::new(target).unwrap();
        assert_eq!(bl.address(), 5);
    }

    #[test]
    fn test_query_replies_with_framed_response() {
        let mut bl = session();
        let reply = exchange(&mut bl, Command::Query, 0x55AA, 9, &[]);

        assert_eq!(reply.first(), Some(&control::STX));
        let body = frame::decode(&reply, PACKET_LEN).unwrap();
        let packet = Packet::from_bytes(&body).unwrap();
        assert_eq!(packet.marker, 0);
        assert_eq!(packet.address, 0);

        let response = Response::from_payload(&packet.payload).unwrap();
        assert_eq!(response.loader_words, 0x0400);
        assert_eq!(response.app_words, 0x3C00);
        assert_eq!(response.config[6], 0x2384);
        assert_eq!(bl.seq(), 0);
        assert!(!bl.target().tx_enabled());
    }

    #[test]
    fn test_invalid_frames_are_ignored() {
        let mut bl = session();

        let mut bad_crc = body(Command::WriteEnable, 0, 0, &[]);
        bad_crc[20] ^= 0xFF;
        assert_eq!(bl.process_packet(&bad_crc), Reply::Ignore);

        let mut wrong_marker = Packet::new(NODE, Command::WriteEnable);
        wrong_marker.marker = 0xFE;
        assert_eq!(bl.process_packet(&wrong_marker.to_bytes()), Reply::Ignore);

        let other_node = Packet::new(3, Command::WriteEnable).to_bytes();
        assert_eq!(bl.process_packet(&other_node), Reply::Ignore);

        let short = body(Command::WriteEnable, 0, 0, &[]);
        assert_eq!(bl.process_packet(&short[..40]), Reply::Ignore);

        assert!(!bl.write_enabled());
        assert_eq!(bl.send_reply(Reply::Ignore), None);
        assert!(bl.target_mut().take_tx().is_empty());
    }

    #[test]
    fn test_unknown_command_naks() {
        let mut bl = session();
        let mut packet = Packet::new(NODE, Command::Query);
        packet.command = 0x77;
        assert_eq!(bl.process_packet(&packet.to_bytes()), Reply::Nak);
    }

    #[test]
    fn test_write_requires_enable() {
        let mut bl = session();
        let reply = exchange(&mut bl, Command::WriteProgramMemory, 0x0400, 0, &[0x11; 64]);
        assert_eq!(reply, vec![control::NAK]);
        assert_eq!(bl.target().word(0x0400), ERASED_WORD);
        assert_eq!(bl.seq(), 0);
    }

    #[test]
    fn test_sequence_guards_writes() {
        let mut bl = session();
        assert_eq!(exchange(&mut bl, Command::WriteEnable, 0, 0, &[]), vec![control::ACK]);
        assert_eq!(bl.seq(), 1);

        let reply = exchange(&mut bl, Command::WriteProgramMemory, 0x0400, 5, &[0x11; 64]);
        assert_eq!(reply, vec![control::NAK]);
        assert_eq!(bl.seq(), 1);

        let reply = exchange(&mut bl, Command::WriteProgramMemory, 0x0400, 1, &[0x11; 64]);
        assert_eq!(reply, vec![control::ACK]);
        assert_eq!(bl.seq(), 2);
        assert_eq!(bl.target().word(0x0400), 0x1111);

        // A replay of the same packet is refused.
        let reply = exchange(&mut bl, Command::WriteProgramMemory, 0x0400, 1, &[0x22; 64]);
        assert_eq!(reply, vec![control::NAK]);
        assert_eq!(bl.target().word(0x0400), 0x1111);
    }

    #[test]
    fn test_query_resets_session() {
        let mut bl = session();
        exchange(&mut bl, Command::WriteEnable, 0, 0, &[]);
        exchange(&mut bl, Command::WriteProgramMemory, 0x0400, 1, &[0; 64]);
        assert_eq!(bl.seq(), 2);

        exchange(&mut bl, Command::Query, 0x55AA, 0, &[]);
        assert_eq!(bl.seq(), 0);
        assert!(!bl.write_enabled());

        let reply = exchange(&mut bl, Command::WriteProgramMemory, 0x0420, 0, &[0; 64]);
        assert_eq!(reply, vec![control::NAK]);
    }

    #[test]
    fn test_write_below_application_naks() {
        let mut bl = session();
        exchange(&mut bl, Command::WriteEnable, 0, 0, &[]);
        let reply = exchange(&mut bl, Command::WriteProgramMemory, 0x03E0, 1, &[0; 64]);
        assert_eq!(reply, vec![control::NAK]);
        assert_eq!(bl.seq(), 1);
        assert_eq!(bl.target().erase_count(), 0);
    }

    #[test]
    fn test_write_eeprom_row() {
        let mut bl = session();
        exchange(&mut bl, Command::WriteEnable, 0, 0, &[]);
        let data: Vec<u8> = (0..64).collect();
        let reply = exchange(&mut bl, Command::WriteEeprom, 0x0040, 1, &data);
        assert_eq!(reply, vec![control::ACK]);
        assert_eq!(&bl.target().eeprom()[0x40..0x80], &data[..]);
        assert!(bl.target().eeprom()[..0x40].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_write_eeprom_past_end_naks() {
        let mut bl = session();
        exchange(&mut bl, Command::WriteEnable, 0, 0, &[]);
        let reply = exchange(&mut bl, Command::WriteEeprom, 0x00C1, 1, &[0; 64]);
        assert_eq!(reply, vec![control::NAK]);
        assert_eq!(bl.seq(), 1);
    }

    #[test]
    fn test_check_app_replies() {
        let mut bl = session();
        assert_eq!(exchange(&mut bl, Command::CheckApp, 0, 0, &[]), vec![control::STX]);
        assert_eq!(bl.seq(), 0);

        let mut last = vec![0xFF, 0x3F].repeat(32);
        Trailer { rows_used: 0, crc: 0 }.write_into(&mut last);
        flash::write_row(bl.target_mut(), 0x3FE0, &last);
        assert_eq!(exchange(&mut bl, Command::CheckApp, 0, 0, &[]), vec![control::ACK]);
        assert_eq!(bl.seq(), 1);
    }

    #[test]
    fn test_execute_is_terminal() {
        let target = SimTarget::new(DeviceProfile::PIC16F193X).with_boot_sentinel();
        let mut bl = Bootloader::new(target).unwrap();
        exchange(&mut bl, Command::WriteEnable, 0, 0, &[]);

        let mut result = None;
        for byte in frame::encode(&body(Command::Execute, 0, 1, &[])) {
            result = result.or(bl.on_byte(byte));
        }
        assert_eq!(result, Some(Terminal::Execute));
        assert_eq!(bl.target_mut().take_tx(), vec![control::ACK]);
        assert_eq!(bl.seq(), 1);
        assert_eq!(bl.target().app_entry(), Some(0x0400));
        assert_eq!(bl.target().eeprom()[0xFE], 0xFF);
    }

    #[test]
    fn test_reset_is_terminal() {
        let mut bl = session();
        assert_eq!(
            bl.process_packet(&body(Command::Reset, 0, 0, &[])),
            Reply::Terminal(Terminal::Reset)
        );
        assert_eq!(bl.send_reply(Reply::Terminal(Terminal::Reset)), Some(Terminal::Reset));
        assert_eq!(bl.target().reset_count(), 1);
        assert_eq!(bl.target().app_entry(), None);
    }

    #[test]
    fn test_run_until_terminal() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        target.feed(&frame::encode(&body(Command::WriteEnable, 0, 0, &[])));
        target.feed(&frame::encode(&body(Command::Reset, 0, 1, &[])));
        target.feed(&frame::encode(&body(Command::WriteEnable, 0, 1, &[])));

        let mut bl = Bootloader::new(target).unwrap();
        assert_eq!(bl.run(), Some(Terminal::Reset));
        assert_eq!(bl.target_mut().take_tx(), vec![control::ACK, control::ACK]);
    }

    #[test]
    fn test_power_on_blank_device_stays() {
        let target = SimTarget::new(DeviceProfile::PIC16F193X);
        match Bootloader::power_on(target).unwrap() {
            PowerOn::Bootloader(_, reason) => assert_eq!(
                reason,
                EntryReason::CorruptApplication(Integrity::NoSignature)
            ),
            PowerOn::Application(_) => panic!("blank device started an application"),
        }
    }

    #[test]
    fn test_malformed_profile_is_refused() {
        let zero_row = DeviceProfile {
            row_words: 0,
            ..DeviceProfile::PIC16F193X
        };
        assert!(matches!(
            Bootloader::new(SimTarget::new(zero_row)),
            Err(Error::Unsupported(_))
        ));

        let odd_latch = DeviceProfile {
            latch_words: 12,
            ..DeviceProfile::PIC16F193X
        };
        assert!(matches!(
            Bootloader::power_on(SimTarget::new(odd_latch)),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_power_on_entry_conditions() {
        let mut target = SimTarget::new(DeviceProfile::PIC16F193X);
        let mut last = vec![0xFF, 0x3F].repeat(32);
        Trailer { rows_used: 0, crc: 0 }.write_into(&mut last);
        flash::write_row(&mut target, 0x3FE0, &last);

        match Bootloader::power_on(target.clone()).unwrap() {
            PowerOn::Application(t) => assert_eq!(t.app_entry(), Some(0x0400)),
            PowerOn::Bootloader(..) => panic!("intact application not started"),
        }
        match Bootloader::power_on(target.clone().with_button(true)).unwrap() {
            PowerOn::Bootloader(_, reason) => assert_eq!(reason, EntryReason::Button),
            PowerOn::Application(_) => panic!("button ignored"),
        }
        match Bootloader::power_on(target.with_boot_sentinel()).unwrap() {
            PowerOn::Bootloader(_, reason) => assert_eq!(reason, EntryReason::Sentinel),
            PowerOn::Application(_) => panic!("sentinel ignored"),
        }
    }
}
