//! Host-side transfer orchestrator.
//!
//! The [`Flasher`] keeps the host copy of the session sequence number,
//! builds each packet once and pushes it through a [`Link`], applying the
//! ACK/NAK retry policy.
//!
//! ## Example
//!
//! ```rust,no_run
//! use pblflash::{
//!     Flasher, Layout, NativePort, SerialConfig, SerialLink,
//!     flasher::{FlashOptions, check_device, DEFAULT_PRODUCT_ID},
//!     image::{Image, Memory, Source},
//! };
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let layout = Layout::addressed(0x1F)?;
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", layout.baud_rate()))?;
//!     let mut flasher = Flasher::new(SerialLink::new(port), layout);
//!
//!     let response = flasher.query()?;
//!     check_device(&response, DEFAULT_PRODUCT_ID)?;
//!
//!     let source = Source::from_file("app.hex", &response, Memory::Program)?;
//!     let image = Image::program(&source, &response)?;
//!     flasher.flash(&image, FlashOptions::default().with_check(true), |row, total| {
//!         println!("row {row}/{total}");
//!     })?;
//!     Ok(())
//! }
//! ```

use {
    crate::{
        error::{Error, Result},
        image::Image,
        link::{Link, ReplyKind},
        protocol::{
            Layout,
            packet::{Command, QUERY_PARAM, Response, control},
        },
    },
    log::{debug, info, warn},
    std::{sync::Arc, thread, time::Duration},
};

/// Retries per packet after the first transmission.
pub const MAX_RETRIES: usize = 5;

/// Pause before a retry.
pub const RETRY_DELAY: Duration = Duration::from_millis(100);

/// Product identifier expected unless overridden.
pub const DEFAULT_PRODUCT_ID: u16 = 0x2B36;

/// Newest boot program version understood.
pub const BOOT_VERSION_SUPPORTED: u8 = 0;

/// Protocol number understood.
pub const PROTOCOL_SUPPORTED: u8 = 0;

/// Retry policy.
#[derive(Debug, Clone, Copy)]
pub struct FlasherConfig {
    /// Retries per packet after the first transmission.
    pub max_retries: usize,
    /// Pause before each retry.
    pub retry_delay: Duration,
}

impl Default for FlasherConfig {
    fn default() -> Self {
        Self {
            max_retries: MAX_RETRIES,
            retry_delay: RETRY_DELAY,
        }
    }
}

/// What to do once the image is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Finish {
    /// Leave the device in the bootloader.
    #[default]
    Stay,
    /// Start the application.
    Execute,
    /// Restart the device.
    Reset,
}

/// Steps after programming.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlashOptions {
    /// Run the device integrity check. Implied by [`Finish::Execute`].
    pub check: bool,
    /// Final action.
    pub finish: Finish,
}

impl FlashOptions {
    /// Enable the integrity check.
    #[must_use]
    pub fn with_check(mut self, check: bool) -> Self {
        self.check = check;
        self
    }

    /// Set the final action.
    #[must_use]
    pub fn with_finish(mut self, finish: Finish) -> Self {
        self.finish = finish;
        self
    }
}

/// Verify the queried device matches what this host can program.
pub fn check_device(response: &Response, product_id: u16) -> Result<()> {
    if response.product_id != product_id {
        return Err(Error::Config(format!(
            "wrong product ID: specified {product_id:#06x}, device reports {:#06x}",
            response.product_id
        )));
    }
    if response.boot_version > BOOT_VERSION_SUPPORTED {
        return Err(Error::Config(format!(
            "boot program version {} is not supported",
            response.boot_version
        )));
    }
    if response.protocol != PROTOCOL_SUPPORTED {
        return Err(Error::Config(format!(
            "protocol version {} is not supported",
            response.protocol
        )));
    }
    Ok(())
}

fn is_retryable(e: &Error) -> bool {
    matches!(
        e,
        Error::Timeout(_)
            | Error::Io(_)
            | Error::CrcMismatch { .. }
            | Error::Protocol(_)
            | Error::Relay(_)
    )
}

type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// Transfer engine for one bootloader session.
pub struct Flasher<L: Link> {
    link: L,
    layout: Layout,
    config: FlasherConfig,
    seq: u16,
    interrupted: InterruptChecker,
}

impl<L: Link> Flasher<L> {
    /// Create a flasher over `link` speaking `layout`.
    pub fn new(link: L, layout: Layout) -> Self {
        Self {
            link,
            layout,
            config: FlasherConfig::default(),
            seq: 0,
            interrupted: Arc::new(crate::interrupt_requested),
        }
    }

    /// Override the retry policy.
    #[must_use]
    pub fn with_config(mut self, config: FlasherConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the process-wide interrupt checker for this flasher.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupted = Arc::new(checker);
        self
    }

    /// The link.
    pub fn link(&self) -> &L {
        &self.link
    }

    /// The link, mutably.
    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Release the link.
    pub fn into_link(self) -> L {
        self.link
    }

    /// Packet layout in use.
    pub fn layout(&self) -> Layout {
        self.layout
    }

    /// Host sequence number for the next packet.
    pub fn seq(&self) -> u16 {
        self.seq
    }

    fn retry_pause(&self, attempt: usize, attempts: usize) {
        if attempt < attempts {
            thread::sleep(self.config.retry_delay);
        }
    }

    /// Query the bootloader and resynchronize the session.
    ///
    /// Resets the sequence number and clears the device write latch.
    pub fn query(&mut self) -> Result<Response> {
        info!("Querying bootloader via {}", self.link.describe());
        let wire = self
            .layout
            .encode(Command::Query, QUERY_PARAM, 0, &[]);
        let kind = if self.layout.is_framed() {
            ReplyKind::Frame
        } else {
            ReplyKind::Exact(self.layout.packet_len())
        };

        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            self.link.clear()?;
            let nak = [self.layout.nak()];
            let result = self
                .link
                .exchange(&wire, kind)
                .and_then(|reply| {
                    if reply == nak {
                        Err(Error::Rejected {
                            command: Command::Query,
                        })
                    } else {
                        self.layout.decode_response(&reply)
                    }
                });
            match result {
                Ok(response) => {
                    self.seq = 0;
                    debug!(
                        "Loader {:#06x} words, application {:#06x} words",
                        response.loader_words, response.app_words
                    );
                    return Ok(response);
                },
                Err(e) if is_retryable(&e) => {
                    warn!("Query failed (attempt {attempt}/{attempts}): {e}");
                    self.retry_pause(attempt, attempts);
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::RetriesExhausted {
            command: Command::Query,
            attempts,
        })
    }

    /// Send one command and wait for its acknowledgement.
    ///
    /// NAKs, timeouts and malformed replies are retried with the same
    /// sequence number. The sequence advances only on ACK.
    pub fn send_command(&mut self, command: Command, param: u16, payload: &[u8]) -> Result<()> {
        let wire = self
            .layout
            .encode(command, param, self.seq, payload);
        debug!("{command:?} param={param:#06x} seq={}", self.seq);

        let attempts = self.config.max_retries + 1;
        for attempt in 1..=attempts {
            match self
                .link
                .exchange(&wire, ReplyKind::Byte)
            {
                Ok(reply) => match reply.first().copied() {
                    Some(byte) if byte == self.layout.ack() => {
                        self.seq = self.seq.wrapping_add(1);
                        return Ok(());
                    },
                    Some(control::STX) if command == Command::CheckApp => {
                        return Err(Error::IntegrityCheckFailed);
                    },
                    Some(byte) if byte == self.layout.nak() => {
                        if matches!(command, Command::Query | Command::WriteEnable) {
                            return Err(Error::Rejected { command });
                        }
                        warn!("{command:?} NAK (attempt {attempt}/{attempts})");
                    },
                    other => {
                        warn!("{command:?} unexpected reply {other:02X?} (attempt {attempt}/{attempts})");
                    },
                },
                Err(e) if is_retryable(&e) => {
                    warn!("{command:?} failed (attempt {attempt}/{attempts}): {e}");
                },
                Err(e) => return Err(e),
            }
            self.retry_pause(attempt, attempts);
        }

        Err(Error::RetriesExhausted { command, attempts })
    }

    /// Enable writes and send every row of `image` in order.
    ///
    /// `progress` receives (rows done, total rows). The interrupt checker is
    /// consulted before each row.
    pub fn program<F>(&mut self, image: &Image, mut progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.send_command(Command::WriteEnable, 0, &[])?;

        let command = image
            .memory()
            .command();
        let total = image.rows().len();
        info!("Writing {total} rows");
        for (index, row) in image
            .rows()
            .iter()
            .enumerate()
        {
            if (self.interrupted)() {
                warn!("Interrupted after {index} of {total} rows");
                return Err(Error::Interrupted);
            }
            self.send_command(command, row.param, &row.data)?;
            progress(index + 1, total);
        }
        Ok(())
    }

    /// Ask the device to verify the application image.
    pub fn check_app(&mut self) -> Result<()> {
        self.send_command(Command::CheckApp, 0, &[])
    }

    /// Start the application.
    pub fn execute(&mut self) -> Result<()> {
        self.send_command(Command::Execute, 0, &[])
    }

    /// Restart the device.
    pub fn reset(&mut self) -> Result<()> {
        self.send_command(Command::Reset, 0, &[])
    }

    /// Verify the resident image and start it, without loading anything.
    pub fn run_application(&mut self) -> Result<()> {
        self.check_app()?;
        self.execute()
    }

    /// Program `image`, then check and finish as requested.
    ///
    /// Call [`Flasher::query`] first so the session is synchronized.
    pub fn flash<F>(&mut self, image: &Image, options: FlashOptions, progress: F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        self.program(image, progress)?;

        if options.check || options.finish == Finish::Execute {
            self.check_app()?;
            info!("Application check passed");
        }
        match options.finish {
            Finish::Execute => self.execute()?,
            Finish::Reset => self.reset()?,
            Finish::Stay => {},
        }
        Ok(())
    }
}
