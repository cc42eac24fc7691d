//! Direct serial link.

use {
    crate::{
        error::{Error, Result},
        link::{Link, ReplyKind},
        port::Port,
        protocol::{frame::Deframer, packet::PACKET_LEN},
    },
    log::trace,
    std::io::ErrorKind,
};

/// Link over a serial [`Port`].
pub struct SerialLink<P: Port> {
    port: P,
}

impl<P: Port> SerialLink<P> {
    /// Wrap an open port.
    pub fn new(port: P) -> Self {
        Self { port }
    }

    /// The underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// The underlying port, mutably.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Release the port.
    pub fn into_port(self) -> P {
        self.port
    }

    fn silence(&self) -> Error {
        Error::Timeout(format!(
            "no reply on {} within {:?}",
            self.port.name(),
            self.port.timeout()
        ))
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(1) => Ok(buf[0]),
            Ok(_) => Err(self.silence()),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(self.silence()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn read_frame(&mut self) -> Result<Vec<u8>> {
        let mut deframer = Deframer::new(PACKET_LEN);
        loop {
            let byte = self.read_byte()?;
            if let Some(body) = deframer.push(byte) {
                return Ok(body);
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        match self.port.read_exact(&mut buf) {
            Ok(()) => Ok(buf),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::UnexpectedEof) => Err(
                Error::Timeout(format!("short reply, expected {len} bytes")),
            ),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

impl<P: Port> Link for SerialLink<P> {
    fn exchange(&mut self, wire: &[u8], reply: ReplyKind) -> Result<Vec<u8>> {
        trace!("TX {} bytes on {}", wire.len(), self.port.name());
        self.port.write_all_bytes(wire)?;

        let data = match reply {
            ReplyKind::Byte => vec![self.read_byte()?],
            ReplyKind::Frame => self.read_frame()?,
            ReplyKind::Exact(len) => self.read_exact(len)?,
        };
        trace!("RX {data:02X?}");
        Ok(data)
    }

    fn clear(&mut self) -> Result<()> {
        self.port.clear_buffers()
    }

    fn describe(&self) -> String {
        format!("{} at {} baud", self.port.name(), self.port.baud_rate())
    }
}
