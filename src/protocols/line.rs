//! Line-based framing.
//!
//! ```text
//! Request:  Hello World !\r\n
//! Packet:   "Hello World !"
//! ```
//!
//! Both `\r\n` and bare `\n` terminate a line. Bytes left over when the
//! peer closes mid-line form a final packet.

use crate::protocol::{Packet, Protocol, ProtocolError};
use crate::server::Connection;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{BufRead, Read};

/// Default maximum line length, terminator excluded.
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;

/// A single line without its terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinePacket {
    line: Bytes,
}

impl LinePacket {
    pub fn new(line: impl Into<Bytes>) -> Self {
        Self { line: line.into() }
    }

    /// Line contents, terminator stripped.
    pub fn payload(&self) -> &[u8] {
        &self.line
    }
}

impl Packet for LinePacket {
    /// Re-framed with `\r\n`.
    fn serialize(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.line.len() + 2);
        out.put_slice(&self.line);
        out.put_slice(b"\r\n");
        out.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct LineProtocol {
    max_line: usize,
}

impl LineProtocol {
    pub fn new(max_line: usize) -> Self {
        Self { max_line }
    }

    /// Read one line from any buffered reader.
    pub fn read_line(&self, reader: &mut impl BufRead) -> Result<LinePacket, ProtocolError> {
        let mut line = Vec::new();
        // Room for the longest allowed line plus "\r\n".
        let limit = (self.max_line as u64).saturating_add(2);
        let n = reader.take(limit).read_until(b'\n', &mut line)?;

        if n == 0 {
            return Err(ProtocolError::Eof);
        }

        let terminated = line.last() == Some(&b'\n');
        if terminated {
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
        }

        if line.len() > self.max_line {
            return Err(ProtocolError::FrameTooLarge {
                size: line.len(),
                limit: self.max_line,
            });
        }

        Ok(LinePacket::new(line))
    }
}

impl Default for LineProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINE)
    }
}

impl Protocol for LineProtocol {
    fn read_packet(&self, conn: &mut Connection) -> Result<Box<dyn Packet>, ProtocolError> {
        Ok(Box::new(self.read_line(conn)?))
    }
}
