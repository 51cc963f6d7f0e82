//! Length-prefixed framing.
//!
//! Predictable framing for binary payloads of any size:
//!
//! ```text
//! Frame:  <length>\r\n<data of exactly length bytes>
//!
//! Example:
//! 5\r\nhello
//! ```

use crate::protocol::{Packet, Protocol, ProtocolError};
use crate::server::Connection;
use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, BufRead, Read};

/// Default maximum payload size.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024; // 16MB

/// Longest accepted header line, "\r\n" included.
const MAX_HEADER_LEN: u64 = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthPacket {
    data: Bytes,
}

impl LengthPacket {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }
}

impl Packet for LengthPacket {
    fn serialize(&self) -> Bytes {
        let header = format!("{}\r\n", self.data.len());
        let mut out = BytesMut::with_capacity(header.len() + self.data.len());
        out.put_slice(header.as_bytes());
        out.put_slice(&self.data);
        out.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct LengthProtocol {
    max_frame: usize,
}

impl LengthProtocol {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn read_frame(&self, reader: &mut impl BufRead) -> Result<LengthPacket, ProtocolError> {
        let mut header = Vec::with_capacity(MAX_HEADER_LEN as usize);
        let n = (&mut *reader)
            .take(MAX_HEADER_LEN)
            .read_until(b'\n', &mut header)?;

        if n == 0 {
            return Err(ProtocolError::Eof);
        }

        let length = parse_header(&header)?;
        if length > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                limit: self.max_frame,
            });
        }

        let mut data = vec![0u8; length];
        reader.read_exact(&mut data).map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => ProtocolError::Eof,
            _ => ProtocolError::Io(e),
        })?;

        Ok(LengthPacket::new(data))
    }
}

impl Default for LengthProtocol {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Protocol for LengthProtocol {
    fn read_packet(&self, conn: &mut Connection) -> Result<Box<dyn Packet>, ProtocolError> {
        Ok(Box::new(self.read_frame(conn)?))
    }
}

/// Parse a `<length>\r\n` header line.
fn parse_header(line: &[u8]) -> Result<usize, ProtocolError> {
    let digits = line
        .strip_suffix(b"\r\n")
        .ok_or_else(|| ProtocolError::Malformed("unterminated length header".to_string()))?;

    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "invalid length '{}'",
                String::from_utf8_lossy(digits)
            ))
        })
}
