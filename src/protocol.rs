//! Contracts between the server core and the code it serves.
//!
//! The core never interprets bytes itself. A [`Protocol`] frames one
//! [`Packet`] at a time out of a connection's stream, and a
//! [`ConnectionHandler`] decides what happens on each connection event.

use crate::server::Connection;
use bytes::Bytes;
use std::io;

/// One framed message.
pub trait Packet: Send {
    /// Wire representation of the packet.
    fn serialize(&self) -> Bytes;
}

/// Framing strategy. Called by the read loop whenever at least one byte
/// is available.
pub trait Protocol: Send + Sync + 'static {
    /// Parse exactly one packet from the connection.
    ///
    /// Any error, including [`ProtocolError::Eof`], ends the connection.
    fn read_packet(&self, conn: &mut Connection) -> Result<Box<dyn Packet>, ProtocolError>;
}

/// Reacts to the lifecycle events of every connection.
///
/// Returning `false` from `on_accept`, `on_message` or `on_timeout` closes
/// the connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called once before the first read. Usually arms deadlines.
    fn on_accept(&self, conn: &mut Connection) -> bool;

    /// Called for each packet the protocol produced.
    fn on_message(&self, conn: &mut Connection, packet: Box<dyn Packet>) -> bool;

    /// Called when a read deadline elapses with no data.
    ///
    /// Returning `true` keeps the connection; the handler must re-arm the
    /// deadline or it fires again immediately.
    fn on_timeout(&self, conn: &mut Connection) -> bool;

    /// Called exactly once when the connection closes.
    fn on_close(&self, conn: &Connection);
}

/// Framing failures.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("end of stream")]
    Eof,

    #[error("frame of {size} bytes exceeds limit of {limit}")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
