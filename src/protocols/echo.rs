//! Echo connection handler.
//!
//! Writes every packet back to its sender in the protocol's own framing.
//! Pairs with any [`Protocol`](crate::protocol::Protocol); useful for
//! throughput testing and for checking the server without business logic.

use crate::protocol::{ConnectionHandler, Packet};
use crate::server::Connection;
use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Debug, Clone, Default)]
pub struct EchoHandler {
    /// Idle limit per connection; `None` waits forever.
    idle_timeout: Option<Duration>,
}

impl EchoHandler {
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self { idle_timeout }
    }

    fn arm(&self, conn: &Connection) -> bool {
        let deadline = self.idle_timeout.map(|t| Instant::now() + t);
        match conn.set_deadline(deadline) {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %conn.remote_addr_string(), error = %e, "Failed to set deadline");
                false
            }
        }
    }
}

impl ConnectionHandler for EchoHandler {
    fn on_accept(&self, conn: &mut Connection) -> bool {
        debug!(peer = %conn.remote_addr_string(), "Client connected");
        self.arm(conn)
    }

    fn on_message(&self, conn: &mut Connection, packet: Box<dyn Packet>) -> bool {
        let data = packet.serialize();
        trace!(peer = %conn.remote_addr_string(), len = data.len(), "Echo");

        if let Err(e) = conn.write_all(&data) {
            debug!(peer = %conn.remote_addr_string(), error = %e, "Write failed");
            return false;
        }
        self.arm(conn)
    }

    fn on_timeout(&self, conn: &mut Connection) -> bool {
        debug!(peer = %conn.remote_addr_string(), "Idle timeout");
        false
    }

    fn on_close(&self, conn: &Connection) {
        debug!(peer = %conn.remote_addr_string(), "Client disconnected");
    }
}
