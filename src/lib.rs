//! portcullis: a TCP/TLS connection server with admission control.
//!
//! Connections are accepted on one thread and serviced by a fixed pool of
//! worker threads, each owning one connection for its whole life. A bounded
//! backlog sits in between; when it fills, the accept loop stops accepting
//! until a worker frees up.
//!
//! The server does not interpret bytes. Framing comes from a [`Protocol`]
//! and behaviour from a [`ConnectionHandler`], both injected at construction.
//!
//! ```no_run
//! use portcullis::protocols::{EchoHandler, LineProtocol};
//! use portcullis::{Server, Settings};
//! use std::sync::Arc;
//!
//! let server = Server::new(
//!     Settings::default(),
//!     Arc::new(EchoHandler::default()),
//!     Arc::new(LineProtocol::default()),
//! )?;
//! server.start()?;
//! # Ok::<(), portcullis::ServerError>(())
//! ```

pub mod config;
pub mod pool;
pub mod protocol;
pub mod protocols;
pub mod server;

pub use pool::{Job, PoolError, WorkerPool};
pub use protocol::{ConnectionHandler, Packet, Protocol, ProtocolError};
pub use server::{CloseHandle, Connection, Server, ServerError, Settings, TlsError, TlsSettings};
