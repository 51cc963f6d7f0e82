//! portcullis: an echo server on top of the worker-pool connection server.
//!
//! Features:
//! - Plain TCP or TLS listener
//! - Fixed number of workers bounding concurrent connections
//! - Bounded backlog applying backpressure to the accept loop
//! - Line or length-prefixed framing
//! - Configuration via CLI arguments or TOML file

use portcullis::config::{Config, ProtocolType};
use portcullis::protocols::{EchoHandler, LengthProtocol, LineProtocol};
use portcullis::{Protocol, Server};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        workers = config.workers,
        backlog = config.backlog,
        tls = config.tls.is_some(),
        protocol = ?config.protocol,
        idle_timeout_ms = config.idle_timeout.map(|t| t.as_millis() as u64),
        "Starting portcullis server"
    );

    let protocol: Arc<dyn Protocol> = match config.protocol {
        ProtocolType::Line => Arc::new(LineProtocol::new(config.max_frame)),
        ProtocolType::Length => Arc::new(LengthProtocol::new(config.max_frame)),
    };
    let handler = Arc::new(EchoHandler::new(config.idle_timeout));

    let server = Server::new(config.settings(), handler, protocol)?;
    server.start()?;

    Ok(())
}
