//! Bundled protocols and handlers.
//!
//! ## Framing
//! - `line`: one packet per `\r\n` or `\n` terminated line
//! - `length`: `<length>\r\n<data>` frames for binary payloads
//!
//! ## Handlers
//! - `echo`: writes every packet back in its own framing

pub mod echo;
pub mod length;
pub mod line;

pub use echo::EchoHandler;
pub use length::{LengthPacket, LengthProtocol};
pub use line::{LinePacket, LineProtocol};
