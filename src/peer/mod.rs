//! Peer wire protocol and per-peer download sessions.
pub mod handshake;
pub mod message;
pub mod session;

pub use handshake::Handshake;
pub use message::Message;
pub use session::Session;
