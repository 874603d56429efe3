//! QUIC tunnel transport for podlink.
//!
//! - [`QuicConnector`] dials relays on behalf of sessions, one shared client
//!   endpoint for the whole process.
//! - [`QuicTunnel`] maps every logical stream onto a QUIC bidirectional
//!   stream prefixed with a [`protocol::StreamHeader`].
//! - [`quic_config`] holds certificate generation and the TLS/transport
//!   settings both ends agree on.

pub mod error;
pub mod quic;
pub mod quic_config;

pub use error::{Result, TransportError};
pub use quic::{QuicConnector, QuicTunnel, ATTR_TUNNEL_ADDRESS, ATTR_TUNNEL_FINGERPRINT};
