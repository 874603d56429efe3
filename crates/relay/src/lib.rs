//! Relay end of podlink tunnels: accepts QUIC tunnels and dials the streams'
//! target ports on the local host.

pub mod error;
pub mod pairing;
pub mod server;

pub use error::{Error, Result};
pub use server::{serve, RelayConfig, DEFAULT_PAIR_TIMEOUT};
