//! Wire format shared by the podlink CLI and relay.
//!
//! Every tunnel stream starts with one length-prefixed [`StreamHeader`];
//! everything after it is raw payload.

pub mod codec;
pub mod error;

pub use codec::{decode, encode, read_header, write_header, MAX_HEADER_FRAME};
pub use error::{Error, Result};

/// Current wire protocol version. Bump when making breaking changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// ALPN token negotiated on every tunnel connection.
pub const ALPN: &[u8] = b"podlink";

/// Purpose of a tunnel stream.
#[derive(
    rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash,
)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub enum StreamType {
    /// Relay -> client failure report; empty on success.
    Error,
    /// Payload bytes in both directions.
    Data,
}

/// First frame on every tunnel stream.
#[derive(rkyv::Archive, rkyv::Serialize, rkyv::Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[rkyv(compare(PartialEq), derive(Debug))]
pub struct StreamHeader {
    pub version: u32,
    pub stream_type: StreamType,
    /// Port to dial on the relay side.
    pub port: u16,
    /// Pairs the error and data stream of one forwarded connection.
    pub request_id: u32,
}

impl StreamHeader {
    pub fn new(stream_type: StreamType, port: u16, request_id: u32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            stream_type,
            port,
            request_id,
        }
    }
}
