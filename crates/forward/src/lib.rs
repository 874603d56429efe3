//! Session lifecycle and stream pump engine for podlink.
//!
//! This crate provides:
//! - [`PortMapping`] parsing and validation
//! - The [`EndpointResolver`], [`TunnelConnector`] and [`TunnelConnection`] seams
//! - The per-connection stream pump (error stream + data stream)
//! - [`Session`], the resolve/connect/listen/reconnect state machine for one mapping
//! - [`Fleet`], which runs one isolated session per mapping

pub mod error;
pub mod fleet;
pub mod mapping;
pub mod pump;
pub mod retry;
pub mod session;
pub mod stats;
pub mod tunnel;

pub use error::{DialError, Direction, ForwardError, ResolutionError, Result, StreamOpenError};
pub use fleet::{Fleet, SessionReport};
pub use mapping::{validate_all, PortMapping, DEFAULT_NAMESPACE};
pub use pump::PumpStats;
pub use retry::{Backoff, RetryPolicy};
pub use session::{Session, SessionDeps, SessionExit, SessionHandle, SessionState};
pub use stats::{SessionStats, StatsSnapshot};
pub use tunnel::{
    BackendIdentity, EndpointResolver, StreamKind, StreamReader, StreamRequest, StreamWriter,
    Target, TunnelConnection, TunnelConnector, TunnelStream,
};
