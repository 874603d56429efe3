//! Capabilities consumed by the forwarding engine.
//!
//! A [`EndpointResolver`] turns a mapping target into a concrete
//! [`BackendIdentity`]; a [`TunnelConnector`] dials that backend and returns a
//! [`TunnelConnection`] which multiplexes any number of tagged logical streams.
//! The engine never looks inside either: cluster lookups, authentication and
//! wire framing all live behind these traits.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::{DialError, ResolutionError, StreamOpenError};

/// What a mapping points at before resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Target {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.name, self.port)
    }
}

/// A resolved, live backend instance and the port to reach on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendIdentity {
    pub namespace: String,
    pub instance: String,
    pub port: u16,
    /// Connector-specific facts about the instance (tunnel address, pinned
    /// certificate, ...). Opaque to the engine.
    pub attributes: BTreeMap<String, String>,
}

impl BackendIdentity {
    pub fn new(namespace: impl Into<String>, instance: impl Into<String>, port: u16) -> Self {
        Self {
            namespace: namespace.into(),
            instance: instance.into(),
            port,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

impl std::fmt::Display for BackendIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}:{}", self.namespace, self.instance, self.port)
    }
}

/// Tag carried by every logical stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Remote-to-local only; any bytes on it describe a forwarding failure.
    Error,
    /// Bidirectional payload bytes.
    Data,
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// Metadata sent when opening a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub kind: StreamKind,
    /// Resolved backend port.
    pub port: u16,
    /// Correlates the error and data stream of one local connection.
    pub request_id: u32,
}

pub type StreamReader = Box<dyn AsyncRead + Send + Unpin>;
pub type StreamWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open logical stream. Shutting down `writer` half-closes the stream:
/// the remote sees end-of-stream while `reader` keeps working.
pub struct TunnelStream {
    pub reader: StreamReader,
    pub writer: StreamWriter,
}

impl TunnelStream {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }
}

impl std::fmt::Debug for TunnelStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelStream").finish_non_exhaustive()
    }
}

/// Looks up a ready backend for a target.
///
/// Implementations document whether they block until a backend becomes ready
/// or fail fast with [`ResolutionError::NotFound`].
#[async_trait]
pub trait EndpointResolver: Send + Sync {
    async fn resolve(&self, target: &Target) -> Result<BackendIdentity, ResolutionError>;
}

/// Dials a backend. Never retries internally.
#[async_trait]
pub trait TunnelConnector: Send + Sync {
    async fn connect(
        &self,
        backend: &BackendIdentity,
    ) -> Result<Arc<dyn TunnelConnection>, DialError>;
}

/// One multiplexed transport to a backend.
///
/// `open_stream` is called concurrently by every pump of a session.
#[async_trait]
pub trait TunnelConnection: Send + Sync {
    async fn open_stream(&self, request: StreamRequest) -> Result<TunnelStream, StreamOpenError>;

    /// Resolves once the underlying transport is gone.
    async fn closed(&self) {
        std::future::pending::<()>().await;
    }

    /// Tear the transport down. Must be idempotent.
    async fn close(&self);
}
