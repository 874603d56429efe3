//! QUIC implementation of the forwarding engine's tunnel seams.
//!
//! One tunnel is one QUIC connection to a relay. Each logical stream is a
//! client-opened bidirectional QUIC stream whose first bytes are a framed
//! [`StreamHeader`]; the relay reads that header and treats the rest of the
//! stream as payload. Half-close maps onto QUIC `finish`.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use podlink_forward::{
    BackendIdentity, DialError, StreamKind, StreamOpenError, StreamRequest, TunnelConnection,
    TunnelConnector, TunnelStream,
};
use protocol::{StreamHeader, StreamType};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::quic_config::{self, SERVER_NAME};

/// Backend attribute holding the relay's `host:port`.
pub const ATTR_TUNNEL_ADDRESS: &str = "tunnel-address";
/// Backend attribute holding the relay certificate's hex SHA-256.
pub const ATTR_TUNNEL_FINGERPRINT: &str = "tunnel-fingerprint";

/// Dials relays over QUIC. Cheap to share; all sessions use one endpoint.
pub struct QuicConnector {
    endpoint: quinn::Endpoint,
}

impl QuicConnector {
    /// Create a client endpoint bound to `bind` (usually `0.0.0.0:0`).
    pub fn new(bind: SocketAddr) -> Result<Self> {
        let endpoint = quinn::Endpoint::client(bind)?;
        Ok(Self { endpoint })
    }

    pub fn endpoint(&self) -> &quinn::Endpoint {
        &self.endpoint
    }

    /// Close every connection and wait for the peers to acknowledge.
    pub async fn shutdown(&self) {
        self.endpoint.close(0u32.into(), b"shutdown");
        self.endpoint.wait_idle().await;
    }

    async fn relay_address(
        &self,
        backend: &BackendIdentity,
    ) -> std::result::Result<SocketAddr, DialError> {
        let dial_error = |message: String| DialError::new(backend.to_string(), message);

        let raw = backend
            .attribute(ATTR_TUNNEL_ADDRESS)
            .ok_or_else(|| dial_error(format!("missing {ATTR_TUNNEL_ADDRESS} attribute")))?;

        if let Ok(addr) = raw.parse::<SocketAddr>() {
            return Ok(addr);
        }
        tokio::net::lookup_host(raw)
            .await
            .map_err(|e| dial_error(format!("cannot resolve {raw}: {e}")))?
            .next()
            .ok_or_else(|| dial_error(format!("{raw} resolved to no addresses")))
    }
}

#[async_trait]
impl TunnelConnector for QuicConnector {
    async fn connect(
        &self,
        backend: &BackendIdentity,
    ) -> std::result::Result<Arc<dyn TunnelConnection>, DialError> {
        let dial_error = |message: String| DialError::new(backend.to_string(), message);

        let addr = self.relay_address(backend).await?;
        let fingerprint = match backend.attribute(ATTR_TUNNEL_FINGERPRINT) {
            Some(text) => Some(
                quic_config::parse_fingerprint(text).map_err(|e| dial_error(e.to_string()))?,
            ),
            None => {
                warn!(%backend, "no relay fingerprint known, certificate will not be verified");
                None
            }
        };
        let config = quic_config::build_client_config(fingerprint)
            .map_err(|e| dial_error(e.to_string()))?;

        debug!(%backend, %addr, "dialing relay");
        let connection = self
            .endpoint
            .connect_with(config, addr, SERVER_NAME)
            .map_err(|e| dial_error(e.to_string()))?
            .await
            .map_err(|e| dial_error(e.to_string()))?;

        info!(%backend, %addr, "tunnel connected");
        Ok(Arc::new(QuicTunnel::new(connection)))
    }
}

/// A live QUIC connection to one relay.
pub struct QuicTunnel {
    connection: quinn::Connection,
}

impl QuicTunnel {
    pub fn new(connection: quinn::Connection) -> Self {
        Self { connection }
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }
}

fn stream_type(kind: StreamKind) -> StreamType {
    match kind {
        StreamKind::Error => StreamType::Error,
        StreamKind::Data => StreamType::Data,
    }
}

#[async_trait]
impl TunnelConnection for QuicTunnel {
    async fn open_stream(
        &self,
        request: StreamRequest,
    ) -> std::result::Result<TunnelStream, StreamOpenError> {
        let (mut send, recv) = self
            .connection
            .open_bi()
            .await
            .map_err(|e| StreamOpenError::new(request.kind, e.to_string()))?;

        let header = StreamHeader::new(stream_type(request.kind), request.port, request.request_id);
        protocol::write_header(&mut send, &header)
            .await
            .map_err(|e| StreamOpenError::new(request.kind, e.to_string()))?;

        Ok(TunnelStream::new(recv, send))
    }

    async fn closed(&self) {
        let reason = self.connection.closed().await;
        debug!(remote = %self.connection.remote_address(), %reason, "tunnel closed");
    }

    async fn close(&self) {
        self.connection.close(0u32.into(), b"session closed");
    }
}
