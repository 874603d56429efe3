//! Relay side of a tunnel.
//!
//! Every client-opened bidirectional stream starts with a [`StreamHeader`].
//! Error streams are parked until the data stream with the same request id
//! arrives, or dropped once `pair_timeout` passes without one; the data stream is then dialled to `target_host:port` and copied
//! both ways. A dial failure is reported as text on the error stream. On
//! success the error stream is finished empty once copying is over.

use std::sync::Arc;
use std::time::Duration;

use protocol::{StreamHeader, StreamType};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::Result;
use crate::pairing::Pairing;

/// How long a data stream waits for its error stream, and how long an error
/// stream stays parked waiting for its data stream.
pub const DEFAULT_PAIR_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Host every data stream is dialled on.
    pub target_host: String,
    pub pair_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            target_host: "127.0.0.1".to_string(),
            pair_timeout: DEFAULT_PAIR_TIMEOUT,
        }
    }
}

/// Accept tunnels until the endpoint is closed.
pub async fn serve(endpoint: quinn::Endpoint, config: Arc<RelayConfig>) {
    while let Some(incoming) = endpoint.accept().await {
        let config = Arc::clone(&config);
        let remote = incoming.remote_address();
        tokio::spawn(
            async move {
                if let Err(e) = handle_connection(incoming, config).await {
                    warn!(%e, "tunnel ended with error");
                }
            }
            .instrument(info_span!("tunnel", %remote)),
        );
    }
    info!("endpoint closed, no longer accepting tunnels");
}

async fn handle_connection(incoming: quinn::Incoming, config: Arc<RelayConfig>) -> Result<()> {
    let connection = incoming.await?;
    info!("tunnel established");

    let pairing = Pairing::new(config.pair_timeout);
    loop {
        match connection.accept_bi().await {
            Ok((send, recv)) => {
                let pairing = Arc::clone(&pairing);
                let config = Arc::clone(&config);
                tokio::spawn(handle_stream(send, recv, pairing, config).in_current_span());
            }
            Err(quinn::ConnectionError::ApplicationClosed(_))
            | Err(quinn::ConnectionError::LocallyClosed) => {
                info!("tunnel closed");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn handle_stream(
    send: quinn::SendStream,
    mut recv: quinn::RecvStream,
    pairing: Arc<Pairing<quinn::SendStream>>,
    config: Arc<RelayConfig>,
) {
    let header = match protocol::read_header(&mut recv).await {
        Ok(header) => header,
        Err(e) => {
            warn!(%e, "rejecting stream with bad header");
            return;
        }
    };

    match header.stream_type {
        StreamType::Error => {
            debug!(request_id = header.request_id, "error stream parked");
            pairing.offer(header.request_id, send);
        }
        StreamType::Data => {
            let span = info_span!("forward", port = header.port, request_id = header.request_id);
            forward(header, send, recv, &pairing, &config)
                .instrument(span)
                .await;
        }
    }
}

async fn forward(
    header: StreamHeader,
    mut data_send: quinn::SendStream,
    mut data_recv: quinn::RecvStream,
    pairing: &Pairing<quinn::SendStream>,
    config: &RelayConfig,
) {
    let error_stream = pairing.take(header.request_id, config.pair_timeout).await;
    if error_stream.is_none() {
        warn!(timeout = ?config.pair_timeout, "no error stream arrived, forwarding without one");
    }

    let tcp = match TcpStream::connect((config.target_host.as_str(), header.port)).await {
        Ok(tcp) => tcp,
        Err(e) => {
            let message = format!(
                "failed to connect to {}:{}: {e}",
                config.target_host, header.port
            );
            warn!(%e, "dial failed");
            if let Some(mut error_send) = error_stream {
                if let Err(e) = error_send.write_all(message.as_bytes()).await {
                    debug!(%e, "could not report dial failure");
                }
                let _ = error_send.finish();
            }
            let _ = data_send.finish();
            return;
        }
    };
    if let Err(e) = tcp.set_nodelay(true) {
        debug!(%e, "failed to set TCP_NODELAY");
    }
    debug!("connected, starting bidirectional copy");

    // join! keeps half-close semantics: each direction ends on its own.
    let (mut tcp_read, mut tcp_write) = tcp.into_split();
    let client_to_target = async {
        let copied = tokio::io::copy(&mut data_recv, &mut tcp_write).await;
        let _ = tcp_write.shutdown().await;
        copied
    };
    let target_to_client = async {
        let copied = tokio::io::copy(&mut tcp_read, &mut data_send).await;
        let _ = data_send.finish();
        copied
    };
    let (sent, received) = tokio::join!(client_to_target, target_to_client);

    match (&sent, &received) {
        (Ok(up), Ok(down)) => debug!(bytes_up = up, bytes_down = down, "forward finished"),
        _ => {
            if let Err(e) = sent {
                debug!(%e, "client->target copy ended");
            }
            if let Err(e) = received {
                debug!(%e, "target->client copy ended");
            }
        }
    }

    if let Some(mut error_send) = error_stream {
        let _ = error_send.finish();
    }
}
