//! Per-connection stream pump.
//!
//! For every accepted local connection the pump opens an error stream and
//! then a data stream on the session's tunnel, copies bytes in both
//! directions, and reports a single outcome:
//!
//! 1. Open the error stream and half-close it (we never write to it).
//! 2. Drain the error stream on a separate task; any bytes on it are a
//!    remote failure report.
//! 3. Open the data stream.
//! 4. Copy local->remote and remote->local concurrently. Exhausting the local
//!    side half-closes the data stream, whatever the other direction is doing.
//! 5. Stop at the first of: remote->local finished, local->remote failed, or
//!    the session cycle was cancelled.
//! 6. Close the local connection and the data stream, then collect the
//!    error-stream result. A remote failure report wins over copy errors.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Direction, ForwardError, Result};
use crate::tunnel::{StreamKind, StreamReader, StreamRequest, TunnelConnection, TunnelStream};

/// How long to wait for the remote to close the error stream once the data
/// stream is gone.
const ERROR_STREAM_GRACE: Duration = Duration::from_secs(5);

/// Byte counts of a finished pump.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Local -> remote. Zero if that direction had not finished.
    pub bytes_sent: u64,
    /// Remote -> local.
    pub bytes_received: u64,
}

/// Aborts the wrapped task when dropped, so early returns never leak it.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drive one local connection over `tunnel`.
///
/// `local` is closed exactly once, when this function returns, on every path.
pub async fn run<L>(
    local: L,
    tunnel: &dyn TunnelConnection,
    port: u16,
    request_id: u32,
    cancel: &CancellationToken,
) -> Result<PumpStats>
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
{
    let TunnelStream {
        reader: error_reader,
        writer: mut error_writer,
    } = tunnel
        .open_stream(StreamRequest {
            kind: StreamKind::Error,
            port,
            request_id,
        })
        .await?;

    // Read-only from this side.
    if let Err(e) = error_writer.shutdown().await {
        debug!(request_id, %e, "failed to half-close error stream");
    }
    drop(error_writer);

    let error_task = AbortOnDrop(tokio::spawn(read_error_stream(error_reader)));

    let data = tunnel
        .open_stream(StreamRequest {
            kind: StreamKind::Data,
            port,
            request_id,
        })
        .await?;

    let (copy_result, stats) = stream_bytes(local, data, request_id, cancel).await;

    let remote_result = await_error_stream(error_task, request_id, cancel).await;

    match (remote_result, copy_result) {
        (Err(protocol @ ForwardError::Protocol { .. }), copy) => {
            if let Err(e) = copy {
                debug!(request_id, %e, "copy also failed");
            }
            Err(protocol)
        }
        (_, Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Ok(()), Ok(())) => Ok(stats),
    }
}

/// Streaming and draining. Consumes both endpoints so they are closed when
/// this returns.
async fn stream_bytes<L>(
    local: L,
    data: TunnelStream,
    request_id: u32,
    cancel: &CancellationToken,
) -> (Result<()>, PumpStats)
where
    L: AsyncRead + AsyncWrite + Send + Unpin,
{
    let TunnelStream {
        reader: mut data_reader,
        writer: mut data_writer,
    } = data;
    let (mut local_reader, mut local_writer) = tokio::io::split(local);

    let local_to_remote = async {
        let copied = tokio::io::copy(&mut local_reader, &mut data_writer).await;
        // No more data from this side; runs once on success and on failure.
        if let Err(e) = data_writer.shutdown().await {
            debug!(request_id, %e, "failed to half-close data stream");
        }
        copied
    };

    let remote_to_local = async {
        let copied = tokio::io::copy(&mut data_reader, &mut local_writer).await?;
        if let Err(e) = local_writer.shutdown().await {
            debug!(request_id, %e, "failed to half-close local connection");
        }
        Ok::<u64, std::io::Error>(copied)
    };

    tokio::pin!(local_to_remote, remote_to_local);

    let mut stats = PumpStats::default();
    let mut local_done = false;

    let result = loop {
        tokio::select! {
            copied = &mut remote_to_local => {
                break match copied {
                    Ok(n) => {
                        stats.bytes_received = n;
                        debug!(request_id, bytes = n, "remote->local finished");
                        Ok(())
                    }
                    Err(e) => Err(ForwardError::io(Direction::RemoteToLocal, e)),
                };
            }
            copied = &mut local_to_remote, if !local_done => {
                local_done = true;
                match copied {
                    Ok(n) => {
                        stats.bytes_sent = n;
                        debug!(
                            request_id,
                            bytes = n,
                            "local->remote finished, data stream half-closed"
                        );
                    }
                    Err(e) => break Err(ForwardError::io(Direction::LocalToRemote, e)),
                }
            }
            () = cancel.cancelled() => break Err(ForwardError::Cancelled),
        }
    };

    (result, stats)
}

async fn read_error_stream(mut reader: StreamReader) -> Result<()> {
    let mut message = Vec::new();
    reader
        .read_to_end(&mut message)
        .await
        .map_err(|e| ForwardError::io(Direction::ErrorStream, e))?;

    if message.is_empty() {
        Ok(())
    } else {
        Err(ForwardError::Protocol {
            remote_message: String::from_utf8_lossy(&message).trim().to_string(),
        })
    }
}

async fn await_error_stream(
    mut task: AbortOnDrop<Result<()>>,
    request_id: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        joined = &mut task.0 => match joined {
            Ok(result) => result,
            Err(e) => Err(ForwardError::io(Direction::ErrorStream, std::io::Error::other(e))),
        },
        () = cancel.cancelled() => Ok(()),
        () = tokio::time::sleep(ERROR_STREAM_GRACE) => {
            warn!(
                request_id,
                grace = ?ERROR_STREAM_GRACE,
                "error stream still open after grace period, giving up on it"
            );
            Ok(())
        }
    }
}
