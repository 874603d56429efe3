//! Shared fakes for forwarding tests.
//!
//! `LoopbackTunnel` plays the remote relay in-process: an error stream is
//! parked until its data stream arrives, then the data stream is dialled to
//! `127.0.0.1:<port>`. Dial failures are written to the error stream.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use podlink_forward::{
    BackendIdentity, DialError, EndpointResolver, ResolutionError, RetryPolicy, SessionDeps,
    StreamKind, StreamOpenError, StreamRequest, Target, TunnelConnection, TunnelConnector,
    TunnelStream,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct StaticResolver {
    backends: Mutex<HashMap<String, BackendIdentity>>,
    pub calls: AtomicU32,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route `namespace/name` to a fake instance whose port is `port`.
    pub fn insert(&self, namespace: &str, name: &str, instance: &str, port: u16) {
        self.backends.lock().unwrap().insert(
            format!("{namespace}/{name}"),
            BackendIdentity::new(namespace, instance, port),
        );
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EndpointResolver for StaticResolver {
    async fn resolve(&self, target: &Target) -> Result<BackendIdentity, ResolutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.backends
            .lock()
            .unwrap()
            .get(&format!("{}/{}", target.namespace, target.name))
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound(target.to_string()))
    }
}

pub struct LoopbackTunnel {
    opened: Mutex<Vec<StreamRequest>>,
    pending_errors: Mutex<HashMap<u32, DuplexStream>>,
    lost: CancellationToken,
}

impl LoopbackTunnel {
    fn new() -> Self {
        Self {
            opened: Mutex::new(Vec::new()),
            pending_errors: Mutex::new(HashMap::new()),
            lost: CancellationToken::new(),
        }
    }

    pub fn opened(&self) -> Vec<StreamRequest> {
        self.opened.lock().unwrap().clone()
    }

    /// Simulate the transport dying underneath the session.
    pub fn drop_connection(&self) {
        self.lost.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.lost.is_cancelled()
    }
}

#[async_trait]
impl TunnelConnection for LoopbackTunnel {
    async fn open_stream(&self, request: StreamRequest) -> Result<TunnelStream, StreamOpenError> {
        if self.lost.is_cancelled() {
            return Err(StreamOpenError::new(request.kind, "tunnel closed"));
        }
        self.opened.lock().unwrap().push(request);

        let (near, far) = tokio::io::duplex(64 * 1024);
        match request.kind {
            StreamKind::Error => {
                self.pending_errors
                    .lock()
                    .unwrap()
                    .insert(request.request_id, far);
            }
            StreamKind::Data => {
                let error = self
                    .pending_errors
                    .lock()
                    .unwrap()
                    .remove(&request.request_id);
                tokio::spawn(relay(far, error, request.port));
            }
        }

        let (reader, writer) = tokio::io::split(near);
        Ok(TunnelStream::new(reader, writer))
    }

    async fn closed(&self) {
        self.lost.cancelled().await;
    }

    async fn close(&self) {
        self.lost.cancel();
    }
}

async fn relay(mut data: DuplexStream, error: Option<DuplexStream>, port: u16) {
    match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(mut upstream) => {
            let _ = tokio::io::copy_bidirectional(&mut data, &mut upstream).await;
            if let Some(mut error) = error {
                let _ = error.shutdown().await;
            }
        }
        Err(e) => {
            if let Some(mut error) = error {
                let _ = error
                    .write_all(format!("failed to connect to port {port}: {e}").as_bytes())
                    .await;
                let _ = error.shutdown().await;
            }
        }
    }
}

#[derive(Default)]
pub struct LoopbackConnector {
    failures_remaining: AtomicU32,
    pub connects: AtomicU32,
    tunnels: Mutex<Vec<Arc<LoopbackTunnel>>>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` dials.
    pub fn failing(n: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(n),
            ..Self::default()
        }
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn tunnels(&self) -> Vec<Arc<LoopbackTunnel>> {
        self.tunnels.lock().unwrap().clone()
    }

    pub fn latest(&self) -> Arc<LoopbackTunnel> {
        self.tunnels
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no tunnel dialled yet")
    }
}

#[async_trait]
impl TunnelConnector for LoopbackConnector {
    async fn connect(
        &self,
        backend: &BackendIdentity,
    ) -> Result<Arc<dyn TunnelConnection>, DialError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DialError::new(backend.to_string(), "connection refused"));
        }

        let tunnel = Arc::new(LoopbackTunnel::new());
        self.tunnels.lock().unwrap().push(Arc::clone(&tunnel));
        Ok(tunnel)
    }
}

pub fn deps(
    resolver: &Arc<StaticResolver>,
    connector: &Arc<LoopbackConnector>,
    retry: RetryPolicy,
) -> SessionDeps {
    let resolver: Arc<dyn EndpointResolver> = resolver.clone();
    let connector: Arc<dyn TunnelConnector> = connector.clone();
    SessionDeps::new(resolver, connector).with_retry(retry)
}

pub fn fast_retry(max_attempts: Option<u32>) -> RetryPolicy {
    RetryPolicy::fixed(Duration::from_millis(10), max_attempts)
}

/// Backend that reads a whole request, then answers with `handler(request)`.
pub async fn spawn_backend<F>(handler: F) -> u16
where
    F: Fn(Vec<u8>) -> Vec<u8> + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handler = Arc::new(handler);

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                let mut request = Vec::new();
                if stream.read_to_end(&mut request).await.is_err() {
                    return;
                }
                let _ = stream.write_all(&handler(request)).await;
                let _ = stream.shutdown().await;
            });
        }
    });

    port
}

pub async fn spawn_echo_backend() -> u16 {
    spawn_backend(|request| request).await
}

/// A port with nothing listening on it.
pub async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Send `payload`, half-close, and collect everything sent back.
pub async fn round_trip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    stream.shutdown().await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    response
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
