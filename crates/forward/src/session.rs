//! One mapping's forwarding lifecycle.
//!
//! ```text
//! ResolvingEndpoint -> Connecting -> Listening --(fatal)--> Reconnecting --> ResolvingEndpoint
//!                                        |                       |
//!                                   (shutdown)             (policy spent)
//!                                        v                       v
//!                                   Terminated               Exhausted
//! ```
//!
//! Every cycle re-resolves the backend and dials a fresh tunnel. The local
//! listener is bound once and reused across cycles unless the failure came
//! from the listener itself. Pumps are spawned per accepted connection and
//! tied to the cycle's cancellation token, so tearing a cycle down stops all
//! of its in-flight connections without touching other sessions.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::error::ForwardError;
use crate::mapping::PortMapping;
use crate::pump;
use crate::retry::RetryPolicy;
use crate::stats::SessionStats;
use crate::tunnel::{BackendIdentity, EndpointResolver, TunnelConnection, TunnelConnector};

/// Observable state of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    ResolvingEndpoint,
    Connecting,
    /// Accepting local connections on this address.
    Listening(SocketAddr),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    /// A bounded retry policy ran out; the session has stopped.
    Exhausted,
    Terminated,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolvingEndpoint => write!(f, "resolving"),
            Self::Connecting => write!(f, "connecting"),
            Self::Listening(addr) => write!(f, "listening on {addr}"),
            Self::Reconnecting { attempt, delay } => {
                write!(f, "reconnecting (attempt {attempt}, in {delay:?})")
            }
            Self::Exhausted => write!(f, "exhausted"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionExit {
    /// Shutdown was requested.
    Terminated,
    /// The retry policy allowed no further attempts.
    Exhausted { retries: u32, last_error: String },
}

/// Where in a cycle a fatal error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Connect,
    Bind,
    Accept,
    Tunnel,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resolve => write!(f, "resolve"),
            Self::Connect => write!(f, "connect"),
            Self::Bind => write!(f, "bind"),
            Self::Accept => write!(f, "accept"),
            Self::Tunnel => write!(f, "tunnel"),
        }
    }
}

struct CycleError {
    phase: Phase,
    error: ForwardError,
}

impl CycleError {
    fn new(phase: Phase, error: impl Into<ForwardError>) -> Self {
        Self {
            phase,
            error: error.into(),
        }
    }
}

/// Collaborators and policy shared by every session of a fleet.
#[derive(Clone)]
pub struct SessionDeps {
    pub resolver: Arc<dyn EndpointResolver>,
    pub connector: Arc<dyn TunnelConnector>,
    pub retry: RetryPolicy,
    /// Local address listeners bind to.
    pub bind_address: IpAddr,
}

impl SessionDeps {
    pub fn new(resolver: Arc<dyn EndpointResolver>, connector: Arc<dyn TunnelConnector>) -> Self {
        Self {
            resolver,
            connector,
            retry: RetryPolicy::default(),
            bind_address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_bind_address(mut self, bind_address: IpAddr) -> Self {
        self.bind_address = bind_address;
        self
    }
}

/// Read-only view of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    mapping: PortMapping,
    state: watch::Receiver<SessionState>,
    stats: Arc<SessionStats>,
}

impl SessionHandle {
    pub fn mapping(&self) -> &PortMapping {
        &self.mapping
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn stats(&self) -> &Arc<SessionStats> {
        &self.stats
    }

    /// Wait until the state satisfies `predicate`. Returns `None` if the
    /// session is gone before that happens.
    pub async fn wait_for(
        &mut self,
        predicate: impl FnMut(&SessionState) -> bool,
    ) -> Option<SessionState> {
        self.state.wait_for(predicate).await.ok().map(|state| state.clone())
    }

    /// Wait until the session is listening and return the bound address.
    pub async fn listening(&mut self) -> Option<SocketAddr> {
        match self
            .wait_for(|s| matches!(s, SessionState::Listening(_)))
            .await?
        {
            SessionState::Listening(addr) => Some(addr),
            _ => None,
        }
    }
}

pub struct Session {
    mapping: PortMapping,
    deps: SessionDeps,
    state_tx: watch::Sender<SessionState>,
    stats: Arc<SessionStats>,
    listener: Option<TcpListener>,
}

impl Session {
    pub fn new(mapping: PortMapping, deps: SessionDeps) -> (Self, SessionHandle) {
        let (state_tx, state_rx) = watch::channel(SessionState::ResolvingEndpoint);
        let stats = Arc::new(SessionStats::default());
        let handle = SessionHandle {
            mapping: mapping.clone(),
            state: state_rx,
            stats: Arc::clone(&stats),
        };
        let session = Self {
            mapping,
            deps,
            state_tx,
            stats,
            listener: None,
        };
        (session, handle)
    }

    /// Run until `shutdown` is cancelled or the retry policy gives up.
    #[instrument(name = "session", skip_all, fields(mapping = %self.mapping))]
    pub async fn run(mut self, shutdown: CancellationToken) -> SessionExit {
        let mut attempt: u32 = 0;

        let exit = loop {
            if shutdown.is_cancelled() {
                break SessionExit::Terminated;
            }

            let cycle = shutdown.child_token();
            let outcome = self.run_cycle(&cycle, &mut attempt).await;
            // Stops every pump spawned during this cycle.
            cycle.cancel();

            let CycleError { phase, error } = match outcome {
                Ok(()) => break SessionExit::Terminated,
                Err(e) => e,
            };
            if shutdown.is_cancelled() {
                break SessionExit::Terminated;
            }

            error!(%phase, %error, "session cycle failed");
            if error.is_listener_error() {
                self.listener = None;
            }

            attempt = attempt.saturating_add(1);
            if !self.deps.retry.allows(attempt) {
                let retries = attempt.saturating_sub(1);
                error!(retries, "retry policy exhausted, stopping session");
                self.set_state(SessionState::Exhausted);
                self.listener = None;
                return SessionExit::Exhausted {
                    retries,
                    last_error: error.to_string(),
                };
            }

            let delay = self.deps.retry.delay_for(attempt);
            self.stats.reconnecting();
            self.set_state(SessionState::Reconnecting { attempt, delay });
            warn!(attempt, ?delay, "reconnecting");

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown.cancelled() => break SessionExit::Terminated,
            }
        };

        self.listener = None;
        self.set_state(SessionState::Terminated);
        info!("session terminated");
        exit
    }

    fn set_state(&self, state: SessionState) {
        debug!(%state, "session state");
        self.state_tx.send_replace(state);
    }

    /// One resolve -> connect -> serve pass. `Ok` means shutdown was requested.
    async fn run_cycle(
        &mut self,
        cycle: &CancellationToken,
        attempt: &mut u32,
    ) -> Result<(), CycleError> {
        self.set_state(SessionState::ResolvingEndpoint);
        let target = self.mapping.target();
        let backend = tokio::select! {
            resolved = self.deps.resolver.resolve(&target) => {
                resolved.map_err(|e| CycleError::new(Phase::Resolve, e))?
            }
            () = cycle.cancelled() => return Ok(()),
        };
        info!(%backend, "resolved backend");

        self.set_state(SessionState::Connecting);
        let tunnel = tokio::select! {
            connected = self.deps.connector.connect(&backend) => {
                connected.map_err(|e| CycleError::new(Phase::Connect, e))?
            }
            () = cycle.cancelled() => return Ok(()),
        };
        debug!(%backend, "tunnel established");

        let result = self.serve(&backend, &tunnel, cycle, attempt).await;

        // The tunnel never outlives its cycle.
        cycle.cancel();
        tunnel.close().await;
        result
    }

    async fn serve(
        &mut self,
        backend: &BackendIdentity,
        tunnel: &Arc<dyn TunnelConnection>,
        cycle: &CancellationToken,
        attempt: &mut u32,
    ) -> Result<(), CycleError> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => self.bind().await?,
        };
        let local_addr = listener.local_addr().map_err(|source| {
            CycleError::new(Phase::Bind, bind_error(self.bind_addr(), source))
        })?;

        info!(
            "Forwarding from {} -> {} ({})",
            local_addr, backend.port, backend.instance
        );
        self.set_state(SessionState::Listening(local_addr));
        *attempt = 0;

        let result = self
            .accept_loop(&listener, local_addr.port(), backend, tunnel, cycle)
            .await;

        match &result {
            Err(e) if e.error.is_listener_error() => {}
            _ => self.listener = Some(listener),
        }
        result
    }

    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.deps.bind_address, self.mapping.local_port)
    }

    async fn bind(&self) -> Result<TcpListener, CycleError> {
        let addr = self.bind_addr();
        TcpListener::bind(addr)
            .await
            .map_err(|source| CycleError::new(Phase::Bind, bind_error(addr, source)))
    }

    async fn accept_loop(
        &self,
        listener: &TcpListener,
        port: u16,
        backend: &BackendIdentity,
        tunnel: &Arc<dyn TunnelConnection>,
        cycle: &CancellationToken,
    ) -> Result<(), CycleError> {
        // Unique within this tunnel's lifetime.
        let request_ids = AtomicU32::new(0);

        loop {
            tokio::select! {
                () = cycle.cancelled() => return Ok(()),
                () = tunnel.closed() => {
                    return Err(CycleError::new(
                        Phase::Tunnel,
                        ForwardError::TunnelLost { backend: backend.to_string() },
                    ));
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let request_id = request_ids.fetch_add(1, Ordering::Relaxed);
                        self.spawn_pump(
                            stream,
                            peer,
                            Arc::clone(tunnel),
                            backend.port,
                            request_id,
                            cycle.clone(),
                        );
                    }
                    Err(source) => {
                        return Err(CycleError::new(
                            Phase::Accept,
                            ForwardError::Accept { port, source },
                        ));
                    }
                },
            }
        }
    }

    fn spawn_pump(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        tunnel: Arc<dyn TunnelConnection>,
        port: u16,
        request_id: u32,
        cancel: CancellationToken,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, %e, "failed to set TCP_NODELAY");
        }

        let active = self.stats.pump_started();

        let span = info_span!("pump", %peer, request_id);
        tokio::spawn(
            async move {
                debug!("handling connection");
                let outcome = pump::run(stream, tunnel.as_ref(), port, request_id, &cancel).await;
                match outcome {
                    Ok(done) => {
                        debug!(
                            bytes_sent = done.bytes_sent,
                            bytes_received = done.bytes_received,
                            "connection finished"
                        );
                        active.finish(true, false);
                    }
                    Err(ForwardError::Cancelled) => {
                        debug!("connection closed by session teardown");
                        active.finish(false, false);
                    }
                    Err(e @ ForwardError::Protocol { .. }) => {
                        warn!(phase = "remote", %e, "remote reported a forwarding error");
                        active.finish(false, true);
                    }
                    Err(e @ ForwardError::StreamOpen(_)) => {
                        warn!(phase = "open-stream", %e, "connection dropped");
                        active.finish(false, false);
                    }
                    Err(e) => {
                        warn!(phase = "copy", %e, "connection failed");
                        active.finish(false, false);
                    }
                }
            }
            .instrument(span),
        );
    }
}

fn bind_error(addr: SocketAddr, source: std::io::Error) -> ForwardError {
    ForwardError::Bind { addr, source }
}
