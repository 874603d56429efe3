mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use podlink_forward::{
    PortMapping, Session, SessionExit, SessionState, StreamKind, StreamRequest,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

fn mapping() -> PortMapping {
    PortMapping::new(0, "dev", "my-svc", 80)
}

#[tokio::test]
async fn test_ping_pong_through_session() {
    let backend_port = spawn_backend(|request| {
        if request == b"PING\n" {
            b"PONG\n".to_vec()
        } else {
            b"WHAT\n".to_vec()
        }
    })
    .await;

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(session.run(shutdown.clone()));

    let addr = handle.listening().await.expect("session never listened");
    assert_eq!(round_trip(addr, b"PING\n").await, b"PONG\n");

    let stats = Arc::clone(handle.stats());
    eventually("pump to finish", || stats.snapshot().pumps_succeeded == 1).await;

    // Error stream strictly before data stream, same id, resolved port.
    let opened = connector.latest().opened();
    assert_eq!(
        opened,
        vec![
            StreamRequest {
                kind: StreamKind::Error,
                port: backend_port,
                request_id: 0,
            },
            StreamRequest {
                kind: StreamKind::Data,
                port: backend_port,
                request_id: 0,
            },
        ]
    );

    shutdown.cancel();
    assert_eq!(task.await.unwrap(), SessionExit::Terminated);
    assert_eq!(handle.state(), SessionState::Terminated);
}

#[tokio::test]
async fn test_payloads_are_byte_exact() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));
    let addr = handle.listening().await.unwrap();

    // Zero-length exchange: local EOF must still complete both directions.
    assert!(round_trip(addr, b"").await.is_empty());

    let large: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 251) as u8).collect();
    let echoed = round_trip(addr, &large).await;
    assert_eq!(echoed.len(), large.len());
    assert!(echoed == large, "large payload was corrupted");

    shutdown.cancel();
}

#[tokio::test]
async fn test_remote_keeps_sending_after_local_half_close() {
    // The backend only answers once it has seen our EOF, so the response
    // can only arrive if remote->local survives the local half-close.
    let backend_port =
        spawn_backend(|request| format!("got {} bytes", request.len()).into_bytes()).await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));
    let addr = handle.listening().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"hello").await.unwrap();
    stream.shutdown().await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert_eq!(response, "got 5 bytes");

    shutdown.cancel();
}

#[tokio::test]
async fn test_remote_error_is_reported_and_local_closed() {
    let dead_port = closed_port().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", dead_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));
    let addr = handle.listening().await.unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
        .await
        .expect("local connection was never closed")
        .unwrap();
    assert!(response.is_empty());

    let stats = Arc::clone(handle.stats());
    eventually("protocol error to be counted", || {
        stats.snapshot().protocol_errors == 1
    })
    .await;

    // A failed pump never tears the session down.
    assert!(matches!(handle.state(), SessionState::Listening(_)));
    assert_eq!(connector.connects(), 1);

    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_connections_get_distinct_request_ids() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));
    let addr = handle.listening().await.unwrap();

    let clients: Vec<_> = (0..16)
        .map(|i| {
            tokio::spawn(async move {
                let payload = format!("client-{i}").repeat(100).into_bytes();
                let echoed = round_trip(addr, &payload).await;
                assert_eq!(echoed, payload);
            })
        })
        .collect();
    for client in clients {
        client.await.unwrap();
    }

    let mut ids: Vec<u32> = connector
        .latest()
        .opened()
        .iter()
        .filter(|r| r.kind == StreamKind::Data)
        .map(|r| r.request_id)
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 16);

    shutdown.cancel();
}

#[tokio::test]
async fn test_dial_failures_retry_then_listen() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::failing(2));

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(Some(5))));
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));

    let addr = tokio::time::timeout(Duration::from_secs(5), handle.listening())
        .await
        .expect("session never recovered")
        .unwrap();

    assert_eq!(connector.connects(), 3);
    assert_eq!(handle.stats().snapshot().reconnects, 2);
    // Every cycle resolves again.
    assert_eq!(resolver.calls(), 3);
    assert_eq!(round_trip(addr, b"ok").await, b"ok");

    shutdown.cancel();
}

#[tokio::test]
async fn test_bounded_policy_exhausts() {
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", 1);
    let connector = Arc::new(LoopbackConnector::failing(u32::MAX));

    let (session, handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(Some(2))));
    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        session.run(CancellationToken::new()),
    )
    .await
    .expect("session never gave up");

    match exit {
        SessionExit::Exhausted { retries, last_error } => {
            assert_eq!(retries, 2);
            assert!(last_error.contains("connection refused"), "{last_error}");
        }
        other => panic!("expected Exhausted, got {other:?}"),
    }
    assert_eq!(connector.connects(), 3);
    assert_eq!(handle.state(), SessionState::Exhausted);
}

#[tokio::test]
async fn test_unresolvable_target_keeps_retrying() {
    let resolver = Arc::new(StaticResolver::new());
    let connector = Arc::new(LoopbackConnector::new());

    let (session, handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(session.run(shutdown.clone()));

    eventually("several resolve attempts", || resolver.calls() >= 3).await;
    assert_eq!(connector.connects(), 0);

    // Becomes resolvable later; the session picks it up on its own.
    let backend_port = spawn_echo_backend().await;
    resolver.insert("dev", "my-svc", "pod-late", backend_port);
    let mut handle = handle;
    let addr = tokio::time::timeout(Duration::from_secs(5), handle.listening())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(round_trip(addr, b"late").await, b"late");

    shutdown.cancel();
    assert_eq!(task.await.unwrap(), SessionExit::Terminated);
}

#[tokio::test]
async fn test_lost_tunnel_reconnects_on_same_listener() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));
    let first_addr = handle.listening().await.unwrap();

    connector.latest().drop_connection();

    let stats = Arc::clone(handle.stats());
    eventually("reconnect", || {
        stats.snapshot().reconnects == 1 && connector.connects() == 2
    })
    .await;
    let second_addr = handle.listening().await.unwrap();

    assert_eq!(first_addr, second_addr);
    assert!(connector.tunnels()[0].is_closed());
    assert_eq!(round_trip(second_addr, b"again").await, b"again");

    shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_releases_listener_and_tunnel() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let (session, mut handle) =
        Session::new(mapping(), deps(&resolver, &connector, fast_retry(None)));
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(session.run(shutdown.clone()));
    let addr = handle.listening().await.unwrap();

    // An idle connection parked in a pump must not hold shutdown up.
    let _idle = TcpStream::connect(addr).await.unwrap();
    let stats = Arc::clone(handle.stats());
    eventually("idle pump to start", || stats.snapshot().accepted == 1).await;

    shutdown.cancel();
    let exit = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not stop")
        .unwrap();
    assert_eq!(exit, SessionExit::Terminated);
    assert!(connector.latest().is_closed());
    assert!(TcpStream::connect(addr).await.is_err());

    eventually("idle pump to stop", || stats.snapshot().active_pumps == 0).await;
}

#[tokio::test]
async fn test_bind_failure_retries_until_port_is_free() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "my-svc", "pod-xyz", backend_port);
    let connector = Arc::new(LoopbackConnector::new());

    let squatter = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = squatter.local_addr().unwrap().port();

    let (session, mut handle) = Session::new(
        PortMapping::new(port, "dev", "my-svc", 80),
        deps(&resolver, &connector, fast_retry(None)),
    );
    let shutdown = CancellationToken::new();
    tokio::spawn(session.run(shutdown.clone()));

    let stats = Arc::clone(handle.stats());
    eventually("repeated bind failures", || {
        stats.snapshot().reconnects >= 2 && connector.connects() >= 2
    })
    .await;
    assert!(matches!(
        handle.state(),
        SessionState::Reconnecting { .. }
            | SessionState::ResolvingEndpoint
            | SessionState::Connecting
    ));
    // A cycle that could not bind never keeps its tunnel.
    let tunnels = connector.tunnels();
    let settled = &tunnels[..tunnels.len() - 1];
    assert!(settled.iter().all(|tunnel| tunnel.is_closed()));
    assert!(settled.iter().all(|tunnel| tunnel.opened().is_empty()));

    drop(squatter);

    let addr = tokio::time::timeout(Duration::from_secs(5), handle.listening())
        .await
        .expect("session never bound the freed port")
        .unwrap();
    assert_eq!(addr.port(), port);
    assert_eq!(round_trip(addr, b"bound").await, b"bound");

    shutdown.cancel();
}
