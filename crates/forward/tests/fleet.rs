mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use podlink_forward::{Fleet, ForwardError, PortMapping, SessionExit, SessionState};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_failing_session_does_not_affect_siblings() {
    let resolver = Arc::new(StaticResolver::new());
    let connector = Arc::new(LoopbackConnector::new());

    let mut healthy = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let port = spawn_backend(move |request| {
            format!("{name}:{}", String::from_utf8_lossy(&request)).into_bytes()
        })
        .await;
        resolver.insert("dev", name, &format!("{name}-pod"), port);
        healthy.push(PortMapping::new(0, "dev", name, 80));
    }
    // Never resolvable.
    let broken = PortMapping::new(0, "dev", "missing", 80);

    let mut mappings = healthy.clone();
    mappings.push(broken.clone());

    let fleet = Fleet::spawn(
        mappings,
        deps(&resolver, &connector, fast_retry(None)),
        CancellationToken::new(),
    )
    .unwrap();
    assert_eq!(fleet.sessions().len(), 4);

    for handle in fleet.sessions() {
        if handle.mapping() == &broken {
            continue;
        }
        let mut handle = handle.clone();
        let addr = handle.listening().await.unwrap();
        let name = handle.mapping().target_name.clone();
        let response = round_trip(addr, b"hi").await;
        assert_eq!(response, format!("{name}:hi").into_bytes());
    }

    let broken_handle = fleet
        .sessions()
        .iter()
        .find(|h| h.mapping() == &broken)
        .unwrap()
        .clone();
    eventually("broken session to retry", || {
        broken_handle.stats().snapshot().reconnects >= 2
    })
    .await;
    assert!(!matches!(broken_handle.state(), SessionState::Listening(_)));

    let totals = fleet.totals();
    assert_eq!(totals.accepted, 3);

    fleet.shutdown();
    let reports = tokio::time::timeout(Duration::from_secs(5), fleet.wait())
        .await
        .expect("fleet did not stop");
    assert_eq!(reports.len(), 4);
    assert!(reports
        .iter()
        .all(|r| r.exit == Some(SessionExit::Terminated)));
}

#[tokio::test]
async fn test_invalid_mapping_starts_nothing() {
    let resolver = Arc::new(StaticResolver::new());
    let connector = Arc::new(LoopbackConnector::new());

    let result = Fleet::spawn(
        vec![
            PortMapping::new(0, "dev", "ok", 80),
            PortMapping::new(0, "dev", "", 80),
        ],
        deps(&resolver, &connector, fast_retry(None)),
        CancellationToken::new(),
    );
    assert!(matches!(result, Err(ForwardError::InvalidMapping(_))));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(resolver.calls(), 0);
}

#[tokio::test]
async fn test_exhausted_session_is_reported() {
    let resolver = Arc::new(StaticResolver::new());
    let connector = Arc::new(LoopbackConnector::new());
    let mapping = PortMapping::new(0, "dev", "nowhere", 80);

    let fleet = Fleet::spawn(
        vec![mapping.clone()],
        deps(&resolver, &connector, fast_retry(Some(1))),
        CancellationToken::new(),
    )
    .unwrap();

    let reports = tokio::time::timeout(Duration::from_secs(5), fleet.wait())
        .await
        .expect("exhausted session did not end");
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].mapping, mapping);
    assert!(matches!(
        reports[0].exit,
        Some(SessionExit::Exhausted { retries: 1, .. })
    ));
}

#[tokio::test]
async fn test_external_token_stops_fleet() {
    let backend_port = spawn_echo_backend().await;
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("dev", "web", "web-0", backend_port);
    let connector = Arc::new(LoopbackConnector::new());
    let shutdown = CancellationToken::new();

    let fleet = Fleet::spawn(
        vec![PortMapping::new(0, "dev", "web", 80)],
        deps(&resolver, &connector, fast_retry(None)),
        shutdown.clone(),
    )
    .unwrap();
    let mut handle = fleet.sessions()[0].clone();
    handle.listening().await.unwrap();

    shutdown.cancel();
    let reports = tokio::time::timeout(Duration::from_secs(5), fleet.wait())
        .await
        .unwrap();
    assert_eq!(reports[0].exit, Some(SessionExit::Terminated));
    assert_eq!(handle.state(), SessionState::Terminated);
}
