//! Request/response path: happy path, timeout, remote error, readiness gate.

use bytes::Bytes;
use std::time::Duration;
use tl_test_utils::MockBrokerServer;
use tradelink::{Envelope, Session, SessionConfig, SessionError, tags};

fn config(port: u16) -> SessionConfig {
    SessionConfig {
        host: "127.0.0.1".to_owned(),
        port,
        tls: false,
        client_id: "test-client".to_owned(),
        client_secret: "test-secret".to_owned(),
        account_id: 1001,
        access_token: "test-token".to_owned(),
        rate_limit_per_second: 50,
        request_timeout: Duration::from_secs(2),
        // Keep keepalives out of these scenarios.
        heartbeat_idle: Duration::from_secs(600),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn request_resolves_with_response_payload() {
    let server = MockBrokerServer::start().await.unwrap();
    // Echo 2101 with payload 0x01 for every 2100, as the auth stub already
    // does for the handshake.
    server.respond_with(tags::APP_AUTH_REQ, |req| {
        let correlation = req.correlation_id.clone()?;
        Some(Envelope::with_correlation(
            tags::APP_AUTH_RES,
            Bytes::from_static(b"\x01"),
            correlation,
        ))
    });

    let session = Session::connect(config(server.port())).await.unwrap();
    let before = session.metrics();

    let payload = tokio::time::timeout(
        Duration::from_secs(1),
        session.send_request(tags::APP_AUTH_REQ, Bytes::new(), Some(Duration::from_secs(1))),
    )
    .await
    .expect("should resolve within a second")
    .unwrap();

    assert_eq!(payload, Bytes::from_static(b"\x01"));
    let after = session.metrics();
    assert_eq!(after.requests_sent - before.requests_sent, 1);
    assert_eq!(after.responses_received - before.responses_received, 1);
    assert_eq!(after.latency_count - before.latency_count, 1);
    session.disconnect().await;
}

#[tokio::test]
async fn unanswered_request_times_out_and_leaves_no_entry() {
    let server = MockBrokerServer::start().await.unwrap();
    server.swallow(2200);

    let session = Session::connect(config(server.port())).await.unwrap();
    let started = std::time::Instant::now();
    let result = session
        .send_request(2200, Bytes::new(), Some(Duration::from_millis(100)))
        .await;
    let elapsed = started.elapsed();

    assert!(matches!(result, Err(SessionError::Timeout)));
    // Deadline plus at most a couple of housekeeping ticks.
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    assert_eq!(session.pending_requests(), 0);
    assert_eq!(session.metrics().timeouts, 1);
    session.disconnect().await;
}

#[tokio::test]
async fn remote_error_response_maps_to_typed_error() {
    let server = MockBrokerServer::start().await.unwrap();
    server.respond_with(2200, |req| {
        let correlation = req.correlation_id.clone()?;
        let body = tradelink::protocol::encode_body(&tradelink::protocol::ErrorRes {
            error_code: "TRADING_BAD_VOLUME".to_owned(),
            description: "volume below minimum".to_owned(),
            maintenance_end_ms: None,
        })
        .unwrap();
        Some(Envelope::with_correlation(tags::ERROR_RES, body, correlation))
    });

    let session = Session::connect(config(server.port())).await.unwrap();
    match session.send_request(2200, Bytes::new(), None).await {
        Err(SessionError::Remote { code, description, .. }) => {
            assert_eq!(code, "TRADING_BAD_VOLUME");
            assert_eq!(description, "volume below minimum");
        }
        other => panic!("expected remote error, got {other:?}"),
    }
    // A remote error is per-request: the session stays Ready.
    assert_eq!(session.state(), tradelink::SessionState::Ready);
    session.disconnect().await;
}

#[tokio::test]
async fn requests_after_disconnect_fail_fast() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    session.disconnect().await;

    let result = session.send_request(2200, Bytes::new(), None).await;
    assert!(matches!(result, Err(SessionError::NotReady)));
}

#[tokio::test]
async fn disconnect_is_idempotent() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    session.disconnect().await;
    session.disconnect().await;
    let clone = session.clone();
    clone.disconnect().await;
}

#[tokio::test]
async fn run_scoped_disconnects_on_exit() {
    let server = MockBrokerServer::start().await.unwrap();
    let cfg = config(server.port());
    let outer = Session::run_scoped(cfg, |session| async move {
        assert_eq!(session.state(), tradelink::SessionState::Ready);
        session
    })
    .await
    .unwrap();
    assert_eq!(outer.state(), tradelink::SessionState::Disconnected);
}

#[tokio::test]
async fn late_response_is_counted_as_orphan() {
    let server = MockBrokerServer::start().await.unwrap();
    server.swallow(2200);

    let session = Session::connect(config(server.port())).await.unwrap();
    let reply = session
        .request(2200, Bytes::new(), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    let correlation_id = reply.correlation_id().to_owned();
    reply.cancel();

    // The "response" arrives after cancellation: push it from the server.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.push(Envelope::with_correlation(
        2201,
        Bytes::new(),
        correlation_id,
    ));
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(session.metrics().orphans, 1);
    session.disconnect().await;
}
