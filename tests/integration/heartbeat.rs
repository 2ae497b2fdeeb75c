//! Keepalive liveness on an idle connection.

use std::time::Duration;
use tl_test_utils::MockBrokerServer;
use tradelink::{Envelope, Session, SessionConfig, tags};

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
        heartbeat_idle: Duration::from_secs(1),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn idle_connection_emits_keepalives() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();

    // No user traffic at all: within a couple of idle intervals at least
    // one keepalive must reach the wire.
    let deadline = std::time::Instant::now() + Duration::from_secs(4);
    loop {
        if server.received_count(tags::KEEPALIVE) >= 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no keepalive written on an idle connection"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let keepalives = server.received();
    let keepalive = keepalives
        .iter()
        .find(|r| r.envelope.payload_type == tags::KEEPALIVE)
        .unwrap();
    assert!(keepalive.envelope.correlation_id.is_none());

    session.disconnect().await;
}

#[tokio::test]
async fn server_keepalive_gets_an_immediate_reply() {
    let server = MockBrokerServer::start().await.unwrap();
    let mut cfg = config(server.port());
    // Long idle so any keepalive we see is the reply, not the idle timer.
    cfg.heartbeat_idle = Duration::from_secs(600);
    let session = Session::connect(cfg).await.unwrap();

    server.push(Envelope::new(tags::KEEPALIVE, bytes::Bytes::new()));

    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    loop {
        if server.received_count(tags::KEEPALIVE) >= 1 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "keepalive was not answered"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    session.disconnect().await;
}

#[tokio::test]
async fn steady_user_traffic_suppresses_keepalives() {
    let server = MockBrokerServer::start().await.unwrap();
    server.swallow(2200);
    let session = Session::connect(config(server.port())).await.unwrap();

    // Send a frame every 400 ms for 2 s; the 1 s idle timer never fires.
    let mut replies = Vec::new();
    for _ in 0..5 {
        replies.push(
            session
                .request(2200, bytes::Bytes::new(), Some(Duration::from_secs(30)))
                .await
                .unwrap(),
        );
        tokio::time::sleep(Duration::from_millis(400)).await;
    }

    assert_eq!(server.received_count(tags::KEEPALIVE), 0);
    drop(replies);
    session.disconnect().await;
}
