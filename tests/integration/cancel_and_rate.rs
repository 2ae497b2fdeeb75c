//! Cancellation before dispatch and the outbound rate ceiling.

use bytes::Bytes;
use std::time::Duration;
use tl_test_utils::MockBrokerServer;
use tradelink::{Session, SessionConfig, SessionError};

fn config(port: u16, rate: u32) -> SessionConfig {
    SessionConfig {
        host: "127.0.0.1".to_owned(),
        port,
        tls: false,
        client_id: "test-client".to_owned(),
        client_secret: "test-secret".to_owned(),
        account_id: 1001,
        access_token: "test-token".to_owned(),
        rate_limit_per_second: rate,
        request_timeout: Duration::from_secs(30),
        heartbeat_idle: Duration::from_secs(600),
        ..SessionConfig::default()
    }
}

#[tokio::test]
async fn cancelled_request_never_reaches_the_wire() {
    let server = MockBrokerServer::start().await.unwrap();
    server.swallow(2200);

    // One frame per second: the handshake drains the bucket, so the frames
    // below queue behind refills.
    let session = Session::connect(config(server.port(), 1)).await.unwrap();

    let first = session
        .request(2200, Bytes::new(), None)
        .await
        .expect("first request enqueues");
    let second = session
        .request(2200, Bytes::new(), None)
        .await
        .expect("second request enqueues");

    // Cancel the second before the scheduler can draw its token.
    second.cancel();
    assert!(matches!(second.wait().await, Err(SessionError::Cancelled)));

    // Give the scheduler time to write everything it intends to write.
    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(server.received_count(2200), 1, "only the first frame hits the wire");
    assert_eq!(session.metrics().cancellations, 1);
    drop(first);
    session.disconnect().await;
}

#[tokio::test]
async fn outbound_frames_respect_the_rate_ceiling() {
    let server = MockBrokerServer::start().await.unwrap();
    server.swallow(2200);

    let session = Session::connect(config(server.port(), 2)).await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..6 {
        replies.push(session.request(2200, Bytes::new(), None).await.unwrap());
    }

    // Wait until all six frames arrived at the server.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while server.received_count(2200) < 6 {
        assert!(std::time::Instant::now() < deadline, "frames never arrived");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let arrivals: Vec<std::time::Instant> = server
        .received()
        .into_iter()
        .filter(|r| r.envelope.payload_type == 2200)
        .map(|r| r.at)
        .collect();
    assert_eq!(arrivals.len(), 6);

    // At most 2 frames in any one-second window: frames i and i+2 must be
    // at least (about) a refill apart.
    for pair in arrivals.windows(3) {
        let gap = pair[2].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(850),
            "three frames within {gap:?}"
        );
    }

    drop(replies);
    session.disconnect().await;
}

#[tokio::test]
async fn heartbeats_share_the_bucket_with_user_frames() {
    let server = MockBrokerServer::start().await.unwrap();
    server.swallow(2200);

    // Aggressive heartbeat, tiny bucket: keepalives must queue behind user
    // frames rather than exceed the ceiling.
    let mut cfg = config(server.port(), 1);
    cfg.heartbeat_idle = Duration::from_millis(300);
    let session = Session::connect(cfg).await.unwrap();

    let mut replies = Vec::new();
    for _ in 0..3 {
        replies.push(session.request(2200, Bytes::new(), None).await.unwrap());
    }
    tokio::time::sleep(Duration::from_secs(4)).await;

    let arrivals: Vec<std::time::Instant> =
        server.received().into_iter().map(|r| r.at).collect();
    for pair in arrivals.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(
            gap >= Duration::from_millis(850),
            "two frames within {gap:?} at rate 1/s"
        );
    }

    drop(replies);
    session.disconnect().await;
}
