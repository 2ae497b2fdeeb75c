//! Stream survival and recovery across a forced transport reset.

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tl_test_utils::MockBrokerServer;
use tradelink::protocol::{DepthEvent, DepthQuote, SpotEvent, encode_body};
use tradelink::{
    Envelope, Session, SessionConfig, SessionError, SessionHooks, SessionState, tags,
};

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
        heartbeat_idle: Duration::from_secs(600),
        reconnect_backoff_base: Duration::from_millis(50),
        reconnect_backoff_cap: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

fn spot(symbol_id: i64, bid: u64) -> Envelope {
    let body = encode_body(&SpotEvent {
        symbol_id,
        bid: Some(bid),
        ask: None,
        trendbars: Vec::new(),
    })
    .unwrap();
    Envelope::new(tags::SPOT_EVENT, body)
}

#[derive(Default)]
struct EventRecorder {
    events: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl SessionHooks for EventRecorder {
    async fn reconnect_attempt(&self, attempt: u32) {
        self.events
            .lock()
            .unwrap()
            .push(format!("reconnect.attempt:{attempt}"));
    }
    async fn reconnect_success(&self, attempt: u32) {
        self.events
            .lock()
            .unwrap()
            .push(format!("reconnect.success:{attempt}"));
    }
    async fn reconnect_fatal(&self, _reason: &SessionError) {
        self.events.lock().unwrap().push("reconnect.fatal".to_owned());
    }
}

async fn wait_for_state(session: &Session, wanted: SessionState) {
    let mut watch = session.state_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *watch.borrow_and_update() == wanted {
                return;
            }
            watch.changed().await.unwrap();
        }
    })
    .await
    .unwrap_or_else(|_| panic!("never reached {wanted:?}"));
}

#[tokio::test]
async fn streams_survive_a_transport_reset() {
    let server = MockBrokerServer::start().await.unwrap();
    let recorder = Arc::new(EventRecorder::default());
    let session = Session::connect_with_hooks(config(server.port()), vec![recorder.clone()])
        .await
        .unwrap();

    let mut eurusd = session.subscribe_ticks(&[1], false).await.unwrap();
    let mut usdjpy = session.subscribe_ticks(&[2], false).await.unwrap();

    server.push(spot(1, 110_000));
    server.push(spot(2, 15_700_000));
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), eurusd.recv())
            .await
            .unwrap()
            .unwrap()
            .bid,
        Some(110_000)
    );
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), usdjpy.recv())
            .await
            .unwrap()
            .unwrap()
            .symbol_id,
        2
    );

    // A request in flight when the transport dies must fail TransportLost.
    server.swallow(2200);
    let in_flight = session
        .request(2200, Bytes::new(), Some(Duration::from_secs(30)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.drop_connections();
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(5), in_flight.wait())
            .await
            .unwrap(),
        Err(SessionError::TransportLost)
    ));

    wait_for_state(&session, SessionState::Ready).await;
    assert!(session.metrics().reconnect_attempts >= 1);
    assert!(session.metrics().reconnect_successes >= 1);

    // Both subscriptions were rearmed: two initial subscribes + two rearms.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server.received_count(tags::SUBSCRIBE_SPOTS_REQ) < 4 {
        assert!(
            std::time::Instant::now() < deadline,
            "subscriptions were not rearmed"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Refresh-only recovery fetched the model snapshots.
    assert!(server.received_count(tags::SYMBOLS_LIST_REQ) >= 1);
    assert!(server.received_count(tags::TRADER_REQ) >= 1);
    assert!(server.received_count(tags::RECONCILE_REQ) >= 1);

    // Ticks flow again on both iterators; neither saw end-of-stream.
    server.push(spot(1, 110_010));
    server.push(spot(2, 15_700_100));
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), eurusd.recv())
            .await
            .unwrap()
            .unwrap()
            .bid,
        Some(110_010)
    );
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(2), usdjpy.recv())
            .await
            .unwrap()
            .unwrap()
            .bid,
        Some(15_700_100)
    );

    let events = recorder.events.lock().unwrap().clone();
    assert!(events.iter().any(|e| e.starts_with("reconnect.attempt")));
    assert!(events.iter().any(|e| e.starts_with("reconnect.success")));
    let attempt_pos = events
        .iter()
        .position(|e| e.starts_with("reconnect.attempt"))
        .unwrap();
    let success_pos = events
        .iter()
        .position(|e| e.starts_with("reconnect.success"))
        .unwrap();
    assert!(attempt_pos < success_pos);

    session.disconnect().await;
}

#[tokio::test]
async fn depth_book_rebuilds_from_scratch_after_reconnect() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    let mut depth = session.subscribe_depth(42).await.unwrap();

    let pre = DepthEvent {
        symbol_id: 42,
        new_quotes: vec![DepthQuote {
            id: 1,
            size: 10,
            bid: Some(110_000),
            ask: None,
        }],
        deleted_quote_ids: vec![],
    };
    server.push(Envelope::new(tags::DEPTH_EVENT, encode_body(&pre).unwrap()));
    let first = tokio::time::timeout(Duration::from_secs(2), depth.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.bids.len(), 1);

    server.drop_connections();
    wait_for_state(&session, SessionState::Ready).await;

    // Only the post-reconnect delta may appear in the next snapshot.
    let post = DepthEvent {
        symbol_id: 42,
        new_quotes: vec![DepthQuote {
            id: 9,
            size: 5,
            bid: None,
            ask: Some(110_050),
        }],
        deleted_quote_ids: vec![],
    };
    server.push(Envelope::new(tags::DEPTH_EVENT, encode_body(&post).unwrap()));
    let snapshot = tokio::time::timeout(Duration::from_secs(2), depth.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(snapshot.bids.is_empty(), "stale pre-reconnect quote survived");
    assert_eq!(snapshot.asks.len(), 1);

    session.disconnect().await;
}

#[tokio::test]
async fn reconnect_disabled_ends_streams_on_loss() {
    let server = MockBrokerServer::start().await.unwrap();
    let mut cfg = config(server.port());
    cfg.reconnect_enabled = false;
    let session = Session::connect(cfg).await.unwrap();
    let mut ticks = session.subscribe_ticks(&[1], false).await.unwrap();

    server.drop_connections();
    wait_for_state(&session, SessionState::Disconnected).await;
    assert!(
        tokio::time::timeout(Duration::from_secs(2), ticks.recv())
            .await
            .unwrap()
            .is_none()
    );
}
