//! Depth reconstruction from incremental updates.

use bytes::Bytes;
use std::time::Duration;
use tl_test_utils::MockBrokerServer;
use tradelink::protocol::{DepthEvent, DepthQuote, encode_body};
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
        heartbeat_idle: Duration::from_secs(600),
        ..SessionConfig::default()
    }
}

fn bid(id: u64, price: u64, size: u64) -> DepthQuote {
    DepthQuote {
        id,
        size,
        bid: Some(price),
        ask: None,
    }
}

fn ask(id: u64, price: u64, size: u64) -> DepthQuote {
    DepthQuote {
        id,
        size,
        bid: None,
        ask: Some(price),
    }
}

fn depth_envelope(event: &DepthEvent) -> Envelope {
    Envelope::new(tags::DEPTH_EVENT, encode_body(event).unwrap())
}

#[tokio::test]
async fn two_deltas_produce_two_snapshots_with_correct_book() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    let mut depth = session.subscribe_depth(42).await.unwrap();
    assert_eq!(server.received_count(tags::SUBSCRIBE_DEPTH_REQ), 1);

    server.push(depth_envelope(&DepthEvent {
        symbol_id: 42,
        new_quotes: vec![
            bid(1, 110_000, 10),
            bid(2, 109_990, 20),
            ask(3, 110_020, 15),
        ],
        deleted_quote_ids: vec![],
    }));

    let first = tokio::time::timeout(Duration::from_secs(2), depth.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.best_bid(), Some(110_000));
    assert_eq!(first.best_ask(), Some(110_020));
    assert_eq!(first.bids.len(), 2);

    server.push(depth_envelope(&DepthEvent {
        symbol_id: 42,
        new_quotes: vec![bid(4, 109_980, 25)],
        deleted_quote_ids: vec![2],
    }));

    let second = tokio::time::timeout(Duration::from_secs(2), depth.recv())
        .await
        .unwrap()
        .unwrap();
    let bids: Vec<(u64, u64)> = second.bids.iter().map(|l| (l.price, l.volume)).collect();
    let asks: Vec<(u64, u64)> = second.asks.iter().map(|l| (l.price, l.volume)).collect();
    assert_eq!(bids, vec![(110_000, 10), (109_980, 25)]);
    assert_eq!(asks, vec![(110_020, 15)]);
    assert_eq!(second.spread(), Some(20));
    assert_eq!(second.bid_volume(), 35);
    assert_eq!(second.ask_volume(), 15);

    session.disconnect().await;
}

#[tokio::test]
async fn depth_events_for_other_symbols_do_not_reach_the_stream() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    let mut depth = session.subscribe_depth(42).await.unwrap();

    // Another symbol's event routes to "depth:7", not our topic.
    server.push(depth_envelope(&DepthEvent {
        symbol_id: 7,
        new_quotes: vec![bid(1, 5, 5)],
        deleted_quote_ids: vec![],
    }));
    server.push(depth_envelope(&DepthEvent {
        symbol_id: 42,
        new_quotes: vec![bid(2, 110_000, 1)],
        deleted_quote_ids: vec![],
    }));

    let snapshot = tokio::time::timeout(Duration::from_secs(2), depth.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snapshot.symbol_id, 42);
    assert_eq!(snapshot.best_bid(), Some(110_000));

    session.disconnect().await;
}

#[tokio::test]
async fn closing_the_stream_removes_the_subscription() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    let depth = session.subscribe_depth(42).await.unwrap();
    assert_eq!(session.live_subscriptions(), 1);

    drop(depth);
    assert_eq!(session.live_subscriptions(), 0);

    // Pushes after close go nowhere; the session itself stays healthy.
    server.push(depth_envelope(&DepthEvent {
        symbol_id: 42,
        new_quotes: vec![bid(1, 1, 1)],
        deleted_quote_ids: vec![],
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    // 2200 is unanswered by the mock; a clean Timeout proves the read loop
    // survived the post-close push.
    let result = session
        .send_request(2200, Bytes::new(), Some(Duration::from_secs(1)))
        .await;
    assert!(matches!(result, Err(SessionError::Timeout)));
    session.disconnect().await;
}
