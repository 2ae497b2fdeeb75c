//! Non-retriable authentication failures end the session.

use bytes::Bytes;
use std::time::Duration;
use tl_test_utils::MockBrokerServer;
use tradelink::{Session, SessionConfig, SessionError, SessionState};

fn config(port: u16) -> SessionConfig {
    SessionConfig {
        host: "127.0.0.1".to_owned(),
        port,
        tls: false,
        client_id: "test-client".to_owned(),
        client_secret: "bad-secret".to_owned(),
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

#[tokio::test]
async fn initial_connect_fails_on_rejected_credentials() {
    let server = MockBrokerServer::start().await.unwrap();
    server.reject_app_auth("CH_CLIENT_AUTH_FAILURE", "unknown client");

    let result = Session::connect(config(server.port())).await;
    assert!(matches!(result, Err(SessionError::AuthFailed(_))));
}

#[tokio::test]
async fn fatal_auth_during_reconnect_ends_the_session() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();
    let mut ticks = session.subscribe_ticks(&[1], false).await.unwrap();
    let mut executions = session.subscribe_execution().await.unwrap();

    // The token is revoked while we are connected; the reconnect handshake
    // will be rejected permanently.
    server.reject_app_auth("CH_ACCESS_TOKEN_INVALID", "token revoked");
    server.drop_connections();

    let mut watch = session.state_watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *watch.borrow_and_update() == SessionState::Fatal {
                return;
            }
            watch.changed().await.unwrap();
        }
    })
    .await
    .expect("session should become fatal");

    // New requests fail fast with AuthFailed.
    let result = session.send_request(2200, Bytes::new(), None).await;
    assert!(matches!(result, Err(SessionError::AuthFailed(_))));

    // Every open stream ends.
    assert!(
        tokio::time::timeout(Duration::from_secs(2), ticks.recv())
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        tokio::time::timeout(Duration::from_secs(2), executions.recv())
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(session.live_subscriptions(), 0);
}

#[tokio::test]
async fn retriable_auth_error_keeps_reconnecting() {
    let server = MockBrokerServer::start().await.unwrap();
    let session = Session::connect(config(server.port())).await.unwrap();

    // First reconnect handshake hits a transient error, then the server
    // recovers; the session must come back Ready rather than go Fatal.
    server.reject_app_auth("CH_SERVER_MAINTENANCE", "maintenance window");
    server.drop_connections();
    tokio::time::sleep(Duration::from_millis(300)).await;
    server.accept_app_auth();

    let mut watch = session.state_watch();
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if *watch.borrow_and_update() == SessionState::Ready {
                return;
            }
            watch.changed().await.unwrap();
        }
    })
    .await
    .expect("session should recover");
    assert!(session.metrics().reconnect_attempts >= 1);

    session.disconnect().await;
}
