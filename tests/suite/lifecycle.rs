//! Start, crash, restart and shutdown against a real child process.

use std::time::Duration;

use typelens_lsp::{ClientState, HealthStatus, LspError};

use crate::common::{self, SOURCE};

#[tokio::test]
async fn start_reaches_ready_and_shutdown_stops() {
    let client = common::client(&[]);
    client.start().await.unwrap();
    assert_eq!(client.state(), ClientState::Ready);
    assert!(client.is_alive().await);

    // Starting again is a no-op.
    client.start().await.unwrap();

    client.shutdown().await;
    assert_eq!(client.state(), ClientState::Stopped);
    assert!(!client.is_alive().await);

    client.shutdown().await;
    assert_eq!(client.state(), ClientState::Stopped);
}

#[tokio::test]
async fn shutdown_sends_cooperative_handshake_to_child() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("methods.log");
    let log_arg = log.to_str().unwrap();
    let client = common::client(&["--record", log_arg]);
    client.start().await.unwrap();

    client.shutdown().await;
    assert_eq!(client.state(), ClientState::Stopped);

    let methods = std::fs::read_to_string(&log).unwrap();
    let methods: Vec<&str> = methods.lines().collect();
    assert_eq!(methods, ["initialize", "initialized", "shutdown", "exit"]);
}

#[tokio::test]
async fn failed_handshake_is_startup_failure() {
    let client = common::client(&["--fail-initialize"]);
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, LspError::StartupFailure { .. }), "got {err:?}");
    assert_eq!(client.state(), ClientState::Stopped);

    // Every later query degrades in one call.
    let query = typelens_lsp::DocumentQuery::new(common::source_path("a.py"), SOURCE, 0, 0);
    let err = client.hover(&query, None).await.unwrap_err();
    assert!(err.is_degraded());
}

#[tokio::test]
async fn unresponsive_handshake_times_out() {
    let mut config = common::mock_config(&["--no-reply", "initialize"]);
    config.handshake_timeout_secs = 1;
    let client = typelens_lsp::ProtocolClient::new(config, None);

    let started = tokio::time::Instant::now();
    let err = client.start().await.unwrap_err();
    assert!(matches!(err, LspError::StartupFailure { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(client.state(), ClientState::Stopped);
}

#[tokio::test]
async fn crash_is_detected_and_reported() {
    let manager = common::manager(&["--exit-after-initialize"]);
    manager.start().await.unwrap();

    let client = manager.client().clone();
    let noticed = common::wait_until(Duration::from_secs(5), || {
        let client = client.clone();
        async move { !client.is_alive().await }
    })
    .await;
    assert!(noticed, "crash was not detected");
    assert_eq!(manager.client().state(), ClientState::Crashed);

    let err = manager
        .hover(common::source_path("a.py"), SOURCE, 0, 0)
        .await
        .unwrap_err();
    assert!(matches!(err, LspError::Crashed { .. }), "got {err:?}");

    let health = manager.health().await;
    assert_eq!(health.status, HealthStatus::Degraded);
    assert_eq!(health.state, ClientState::Crashed);
    assert!(health.last_error.is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn restart_counts_and_recovers() {
    let manager = common::manager(&[]);
    manager.start().await.unwrap();
    manager.restart().await.unwrap();

    let health = manager.health().await;
    assert_eq!(health.restart_count, 1);
    assert_eq!(health.status, HealthStatus::Healthy);
    assert!(health.alive);

    let hover = manager
        .hover(common::source_path("restart.py"), SOURCE, 0, 1)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hover.contents, "count at 0:1");

    manager.shutdown().await;
    assert_eq!(manager.client().state(), ClientState::Stopped);
}

#[tokio::test]
async fn shutdown_fails_in_flight_queries() {
    let client = std::sync::Arc::new(common::client(&["--hover-delay-ms", "10000"]));
    client.start().await.unwrap();

    let in_flight = {
        let client = client.clone();
        tokio::spawn(async move {
            let query =
                typelens_lsp::DocumentQuery::new(common::source_path("slow.py"), SOURCE, 0, 0);
            client.hover(&query, Some(Duration::from_secs(30))).await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = tokio::time::Instant::now();
    client.shutdown().await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(matches!(err, LspError::ShuttingDown), "got {err:?}");
    assert_eq!(client.state(), ClientState::Stopped);
}
