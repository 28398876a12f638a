//! Timeouts and the circuit breaker against a slow or silent server.

use std::time::Duration;

use typelens_lsp::{BreakerState, DocumentQuery, LspError};

use crate::common::{self, SOURCE};

const SHORT: Option<Duration> = Some(Duration::from_millis(200));

#[tokio::test]
async fn timeout_counts_one_failure() {
    let client = common::client(&["--hover-delay-ms", "2000"]);
    client.start().await.unwrap();

    let query = DocumentQuery::new(common::source_path("slow.py"), SOURCE, 0, 0);
    let started = tokio::time::Instant::now();
    let err = client.hover(&query, SHORT).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { .. }), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(client.breaker().failure_count(), 1);
    assert_eq!(client.breaker().state(), BreakerState::Closed);

    // The late reply is discarded; the client keeps working.
    let open = client
        .request("mock/openDocuments", None, None)
        .await
        .unwrap();
    assert_eq!(open, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn breaker_opens_after_repeated_timeouts_and_fails_fast() {
    let client = common::client(&["--no-reply", "textDocument/hover"]);
    client.start().await.unwrap();
    let query = DocumentQuery::new(common::source_path("silent.py"), SOURCE, 0, 0);

    for _ in 0..3 {
        let err = client.hover(&query, SHORT).await.unwrap_err();
        assert!(matches!(err, LspError::Timeout { .. }), "got {err:?}");
    }
    assert_eq!(client.breaker().state(), BreakerState::Open);

    let started = tokio::time::Instant::now();
    let err = client
        .hover(&query, Some(Duration::from_secs(30)))
        .await
        .unwrap_err();
    assert!(started.elapsed() < Duration::from_millis(100));
    match err {
        LspError::CircuitOpen {
            breaker,
            retry_after,
        } => {
            assert_eq!(breaker, "analysis");
            assert!(retry_after <= Duration::from_secs(60));
        }
        other => panic!("expected CircuitOpen, got {other:?}"),
    }

    // The server itself is fine; only the breaker is refusing.
    assert!(client.is_alive().await);
    client.shutdown().await;
}

#[tokio::test]
async fn open_breaker_recovers_through_half_open() {
    let mut config = common::mock_config(&["--no-reply", "textDocument/definition"]);
    config.breaker = typelens_lsp::BreakerConfig::new(1, 1);
    let client = typelens_lsp::ProtocolClient::new(config, None);
    client.start().await.unwrap();
    let query = DocumentQuery::new(common::source_path("half_open.py"), SOURCE, 0, 0);

    let err = client.definition(&query, SHORT).await.unwrap_err();
    assert!(matches!(err, LspError::Timeout { .. }));
    assert_eq!(client.breaker().state(), BreakerState::Open);

    tokio::time::sleep(Duration::from_millis(1100)).await;

    // Hover still answers; the trial call closes the breaker.
    let hover = client.hover(&query, None).await.unwrap();
    assert!(hover.is_some());
    assert_eq!(client.breaker().state(), BreakerState::Closed);
    assert_eq!(client.breaker().failure_count(), 0);

    client.shutdown().await;
}
