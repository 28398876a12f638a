//! Typed queries, caching and document scoping.

use std::sync::Arc;
use std::time::Duration;

use typelens_lsp::{ClientState, DocumentQuery, LspError};

use crate::common::{self, SOURCE};

#[tokio::test]
async fn hover_and_definition_round_trip() {
    let client = common::client(&[]);
    client.start().await.unwrap();

    let query = DocumentQuery::new(common::source_path("round_trip.py"), SOURCE, 1, 9);
    let hover = client.hover(&query, None).await.unwrap().unwrap();
    assert_eq!(hover.contents, "count at 1:9");
    assert_eq!(hover.range.unwrap().start.character, 8);

    let locations = client.definition(&query, None).await.unwrap().unwrap();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].range.start.line, 0);
    assert_eq!(locations[0].range.start.character, 0);
    assert_eq!(locations[0].path(), Some(query.path.clone()));

    client.shutdown().await;
}

#[tokio::test]
async fn empty_position_is_none() {
    let client = common::client(&[]);
    client.start().await.unwrap();

    // Column 6 of "count = 1" is the '=' sign.
    let query = DocumentQuery::new(common::source_path("empty.py"), SOURCE, 0, 6);
    assert!(client.hover(&query, None).await.unwrap().is_none());

    client.shutdown().await;
}

#[tokio::test]
async fn documents_are_closed_after_each_query() {
    let client = common::client(&[]);
    client.start().await.unwrap();

    for line in 0..3 {
        let query = DocumentQuery::new(common::source_path("scoped.py"), SOURCE, line, 0);
        let _ = client.hover(&query, None).await.unwrap();
    }

    let open = client
        .request("mock/openDocuments", None, None)
        .await
        .unwrap();
    assert_eq!(open, 0);

    client.shutdown().await;
}

#[tokio::test]
async fn edited_text_is_seen_by_the_server() {
    let client = common::client(&[]);
    client.start().await.unwrap();
    let path = common::source_path("edited.py");

    let before = DocumentQuery::new(&path, "alpha = 1\n", 0, 0);
    let hover = client.hover(&before, None).await.unwrap().unwrap();
    assert_eq!(hover.contents, "alpha at 0:0");

    let after = DocumentQuery::new(&path, "beta = 1\n", 0, 0);
    let hover = client.hover(&after, None).await.unwrap().unwrap();
    assert_eq!(hover.contents, "beta at 0:0");

    client.shutdown().await;
}

#[tokio::test]
async fn cache_hit_needs_no_process() {
    let client = common::cached_client(&[]);
    client.start().await.unwrap();

    let query = DocumentQuery::new(common::source_path("cached.py"), SOURCE, 0, 0);
    let first = client.hover(&query, None).await.unwrap().unwrap();

    client.shutdown().await;
    assert_eq!(client.state(), ClientState::Stopped);

    let second = client.hover(&query, None).await.unwrap().unwrap();
    assert_eq!(first, second);

    // Different content misses the cache and has no server to fall back on.
    let edited = DocumentQuery::new(&query.path, "count = 2\n", 0, 0);
    let err = client.hover(&edited, None).await.unwrap_err();
    assert!(matches!(err, LspError::NotRunning { .. }), "got {err:?}");
}

#[tokio::test]
async fn empty_results_are_not_cached() {
    let client = common::cached_client(&[]);
    client.start().await.unwrap();

    let query = DocumentQuery::new(common::source_path("nothing.py"), SOURCE, 0, 6);
    assert!(client.hover(&query, None).await.unwrap().is_none());
    client.shutdown().await;

    let err = client.hover(&query, None).await.unwrap_err();
    assert!(matches!(err, LspError::NotRunning { .. }));
}

#[tokio::test]
async fn server_error_is_surfaced_without_tripping_breaker() {
    let client = common::client(&["--error-on-hover"]);
    client.start().await.unwrap();

    let query = DocumentQuery::new(common::source_path("err.py"), SOURCE, 0, 0);
    for _ in 0..5 {
        let err = client.hover(&query, None).await.unwrap_err();
        match &err {
            LspError::ServerError { code, message } => {
                assert_eq!(*code, -32000);
                assert_eq!(message, "hover failed");
            }
            other => panic!("expected ServerError, got {other:?}"),
        }
        assert!(!err.is_degraded());
    }
    assert_eq!(client.breaker().failure_count(), 0);
    assert!(client.is_alive().await);

    client.shutdown().await;
}

#[tokio::test]
async fn concurrent_queries_get_their_own_answers() {
    let client = Arc::new(common::client(&[]));
    client.start().await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..16u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let text = format!("name{i} = {i}\n");
            let query = DocumentQuery::new(common::source_path(&format!("c{i}.py")), text, 0, 0);
            let hover = client
                .hover(&query, Some(Duration::from_secs(5)))
                .await
                .unwrap()
                .unwrap();
            (i, hover.contents)
        }));
    }

    for task in tasks {
        let (i, contents) = task.await.unwrap();
        assert_eq!(contents, format!("name{i} at 0:0"));
    }

    let open = client
        .request("mock/openDocuments", None, None)
        .await
        .unwrap();
    assert_eq!(open, 0);
    client.shutdown().await;
}
