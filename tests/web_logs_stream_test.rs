#[tokio::test]
async fn logs_stream_emits_named_log_events() {
    use axum::http::Request;
    use axum::routing::get;
    use http_body_util::BodyExt as _;
    use std::time::Duration;
    use tower::ServiceExt;

    // Broadcast layer only exists once logging is initialized
    let _ = bankwarden::logging::init_logging(&bankwarden::config::LoggingConfig::default());

    let router = axum::Router::new().route("/api/logs/stream", get(bankwarden::web::logs_stream));

    let response = router
        .oneshot(
            Request::builder()
                .uri("/api/logs/stream")
                .body(axum::body::Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), axum::http::StatusCode::OK);
    let ct = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    assert!(ct.contains("text/event-stream"));

    tokio::spawn(async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let logger = bankwarden::logging::get_logger("test_sse");
        logger.info("sse_test_line_123");
    });

    let mut body = response.into_body();
    let mut buf: Vec<u8> = Vec::new();
    let wait = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match body.frame().await {
                Some(Ok(frame)) => {
                    if let Some(data) = frame.data_ref() {
                        buf.extend_from_slice(data);
                        let text = String::from_utf8_lossy(&buf);
                        if text.contains("sse_test_line_123") {
                            return text.to_string();
                        }
                    }
                }
                _ => panic!("stream ended early"),
            }
        }
    })
    .await;

    let text = wait.expect("timed out waiting for log event");
    assert!(text.contains("event: log"), "{}", text);
}
