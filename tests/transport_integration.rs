mod support;

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use axum::http::StatusCode;
use chromatic_http::{ChromaticError, FetchOptions, FetchRequest, NetworkEnv};
use reqwest::header::{HeaderName, HeaderValue};
use serde_json::json;
use support::{http_client, spawn_server, MockResponse};

#[tokio::test]
async fn success_returns_response_after_one_request() {
    let server = spawn_server().await;
    server.enqueue(
        "/ping",
        [MockResponse::json(StatusCode::OK, json!({ "pong": true }))],
    );
    let client = http_client(NetworkEnv::default());

    let body: serde_json::Value = client
        .fetch_json(&server.url("/ping"), FetchRequest::get(), FetchOptions::default())
        .await
        .expect("fetch must succeed");

    assert_eq!(body, json!({ "pong": true }));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn failing_status_is_retried_until_budget_is_spent() {
    let server = spawn_server().await;
    let client = http_client(NetworkEnv::default());

    let err = client
        .fetch(
            &server.url("/broken"),
            FetchRequest::get(),
            FetchOptions::default().retries(2),
        )
        .await
        .expect_err("fetch must fail");

    assert_eq!(server.hits(), 3);
    match err {
        ChromaticError::Http(http) => {
            assert_eq!(http.status, StatusCode::INTERNAL_SERVER_ERROR);
            assert!(http
                .body
                .as_deref()
                .is_some_and(|body| body.contains("no mock response available")));
            assert!(http
                .to_string()
                .starts_with("HTTPClient failed to fetch http://"));
            assert!(http.to_string().ends_with("got 500/Internal Server Error"));
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn default_options_do_not_retry() {
    let server = spawn_server().await;
    let client = http_client(NetworkEnv::default());

    let err = client
        .fetch(&server.url("/broken"), FetchRequest::get(), FetchOptions::default())
        .await
        .expect_err("fetch must fail");

    assert_eq!(err.status(), Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let server = spawn_server().await;
    server.enqueue(
        "/flaky",
        [
            MockResponse::text(StatusCode::SERVICE_UNAVAILABLE, "busy"),
            MockResponse::text(StatusCode::OK, "done"),
        ],
    );
    let client = http_client(NetworkEnv::default());
    let retries = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&retries);

    let body = client
        .fetch(
            &server.url("/flaky"),
            FetchRequest::get(),
            FetchOptions::default().retries(3).on_retry(move |err, attempt| {
                seen.lock()
                    .expect("retry log mutex")
                    .push((attempt, err.status().map(|status| status.as_u16())));
            }),
        )
        .await
        .expect("fetch must recover")
        .text()
        .await
        .expect("body must be readable");

    assert_eq!(body, "done");
    assert_eq!(server.hits(), 2);
    assert_eq!(
        *retries.lock().expect("retry log mutex"),
        vec![(1, Some(503))]
    );
}

#[tokio::test]
async fn error_body_is_skipped_when_requested() {
    let server = spawn_server().await;
    server.enqueue(
        "/secret",
        [MockResponse::text(StatusCode::FORBIDDEN, "signed url expired")],
    );
    let client = http_client(NetworkEnv::default());

    let err = client
        .fetch(
            &server.url("/secret"),
            FetchRequest::get(),
            FetchOptions::default().no_log_error_body(),
        )
        .await
        .expect_err("fetch must fail");

    match err {
        ChromaticError::Http(http) => {
            assert_eq!(http.status, StatusCode::FORBIDDEN);
            assert!(http.body.is_none());
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }
}

#[tokio::test]
async fn byte_body_is_resent_on_every_attempt() {
    let server = spawn_server().await;
    server.enqueue(
        "/submit",
        [
            MockResponse::text(StatusCode::BAD_GATEWAY, ""),
            MockResponse::ok(),
        ],
    );
    let client = http_client(NetworkEnv::default()).with_default_header(
        HeaderName::from_static("x-client"),
        HeaderValue::from_static("chromatic-http"),
    );

    client
        .fetch(
            &server.url("/submit"),
            FetchRequest::post().body(r#"{"n":1}"#),
            FetchOptions::default().retries(1),
        )
        .await
        .expect("fetch must succeed");

    let requests = server.requests_to("/submit");
    assert_eq!(requests.len(), 2);
    for request in requests {
        assert_eq!(request.body.as_ref(), br#"{"n":1}"#);
        assert_eq!(request.header("x-client"), Some("chromatic-http"));
    }
}

#[tokio::test]
async fn streaming_body_is_not_replayed() {
    let server = spawn_server().await;
    let client = http_client(NetworkEnv::default());

    let err = client
        .fetch(
            &server.url("/upload"),
            FetchRequest::put().stream(reqwest::Body::from("payload")),
            FetchOptions::default().retries(2),
        )
        .await
        .expect_err("fetch must fail");

    assert!(matches!(err, ChromaticError::Config(_)));
    assert_eq!(server.hits(), 1);
}

#[tokio::test]
async fn requests_are_routed_through_configured_proxy() {
    let proxy = spawn_server().await;
    proxy.enqueue("/hello", [MockResponse::text(StatusCode::OK, "via proxy")]);
    let env = NetworkEnv {
        http_proxy: Some(proxy.base_url.clone()),
        ..NetworkEnv::default()
    };
    let client = http_client(env);

    let body = client
        .fetch_buffer("http://storybook.example.test/hello", FetchRequest::get())
        .await
        .expect("proxied fetch must succeed");

    assert_eq!(body.as_ref(), b"via proxy");
    let requests = proxy.requests_to("/hello");
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].header("host"), Some("storybook.example.test"));
    assert_eq!(client.context().proxies().len(), 1);
}

#[tokio::test]
async fn no_proxy_hosts_bypass_the_proxy() {
    let server = spawn_server().await;
    server.enqueue("/direct", [MockResponse::text(StatusCode::OK, "direct")]);
    let env = NetworkEnv {
        // Nothing listens on the discard port.
        http_proxy: Some("http://127.0.0.1:9".to_owned()),
        no_proxy: Some("localhost,127.0.0.1".to_owned()),
        ..NetworkEnv::default()
    };
    let client = http_client(env);

    let body = client
        .fetch_buffer(&server.url("/direct"), FetchRequest::get())
        .await
        .expect("exempt fetch must succeed");

    assert_eq!(body.as_ref(), b"direct");
    assert!(client.context().proxies().is_empty());
}

#[tokio::test]
async fn unresolved_host_escalates_to_failover_dns() {
    let env = NetworkEnv {
        // Nothing answers DNS on the discard port.
        dns_failover_servers: vec!["127.0.0.1:9".to_owned()],
        ..NetworkEnv::default()
    };
    let client = http_client(env);
    let retries = Arc::new(Mutex::new(Vec::new()));
    let seen = Arc::clone(&retries);

    let err = client
        .fetch(
            "http://no-such-host.invalid/",
            FetchRequest::get(),
            FetchOptions::default().retries(2).on_retry(move |err, attempt| {
                seen.lock()
                    .expect("retry log mutex")
                    .push((attempt, err.is_dns_failure()));
            }),
        )
        .await
        .expect_err("fetch must fail");

    assert!(err.is_dns_failure(), "{err:?}");
    assert_eq!(
        *retries.lock().expect("retry log mutex"),
        vec![(1, true), (2, true)]
    );
    let failover: SocketAddr = "127.0.0.1:9".parse().expect("valid address");
    assert_eq!(client.context().dns().servers(), vec![failover]);
    assert!(client.context().dns().is_failed_over());
}
