
use mock_server::MockServer;
use preflight_sandbox::config::{AppConfig, FetchConfig};
use preflight_sandbox::http_client::{FetchOptions, HttpClient, HttpError};
use preflight_sandbox::{Environment, EnvironmentStore, RequestContext, SandboxRuntime};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;

fn test_fetch_config() -> FetchConfig {
    AppConfig::test_config().fetch
}

#[tokio::test]
async fn test_fetch_get_request() {
    let mock = MockServer::start()
        .await
        .expect("Failed to start mock server");
    let url = mock.url("/token?user=alice");

    let result = tokio::task::spawn_blocking(move || {
        let client = HttpClient::new(&test_fetch_config()).expect("Failed to create client");
        client.fetch(&url, FetchOptions::default(), None)
    })
    .await
    .expect("Task panicked");

    let response = result.expect("GET request should succeed");
    assert_eq!(response.status, 200);
    assert!(response.ok);
    assert_eq!(response.headers.get("x-request-id").unwrap(), "req-42");
    assert!(response.body.contains("token-for-alice"));

    mock.shutdown().await;
}

#[tokio::test]
async fn test_fetch_post_with_headers_and_body() {
    let mock = MockServer::start()
        .await
        .expect("Failed to start mock server");
    let url = mock.url("/echo");

    let result = tokio::task::spawn_blocking(move || {
        let client = HttpClient::new(&test_fetch_config()).expect("Failed to create client");
        let mut headers = HashMap::new();
        headers.insert("X-Api-Key".to_string(), "secret".to_string());
        client.fetch(
            &url,
            FetchOptions {
                method: "POST".to_string(),
                headers: Some(headers),
                body: Some(r#"{"query":"{ me }"}"#.to_string()),
                timeout_ms: None,
            },
            None,
        )
    })
    .await
    .expect("Task panicked");

    let response = result.expect("POST request should succeed");
    let echoed: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(echoed["method"], "POST");
    assert_eq!(echoed["headers"]["x-api-key"], "secret");
    assert_eq!(echoed["body"], r#"{"query":"{ me }"}"#);

    mock.shutdown().await;
}

#[tokio::test]
async fn test_fetch_error_status_is_not_ok() {
    let mock = MockServer::start()
        .await
        .expect("Failed to start mock server");
    let url = mock.url("/status/404");

    let response = tokio::task::spawn_blocking(move || {
        let client = HttpClient::new(&test_fetch_config()).expect("Failed to create client");
        client.fetch(&url, FetchOptions::default(), None)
    })
    .await
    .expect("Task panicked")
    .expect("A 404 is still a response");

    assert_eq!(response.status, 404);
    assert!(!response.ok);
    assert_eq!(response.status_text, "Not Found");

    mock.shutdown().await;
}

#[tokio::test]
async fn test_fetch_timeout_is_capped_by_budget() {
    let mock = MockServer::start()
        .await
        .expect("Failed to start mock server");
    let url = mock.url("/slow");

    let result = tokio::task::spawn_blocking(move || {
        let client = HttpClient::new(&test_fetch_config()).expect("Failed to create client");
        client.fetch(&url, FetchOptions::default(), Some(Duration::from_millis(200)))
    })
    .await
    .expect("Task panicked");

    assert!(matches!(result, Err(HttpError::RequestFailed(_))));
    mock.shutdown().await;
}

#[tokio::test]
async fn test_private_hosts_blocked_by_default() {
    let result = tokio::task::spawn_blocking(|| {
        let client = HttpClient::new(&FetchConfig::default()).expect("Failed to create client");
        client.fetch("http://127.0.0.1:1/token", FetchOptions::default(), None)
    })
    .await
    .expect("Task panicked");

    assert!(matches!(result, Err(HttpError::BlockedUrl(_))));
}

#[tokio::test]
async fn test_script_fetch_stores_token() {
    let mock = MockServer::start()
        .await
        .expect("Failed to start mock server");
    let source = format!(
        r#"
        const response = await fetch('{}');
        const body = await response.json();
        console.log(Object.prototype.toString.call(response), response.status);
        lab.environment.set('token', body.token);
        lab.environment.set('requestId', response.headers.get('X-Request-Id'));
        "#,
        mock.url("/token?user=bob")
    );

    let report = SandboxRuntime::new(&AppConfig::test_config())
        .execute(
            &source,
            EnvironmentStore::new(Environment::new()),
            RequestContext::default(),
            None,
        )
        .await
        .expect("run");

    assert!(report.is_success(), "unexpected error: {:?}", report.error);
    assert_eq!(report.logs[0].text, "[object Response] 200");
    assert_eq!(
        report.environment_after.get().to_json(),
        json!({"token": "token-for-bob", "requestId": "req-42"})
    );

    mock.shutdown().await;
}

#[tokio::test]
async fn test_script_fetch_failure_is_catchable() {
    let mut config = AppConfig::test_config();
    config.fetch.allow_private_network = false;
    let source = r#"
        try {
            await fetch('http://localhost/token');
        } catch (e) {
            console.error(e.name);
        }
    "#;

    let report = SandboxRuntime::new(&config)
        .execute(
            source,
            EnvironmentStore::default(),
            RequestContext::default(),
            None,
        )
        .await
        .expect("run");

    assert!(report.is_success());
    assert_eq!(report.logs[0].to_string(), "Error: TypeError");
}
