//! End-to-end behaviour of a running gateway.

use reqwest::StatusCode;
use serde_json::Value;

use resilient_gateway::config::TokenConfig;

mod common;

#[tokio::test]
async fn test_forwarded_headers() {
    let backend = common::start_programmable_backend(|head| async move { (200, head) }).await;

    let mut config = common::gateway_config(backend);
    config.auth.tokens.push(TokenConfig {
        token: "t-42".into(),
        user_id: "42".into(),
        email: Some("a@example.com".into()),
        role: "user".into(),
    });
    let gateway = common::start_gateway(config).await;

    let res = common::client()
        .get(format!("http://{}/api/items/7?full=1", gateway.local_addr()))
        .header("authorization", "Bearer t-42")
        .header("x-user-role", "admin")
        .header("x-request-id", "req-abc")
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["x-request-id"], "req-abc");
    let head = res.text().await.unwrap().to_ascii_lowercase();
    assert!(head.starts_with("get /api/items/7?full=1 "));
    assert!(head.contains("x-forwarded-for: 127.0.0.1"));
    assert!(head.contains("x-request-id: req-abc"));
    assert!(head.contains("x-user-id: 42"));
    assert!(head.contains("x-user-role: user"));
    assert!(!head.contains("x-user-role: admin"));

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_unknown_route() {
    let backend = common::start_mock_backend("ok").await;
    let gateway = common::start_gateway(common::gateway_config(backend)).await;

    let res = common::client()
        .get(format!("http://{}/api/unknown", gateway.local_addr()))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert!(res.headers().contains_key("x-request-id"));
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "ROUTE_NOT_FOUND");

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_admin_api() {
    let backend = common::start_mock_backend("ok").await;
    let mut config = common::gateway_config(backend);
    config.admin.enabled = true;
    config.admin.api_key = "secret".into();
    let gateway = common::start_gateway(config).await;
    let admin = gateway.admin_addr().expect("admin listener bound");
    let client = common::client();

    let res = client
        .get(format!("http://{}/admin/status", admin))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let status: Value = client
        .get(format!("http://{}/admin/status", admin))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["status"], "operational");
    assert_eq!(status["upstreams"], 1);
    assert_eq!(status["rate_limit_backend"], "memory");

    let res = client
        .get(format!("http://{}/admin/breakers/items", admin))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .delete(format!("http://{}/admin/rate-limits/general/127.0.0.1", admin))
        .bearer_auth("secret")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NO_CONTENT);

    gateway.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_releases_listener() {
    let backend = common::start_mock_backend("ok").await;
    let gateway = common::start_gateway(common::gateway_config(backend)).await;
    let addr = gateway.local_addr();

    gateway.stop().await.unwrap();

    let result = common::client()
        .get(format!("http://{}/api/items", addr))
        .send()
        .await;
    assert!(result.is_err());
}
