// Integration tests for /api/credentials

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use jwt_refresher::api::{create_router, ApiState};
use jwt_refresher::credentials::CredentialStore;
use jwt_refresher::refresher::RefreshEngine;
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

const USERNAME: &str = "admin";
const PASSWORD: &str = "secret";

fn create_test_app() -> (Router, Arc<CredentialStore>) {
    let key = BASE64.encode([0u8; 32]);
    let store = Arc::new(CredentialStore::new(":memory:", &key).unwrap());
    let state = ApiState {
        store: Arc::clone(&store),
        engine: Arc::new(RefreshEngine::new(Arc::clone(&store))),
        username: USERNAME.to_string(),
        password: PASSWORD.to_string(),
    };
    (create_router(state), store)
}

fn basic(username: &str, password: &str) -> String {
    format!("Basic {}", BASE64.encode(format!("{}:{}", username, password)))
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", basic(USERNAME, PASSWORD));
    match body {
        Some(body) => builder
            .header("Content-Type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

fn credential_body(name: &str, url: &str) -> Value {
    json!({
        "name": name,
        "refresh_url": url,
        "refresh_body_template": "{\"refresh_token\":\"{{.RefreshToken}}\"}",
        "access_token_path": "access_token",
        "refresh_token_path": "refresh_token",
        "expires_in_path": "expires_in",
        "refresh_token": "SEEDREFRESH123"
    })
}

async fn create(app: &Router, name: &str, url: &str) -> i64 {
    let (status, body) = send(
        app,
        request("POST", "/api/credentials", Some(credential_body(name, url))),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    body["id"].as_i64().unwrap()
}

/// Requests without credentials get a Basic challenge.
#[tokio::test]
async fn test_missing_auth_returns_challenge() {
    let (app, _) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/credentials")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get("www-authenticate").unwrap(),
        "Basic realm=\"JWT Refresher\""
    );
}

/// Wrong password is rejected.
#[tokio::test]
async fn test_wrong_password_returns_401() {
    let (app, _) = create_test_app();

    let response = app
        .oneshot(
            Request::builder()
                .method("GET")
                .uri("/api/credentials")
                .header("Authorization", basic(USERNAME, "wrong"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

/// POST applies defaults and never returns raw tokens.
#[tokio::test]
async fn test_create_credential_defaults() {
    let (app, _) = create_test_app();

    let (status, body) = send(
        &app,
        request(
            "POST",
            "/api/credentials",
            Some(json!({
                "name": "crm",
                "refresh_url": "https://crm.example.com/token",
                "access_token_path": "access_token",
                "refresh_token_path": "refresh_token",
                "refresh_token": "SEEDREFRESH123"
            })),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["name"], "crm");
    assert_eq!(body["refresh_method"], "POST");
    assert_eq!(body["refresh_before_seconds"], 300);
    assert_eq!(body["enabled"], true);
    assert!(body.get("current_refresh_token").is_none());
    assert!(body.get("current_access_token").is_none());
    assert!(!body.to_string().contains("SEEDREFRESH123"));
}

/// Blank required fields are a 400.
#[tokio::test]
async fn test_create_rejects_blank_url() {
    let (app, _) = create_test_app();

    let (status, body) = send(
        &app,
        request("POST", "/api/credentials", Some(credential_body("crm", ""))),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("refresh_url"));
}

/// Names are unique.
#[tokio::test]
async fn test_duplicate_name_conflicts() {
    let (app, _) = create_test_app();
    create(&app, "crm", "https://crm.example.com/token").await;

    let (status, _) = send(
        &app,
        request(
            "POST",
            "/api/credentials",
            Some(credential_body("crm", "https://other.example.com/token")),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::CONFLICT);
}

/// List, get, update, toggle and delete.
#[tokio::test]
async fn test_crud_lifecycle() {
    let (app, _) = create_test_app();
    let first = create(&app, "first", "https://a.example.com/token").await;
    let second = create(&app, "second", "https://b.example.com/token").await;

    let (status, body) = send(&app, request("GET", "/api/credentials", None)).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<i64> = body
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_i64().unwrap())
        .collect();
    assert_eq!(ids, vec![second, first]);

    let (status, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}", first), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "first");

    let mut update = credential_body("first-renamed", "https://a.example.com/v2/token");
    update["refresh_method"] = json!("put");
    update["refresh_before_seconds"] = json!(60);
    let (status, body) = send(
        &app,
        request("PUT", &format!("/api/credentials/{}", first), Some(update)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "first-renamed");
    assert_eq!(body["refresh_method"], "PUT");
    assert_eq!(body["refresh_before_seconds"], 60);

    let (status, body) = send(
        &app,
        request("POST", &format!("/api/credentials/{}/toggle", first), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["enabled"], false);

    let (status, _) = send(
        &app,
        request("DELETE", &format!("/api/credentials/{}", first), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &app,
        request("DELETE", &format!("/api/credentials/{}", first), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}", first), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("not found"));
}

/// Unknown ids 404 on every per-credential route.
#[tokio::test]
async fn test_unknown_id_returns_404() {
    let (app, _) = create_test_app();

    for (method, uri) in [
        ("GET", "/api/credentials/999"),
        ("POST", "/api/credentials/999/toggle"),
        ("POST", "/api/credentials/999/refresh"),
        ("GET", "/api/credentials/999/token"),
        ("GET", "/api/credentials/999/logs"),
    ] {
        let (status, _) = send(&app, request(method, uri, None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{} {}", method, uri);
    }

    let (status, _) = send(
        &app,
        request(
            "PUT",
            "/api/credentials/999",
            Some(credential_body("ghost", "https://x.example.com")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

/// Manual refresh updates tokens and writes a success log.
#[tokio::test]
async fn test_manual_refresh_success() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .match_body(r#"{"refresh_token":"SEEDREFRESH123"}"#)
        .with_status(200)
        .with_body(
            r#"{"access_token":"NEWTOK1234567","refresh_token":"NEWREF7654321","expires_in":3600}"#,
        )
        .create_async()
        .await;

    let (app, _) = create_test_app();
    let id = create(&app, "crm", &format!("{}/token", server.url())).await;

    let (status, body) = send(
        &app,
        request("POST", &format!("/api/credentials/{}/refresh", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["last_refresh_status"], "success");
    assert!(body["token_expires_at"].is_string());

    let (status, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}/token", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["access_token"], "NEWTOK1234567");
    assert_eq!(body["refresh_token"], "NEWREF7654321");
    assert!(body["expires_at"].is_string());
    assert!(body.get("token_expires_at").is_none());

    let (status, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}/logs", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let logs = body.as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["status"], "success");
    assert_eq!(logs[0]["new_token_preview"], "NEWTOK1234");

    mock.assert_async().await;
}

/// A failing endpoint surfaces as 502 and a failed log entry.
#[tokio::test]
async fn test_manual_refresh_failure_returns_502() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/token")
        .with_status(401)
        .with_body(r#"{"error":"invalid_grant"}"#)
        .create_async()
        .await;

    let (app, store) = create_test_app();
    let id = create(&app, "crm", &format!("{}/token", server.url())).await;

    let (status, body) = send(
        &app,
        request("POST", &format!("/api/credentials/{}/refresh", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(body["error"].as_str().unwrap().contains("401"));

    let stored = store.get(id).unwrap().unwrap();
    assert_eq!(stored.current_refresh_token, "SEEDREFRESH123");

    let (_, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}/logs", id), None),
    )
    .await;
    let logs = body.as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["status"], "failed");
    assert!(logs[0]["response_body"]
        .as_str()
        .unwrap()
        .contains("invalid_grant"));

    mock.assert_async().await;
}

/// Logs come back newest first and honour the limit.
#[tokio::test]
async fn test_logs_limit() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(500)
        .expect(3)
        .create_async()
        .await;

    let (app, _) = create_test_app();
    let id = create(&app, "crm", &format!("{}/token", server.url())).await;

    for _ in 0..3 {
        let (status, _) = send(
            &app,
            request("POST", &format!("/api/credentials/{}/refresh", id), None),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    let (_, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}/logs?limit=2", id), None),
    )
    .await;
    let logs = body.as_array().unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs[0]["id"].as_i64().unwrap() > logs[1]["id"].as_i64().unwrap());

    let (_, body) = send(
        &app,
        request("GET", &format!("/api/credentials/{}/logs?limit=abc", id), None),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 3);
}

/// Deleting a credential removes its history.
#[tokio::test]
async fn test_delete_cascades_logs() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/token")
        .with_status(500)
        .create_async()
        .await;

    let (app, store) = create_test_app();
    let id = create(&app, "crm", &format!("{}/token", server.url())).await;
    send(
        &app,
        request("POST", &format!("/api/credentials/{}/refresh", id), None),
    )
    .await;
    assert_eq!(store.list_logs(id, 50).unwrap().len(), 1);

    let (status, _) = send(
        &app,
        request("DELETE", &format!("/api/credentials/{}", id), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(store.list_logs(id, 50).unwrap().is_empty());
}
