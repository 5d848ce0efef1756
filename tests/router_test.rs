//! # 路由冒烟测试
//!
//! 全内存上下文，覆盖双前缀、管理端鉴权、公共 API 鉴权与基础接口。

use std::sync::Arc;

use ai_relay::app::{AppContext, default_providers};
use ai_relay::config::AppConfig;
use ai_relay::provider::SessionRegistry;
use ai_relay::router::create_router;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tower::ServiceExt;

const ADMIN_TOKEN: &str = "admin-token-for-tests-0001";
const PUBLIC_KEY: &str = "pk-test";

fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.auth.admin_token = ADMIN_TOKEN.to_string();
    config.auth.admin_pass = "a-long-enough-admin-password".to_string();
    config.auth.public_key = PUBLIC_KEY.to_string();
    config.server.data_dir = tempfile::tempdir()
        .unwrap()
        .keep()
        .to_string_lossy()
        .into_owned();
    config
}

fn app() -> (Router, Arc<AppContext>) {
    let config = test_config();
    let providers = default_providers(&config, &Arc::new(SessionRegistry::new())).unwrap();
    let ctx = Arc::new(AppContext::in_memory(config.clone(), providers));
    (create_router(Arc::clone(&ctx), &config.server), ctx)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

fn admin_get(path: &str) -> Request<Body> {
    Request::get(path)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

fn admin_json(method: &str, path: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_and_request_id() {
    let (app, _) = app();
    let response = app
        .clone()
        .oneshot(
            Request::get("/health")
                .header("x-request-id", "rid-smoke")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-request-id"], "rid-smoke");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(serde_json::from_slice::<Value>(&bytes).unwrap(), json!({"status": "ok"}));
}

#[tokio::test]
async fn test_admin_requires_auth_on_both_prefixes() {
    let (app, _) = app();
    for prefix in ["/api/v1/admin", "/v1/admin"] {
        let (status, _) = send(
            &app,
            Request::get(format!("{prefix}/verify")).body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, body) = send(&app, admin_get(&format!("{prefix}/verify"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
    }

    // X-Admin-Token 与 app_key 查询参数同样有效
    let (status, _) = send(
        &app,
        Request::get("/v1/admin/verify")
            .header("x-admin-token", ADMIN_TOKEN)
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(
        &app,
        Request::get(format!("/v1/admin/verify?app_key={ADMIN_TOKEN}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_account_crud_through_admin_api() {
    let (app, _) = app();
    let (status, created) = send(
        &app,
        admin_json(
            "POST",
            "/api/v1/admin/accounts",
            &json!({"name": "g1", "account_type": "grok", "client_cookie": "sso=abc", "weight": 3}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(created["success"], true);
    let id = created["data"]["id"].as_i64().unwrap();
    assert!(id > 0);

    let (_, patched) = send(
        &app,
        admin_json("PUT", &format!("/v1/admin/accounts/{id}"), &json!({"name": "g1-renamed"})),
    )
    .await;
    assert_eq!(patched["data"]["name"], "g1-renamed");
    assert_eq!(patched["data"]["weight"], 3);

    let (_, listed) = send(&app, admin_get("/v1/admin/accounts")).await;
    assert_eq!(listed["data"].as_array().unwrap().len(), 1);

    let (status, _) = send(
        &app,
        admin_json("DELETE", &format!("/v1/admin/accounts/{id}"), &json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, body) = send(&app, admin_get(&format!("/v1/admin/accounts/{id}"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_account_without_credential_is_rejected() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        admin_json("POST", "/v1/admin/accounts", &json!({"name": "empty", "account_type": "warp"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "invalid_request_error");
}

#[tokio::test]
async fn test_api_key_plaintext_returned_once() {
    let (app, _) = app();
    let (_, created) = send(&app, admin_json("POST", "/v1/admin/keys", &json!({"name": "ci"}))).await;
    let plaintext = created["data"]["plaintext"].as_str().unwrap();
    assert!(plaintext.starts_with("sk-"));
    assert!(created["data"]["key"].get("key_hash").is_none());

    let (_, listed) = send(&app, admin_get("/v1/admin/keys")).await;
    let keys = listed["data"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].get("plaintext").is_none());
    assert!(keys[0].get("key_hash").is_none());
}

#[tokio::test]
async fn test_public_api_key() {
    let (app, _) = app();
    let (status, _) = send(&app, Request::get("/v1/public/verify").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(
        &app,
        Request::get("/api/v1/public/verify")
            .header(header::AUTHORIZATION, format!("Bearer {PUBLIC_KEY}"))
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");

    // 配置接口无需鉴权
    let (status, body) = send(
        &app,
        Request::get("/v1/public/imagine/config").body(Body::empty()).unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["final_min_bytes"].is_u64());
}

#[tokio::test]
async fn test_public_api_accepts_issued_key() {
    let (app, _) = app();
    let (_, created) = send(&app, admin_json("POST", "/v1/admin/keys", &json!({"name": "ci"}))).await;
    let plaintext = created["data"]["plaintext"].as_str().unwrap().to_string();
    let id = created["data"]["key"]["id"].as_i64().unwrap();

    let verify = |token: &str| {
        Request::get("/v1/public/verify")
            .header(header::AUTHORIZATION, format!("Bearer {token}"))
            .body(Body::empty())
            .unwrap()
    };
    let (status, _) = send(&app, verify(&plaintext)).await;
    assert_eq!(status, StatusCode::OK);

    let (_, listed) = send(&app, admin_get("/v1/admin/keys")).await;
    assert!(listed["data"][0]["last_used_at"].is_string());

    let (status, _) = send(&app, verify("sk-not-issued")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // 停用后立即失效
    let (status, _) = send(
        &app,
        admin_json("PUT", &format!("/v1/admin/keys/{id}"), &json!({"enabled": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = send(&app, verify(&plaintext)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_models_listing() {
    let (app, ctx) = app();
    ctx.store.seed_default_models().await.unwrap();

    let (status, body) = send(&app, Request::get("/v1/models").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["object"], "list");
    assert!(!body["data"].as_array().unwrap().is_empty());

    let (status, body) = send(&app, Request::get("/grok/v1/models").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().iter().all(|m| m["owned_by"].as_str().unwrap().eq_ignore_ascii_case("grok")));

    let (status, _) = send(&app, Request::get("/nope/v1/models").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_provider_and_task() {
    let (app, _) = app();
    let (status, _) = send(
        &app,
        Request::post("/nope/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"model":"x","messages":[{"role":"user","content":"hi"}]}"#))
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, admin_get("/v1/admin/batch/does-not-exist/stream")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_refresh_job_without_accounts_is_rejected() {
    let (app, _) = app();
    let (status, body) = send(
        &app,
        admin_json("POST", "/v1/admin/tokens/refresh/async", &json!({"concurrency": 3})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["message"], "no matching accounts");
}

#[tokio::test]
async fn test_config_patch_is_redacted_and_persisted() {
    let (app, ctx) = app();
    let (status, body) = send(
        &app,
        admin_json("PATCH", "/v1/admin/config", &json!({"batch": {"default_concurrency": 7}})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["batch"]["default_concurrency"], 7);
    assert_ne!(body["data"]["auth"]["admin_token"], ADMIN_TOKEN);

    let saved = ctx.store.get_setting("config").await.unwrap().unwrap();
    let saved: AppConfig = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved.batch.default_concurrency, 7);
    assert_eq!(saved.auth.admin_token, ADMIN_TOKEN);
}

#[tokio::test]
async fn test_metrics_counts_matched_routes() {
    let (app, _) = app();
    send(&app, Request::get("/health").body(Body::empty()).unwrap()).await;
    let response = app
        .clone()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let text = String::from_utf8(
        to_bytes(response.into_body(), usize::MAX).await.unwrap().to_vec(),
    )
    .unwrap();
    assert!(text.contains(r#"relay_requests_total{route="/health",status="200"} 1"#));
}
