//! # 路由装配
//!
//! 管理端与公共 API 同时挂在 `/api/v1/*` 与 `/v1/*` 两个前缀下；
//! 上游兼容接口挂在 `/{provider}/v1/*`，统一经过并发限流。

pub mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderValue, Method, header},
    middleware::from_fn,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use serde_json::json;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::app::AppContext;
use crate::auth::{admin_auth, login_handler, logout_handler, public_auth, public_stream_auth};
use crate::config::ServerConfig;
use crate::handler::admin::{accounts, cache, jobs, keys, models as admin_models, settings, system};
use crate::handler::{HandlerState, chat, count_tokens, files, images, imagine, models, REQUEST_ID_HEADER};
use crate::limiter::concurrency_middleware;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;

pub use middleware::{RequestId, metrics_middleware, request_id_middleware};

/// 管理端与公共 API 的两套前缀
pub const API_PREFIXES: [&str; 2] = ["/api/v1", "/v1"];

/// 组装完整路由
pub fn create_router(ctx: Arc<AppContext>, server: &ServerConfig) -> Router {
    let mut app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/models", get(models::list_models))
        .route("/v1/files/{media}/{name}", get(files::serve_file))
        .merge(provider_routes(&ctx));

    for prefix in API_PREFIXES {
        app = app
            .nest(&format!("{prefix}/admin"), admin_routes(&ctx))
            .nest(&format!("{prefix}/public"), public_routes(&ctx));
    }

    let session_routes = Router::new()
        .route("/api/login", post(login_handler))
        .route("/api/logout", post(logout_handler))
        .with_state(Arc::clone(&ctx.auth));

    app.merge(session_routes)
        .layer(from_fn_with_state(Arc::clone(&ctx.metrics), metrics_middleware))
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(from_fn(request_id_middleware))
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(&server.cors_origins)),
        )
        .with_state(ctx)
}

/// 上游兼容接口
fn provider_routes(ctx: &Arc<AppContext>) -> Router<HandlerState> {
    Router::new()
        .route("/{provider}/v1/chat/completions", post(chat::chat_completions))
        .route("/{provider}/v1/messages", post(chat::messages))
        .route("/{provider}/v1/messages/count_tokens", post(count_tokens::count_tokens))
        .route("/{provider}/v1/images/generations", post(images::generations))
        .route("/{provider}/v1/images/edits", post(images::edits))
        .route("/{provider}/v1/models", get(models::list_provider_models))
        .route_layer(from_fn_with_state(Arc::clone(&ctx.limiter), concurrency_middleware))
}

/// 管理端路由，全部需要管理员认证
fn admin_routes(ctx: &Arc<AppContext>) -> Router<HandlerState> {
    Router::new()
        .route("/verify", get(system::verify))
        .route("/accounts", get(accounts::list).post(accounts::create))
        .route("/accounts/export", get(accounts::export))
        .route("/accounts/import", post(accounts::import))
        .route(
            "/accounts/{id}",
            get(accounts::get).put(accounts::update).delete(accounts::delete),
        )
        .route("/accounts/{id}/reset", post(accounts::reset_status))
        .route("/keys", get(keys::list).post(keys::create))
        .route("/keys/{id}", put(keys::toggle).delete(keys::delete))
        .route("/models", get(admin_models::list).post(admin_models::create))
        .route(
            "/models/{id}",
            put(admin_models::update).delete(admin_models::delete),
        )
        .route("/models/{id}/default", post(admin_models::set_default))
        .route("/config", get(settings::get_config).patch(settings::patch_config))
        .route("/cache", get(cache::stats))
        .route("/cache/clear", post(cache::clear))
        .route("/cache/online/clear/async", post(jobs::clear_online))
        .route("/cache/{media}/{name}", delete(cache::delete_item))
        .route("/tokens/refresh/async", post(jobs::refresh_tokens))
        .route("/tokens/nsfw/enable/async", post(jobs::enable_nsfw))
        .route("/batch/{task_id}", get(jobs::snapshot))
        .route("/batch/{task_id}/stream", get(jobs::stream))
        .route("/batch/{task_id}/cancel", post(jobs::cancel))
        .route("/audit", get(system::audit))
        .route("/breakers", get(system::breakers))
        .route("/status", get(system::status))
        .route("/imagine/start", post(imagine::start))
        .route("/imagine/stop", post(imagine::stop))
        .route("/imagine/sse", get(imagine::sse))
        .route("/imagine/ws", get(imagine::ws))
        .route_layer(from_fn_with_state(Arc::clone(&ctx.auth), admin_auth))
}

/// 公共 API：`public_key` 鉴权；流式端点另接受 `task_id` 授权
fn public_routes(ctx: &Arc<AppContext>) -> Router<HandlerState> {
    let keyed = Router::new()
        .route("/verify", get(system::verify))
        .route("/imagine/start", post(imagine::start))
        .route("/imagine/stop", post(imagine::stop))
        .route_layer(from_fn_with_state(Arc::clone(&ctx.auth), public_auth));
    let streams = Router::new()
        .route("/imagine/sse", get(imagine::sse))
        .route("/imagine/ws", get(imagine::ws))
        .route_layer(from_fn_with_state(Arc::clone(&ctx.auth), public_stream_auth));
    Router::new()
        .route("/imagine/config", get(imagine::public_config))
        .merge(keyed)
        .merge(streams)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::PATCH,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::ACCEPT,
            header::ORIGIN,
            header::HeaderName::from_static(REQUEST_ID_HEADER),
            header::HeaderName::from_static("x-admin-token"),
        ])
        .expose_headers([header::HeaderName::from_static(REQUEST_ID_HEADER)]);

    if origins.is_empty() || origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }
    let parsed: std::result::Result<Vec<HeaderValue>, _> =
        origins.iter().map(|o| o.parse::<HeaderValue>()).collect();
    match parsed {
        Ok(list) => layer.allow_origin(list),
        Err(e) => {
            lwarn!(
                "system",
                LogStage::Startup,
                LogComponent::Router,
                "cors_config",
                "CORS 来源配置无效，退回允许全部",
                error = %e
            );
            layer.allow_origin(Any)
        }
    }
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// `GET /metrics`（Prometheus 文本格式）
pub async fn metrics(State(ctx): State<HandlerState>) -> Response {
    let body = ctx.metrics.render(ctx.gauges().await);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
        .into_response()
}
