//! `测试：limiter` 在路由上的排队拒绝与全局超时

use std::sync::Arc;
use std::time::{Duration, Instant};

use ai_relay::config::LimiterConfig;
use ai_relay::limiter::{ConcurrencyLimiter, concurrency_middleware};
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use axum::middleware::from_fn_with_state;
use axum::routing::get;
use futures::{StreamExt, stream};
use serde_json::Value;
use tower::ServiceExt;

fn blocked_app(limiter: &Arc<ConcurrencyLimiter>) -> Router {
    Router::new()
        .route(
            "/slow",
            get(|| async {
                std::future::pending::<()>().await;
                "unreachable"
            }),
        )
        .route_layer(from_fn_with_state(Arc::clone(limiter), concurrency_middleware))
}

fn request() -> Request<Body> {
    Request::get("/slow").body(Body::empty()).unwrap()
}

#[tokio::test]
async fn second_request_rejected_while_first_holds_slot() {
    let limiter = Arc::new(ConcurrencyLimiter::new(&LimiterConfig {
        max_concurrent: 1,
        timeout_ms: 200,
        wait_timeout_ms: 20,
        adaptive: false,
    }));
    let app = blocked_app(&limiter);

    let first = tokio::spawn(app.clone().oneshot(request()));
    let deadline = Instant::now() + Duration::from_secs(2);
    while limiter.stats().active < 1 {
        assert!(Instant::now() < deadline, "first request never took the slot");
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let started = Instant::now();
    let second = app.clone().oneshot(request()).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(elapsed < Duration::from_millis(150), "rejected after {elapsed:?}");

    let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["error"]["type"], "overloaded_error");

    // 第一个请求被全局超时截断
    let first = first.await.unwrap().unwrap();
    assert_eq!(first.status(), StatusCode::BAD_GATEWAY);

    let stats = limiter.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.total, 1);
}

#[tokio::test]
async fn slot_released_after_timeout() {
    let limiter = Arc::new(ConcurrencyLimiter::new(&LimiterConfig {
        max_concurrent: 1,
        timeout_ms: 50,
        wait_timeout_ms: 20,
        adaptive: false,
    }));
    let app = blocked_app(&limiter);

    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::BAD_GATEWAY);

    // 槽位已归还，下一个请求能进入并同样超时
    let again = app.oneshot(request()).await.unwrap();
    assert_eq!(again.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(limiter.stats().rejected, 0);
    assert_eq!(limiter.stats().total, 2);
}

fn streaming_app(limiter: &Arc<ConcurrencyLimiter>) -> Router {
    Router::new()
        .route(
            "/slow",
            get(|| async {
                let chunks = stream::once(async { Ok::<_, std::io::Error>("data: hello\n\n") })
                    .chain(stream::pending());
                Body::from_stream(chunks)
            }),
        )
        .route_layer(from_fn_with_state(Arc::clone(limiter), concurrency_middleware))
}

#[tokio::test]
async fn streaming_body_holds_slot_until_global_timeout() {
    let limiter = Arc::new(ConcurrencyLimiter::new(&LimiterConfig {
        max_concurrent: 1,
        timeout_ms: 300,
        wait_timeout_ms: 20,
        adaptive: false,
    }));
    let app = streaming_app(&limiter);

    let started = Instant::now();
    let first = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    // 响应头已返回，流未结束时槽位仍被占用
    assert_eq!(limiter.stats().active, 1);

    let second = app.clone().oneshot(request()).await.unwrap();
    assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);

    // 上游永不结束，响应体在全局超时处被截断
    let body = tokio::time::timeout(Duration::from_secs(2), to_bytes(first.into_body(), usize::MAX))
        .await
        .expect("stream should end at the global timeout")
        .unwrap();
    assert_eq!(&body[..], b"data: hello\n\n");
    assert!(started.elapsed() >= Duration::from_millis(250));

    let stats = limiter.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.total, 1);
    assert_eq!(stats.rejected, 1);

    let third = app.oneshot(request()).await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
    assert_eq!(limiter.stats().active, 1);
    drop(third);
    assert_eq!(limiter.stats().active, 0);
}
