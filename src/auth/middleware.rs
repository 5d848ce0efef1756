//! # 认证中间件
//!
//! 管理端：会话 cookie、`Authorization`（Bearer 或裸值）、`X-Admin-Token`、
//! `app_key`/`public_key` 查询参数、Basic 认证任一通过即可。
//! 公共 API：配置了 `public_key` 时要求 Bearer 等于它或是启用中的 API Key，空值表示不鉴权。
//! 所有比较都是常量时间。

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::json;

use super::AuthGate;
use super::session::SESSION_COOKIE;
use crate::config::AuthConfig;
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::utils::{constant_time_eq, matches_any};

/// 提取 `Authorization: Bearer <token>`
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then_some(token)
}

/// 读取指定 cookie
#[must_use]
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(k, _)| *k == name)
        .map(|(_, v)| v.trim())
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

/// 不看会话 cookie 的管理员凭据检查
#[must_use]
pub fn has_admin_credentials(auth: &AuthConfig, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
    let secrets = [auth.admin_token.trim(), auth.admin_pass.trim()];
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim();
    let bearer = authorization.strip_prefix("Bearer ").map_or("", str::trim);
    let x_admin = headers
        .get("x-admin-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .trim();
    let app_key = query.get("app_key").map_or("", |v| v.trim());
    let public_key = query.get("public_key").map_or("", |v| v.trim());

    let mut ok = false;
    for candidate in [bearer, authorization, x_admin, app_key, public_key] {
        ok |= matches_any(candidate, &secrets);
    }
    if let Some((user, pass)) = basic_credentials(headers) {
        let admin_pass = auth.admin_pass.trim();
        let user_ok = auth.admin_user.trim().is_empty() || constant_time_eq(&user, auth.admin_user.trim());
        ok |= !admin_pass.is_empty() && user_ok && constant_time_eq(&pass, admin_pass);
    }
    ok
}

fn unauthorized_bearer(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, "Bearer")],
        Json(json!({ "detail": message })),
    )
        .into_response()
}

/// 管理端认证
pub async fn admin_auth(
    State(gate): State<Arc<AuthGate>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(token) = cookie_value(request.headers(), SESSION_COOKIE) {
        if gate.sessions().contains(token) {
            return next.run(request).await;
        }
    }
    let auth = gate.auth_config().await;
    if has_admin_credentials(&auth, request.headers(), &query) {
        return next.run(request).await;
    }
    lwarn!(
        "system",
        LogStage::Authentication,
        LogComponent::Auth,
        "admin_auth",
        "管理端认证失败",
        path = %request.uri().path()
    );
    unauthorized_bearer("Unauthorized")
}

/// 公共 API 认证
pub async fn public_auth(State(gate): State<Arc<AuthGate>>, request: Request, next: Next) -> Response {
    let auth = gate.auth_config().await;
    let key = auth.public_key.trim();
    if key.is_empty() {
        return next.run(request).await;
    }
    match bearer_token(request.headers()) {
        None => unauthorized_bearer("Missing authentication token"),
        Some(token) if gate.accepts_public_token(key, token).await => next.run(request).await,
        Some(_) => unauthorized_bearer("Invalid authentication token"),
    }
}

/// 流式端点认证
///
/// 携带有效 `task_id` 授权的请求直接放行；否则要求 `public_key` 查询参数或 Bearer。
pub async fn public_stream_auth(
    State(gate): State<Arc<AuthGate>>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(task_id) = query.get("task_id") {
        if gate.grants().contains(task_id) {
            return next.run(request).await;
        }
    }
    let auth = gate.auth_config().await;
    let key = auth.public_key.trim();
    if key.is_empty() {
        return next.run(request).await;
    }
    let query_key = query.get("public_key").map_or("", |v| v.trim());
    if query_key.is_empty() {
        return match bearer_token(request.headers()) {
            Some(token) if gate.accepts_public_token(key, token).await => next.run(request).await,
            _ => unauthorized_bearer("Missing authentication token"),
        };
    }
    if gate.accepts_public_token(key, query_key).await {
        next.run(request).await
    } else {
        unauthorized_bearer("Invalid authentication token")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    fn auth() -> AuthConfig {
        AuthConfig {
            admin_user: "admin".into(),
            admin_pass: "p".repeat(16),
            admin_token: "tok-123".into(),
            ..AuthConfig::default()
        }
    }

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.append(*k, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[rstest]
    #[case(&[("authorization", "Bearer tok-123")], true)]
    #[case(&[("authorization", "tok-123")], true)]
    #[case(&[("authorization", "Bearer pppppppppppppppp")], true)]
    #[case(&[("x-admin-token", "tok-123")], true)]
    #[case(&[("authorization", "Bearer wrong")], false)]
    #[case(&[], false)]
    fn test_admin_headers(#[case] pairs: &[(&'static str, &str)], #[case] expected: bool) {
        assert_eq!(has_admin_credentials(&auth(), &headers(pairs), &HashMap::new()), expected);
    }

    #[test]
    fn test_admin_query_and_basic() {
        let mut query = HashMap::new();
        query.insert("app_key".to_string(), "tok-123".to_string());
        assert!(has_admin_credentials(&auth(), &HeaderMap::new(), &query));

        let basic = format!("Basic {}", STANDARD.encode(format!("admin:{}", "p".repeat(16))));
        assert!(has_admin_credentials(&auth(), &headers(&[("authorization", basic.as_str())]), &HashMap::new()));
        let wrong = format!("Basic {}", STANDARD.encode("admin:nope"));
        assert!(!has_admin_credentials(&auth(), &headers(&[("authorization", wrong.as_str())]), &HashMap::new()));
    }

    #[test]
    fn test_empty_secrets_never_match() {
        let auth = AuthConfig {
            admin_pass: String::new(),
            admin_token: String::new(),
            ..AuthConfig::default()
        };
        assert!(!has_admin_credentials(&auth, &headers(&[("authorization", "Bearer ")]), &HashMap::new()));
        assert!(!has_admin_credentials(&auth, &headers(&[("x-admin-token", "")]), &HashMap::new()));
    }

    #[test]
    fn test_cookie_and_bearer_parsing() {
        let map = headers(&[("cookie", "a=1; session_token=abc ; b=2"), ("authorization", "Bearer  k ")]);
        assert_eq!(cookie_value(&map, SESSION_COOKIE), Some("abc"));
        assert_eq!(cookie_value(&map, "missing"), None);
        assert_eq!(bearer_token(&map), Some("k"));
    }
}
