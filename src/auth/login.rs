//! 管理员登录与登出

use std::sync::Arc;

use axum::{
    Json,
    extract::State,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use super::AuthGate;
use super::middleware::cookie_value;
use super::session::SESSION_COOKIE;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::utils::constant_time_eq;
use crate::{linfo, lwarn};

/// 登录请求体
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn session_cookie(token: &str, max_age_secs: u64) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_secs}"
    ))
    .map_err(|e| ProxyError::internal(format!("invalid cookie: {e}")))
}

/// `POST /api/login`
pub async fn login_handler(State(gate): State<Arc<AuthGate>>, Json(body): Json<LoginRequest>) -> Result<Response> {
    let auth = gate.auth_config().await;
    let pass = auth.admin_pass.trim();
    let user_ok = constant_time_eq(body.username.trim(), auth.admin_user.trim());
    let pass_ok = !pass.is_empty() && constant_time_eq(body.password.trim(), pass);
    if !(user_ok && pass_ok) {
        lwarn!(
            "system",
            LogStage::Authentication,
            LogComponent::Auth,
            "login",
            "管理员登录失败",
            username = %body.username
        );
        return Err(ProxyError::auth("invalid username or password"));
    }
    let token = gate.sessions().issue();
    let cookie = session_cookie(&token, gate.session_ttl().as_secs())?;
    linfo!(
        "system",
        LogStage::Authentication,
        LogComponent::Auth,
        "login",
        "管理员登录成功"
    );
    let mut response = Json(json!({"status": "success", "token": token})).into_response();
    response.headers_mut().insert(header::SET_COOKIE, cookie);
    Ok(response)
}

/// `POST /api/logout`
pub async fn logout_handler(State(gate): State<Arc<AuthGate>>, headers: HeaderMap) -> Result<Response> {
    if let Some(token) = cookie_value(&headers, SESSION_COOKIE) {
        gate.sessions().revoke(token);
    }
    let mut response = (StatusCode::OK, Json(json!({"status": "success"}))).into_response();
    response
        .headers_mut()
        .insert(header::SET_COOKIE, session_cookie("", 0)?);
    Ok(response)
}
