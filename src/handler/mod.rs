//! # HTTP 处理器
//!
//! 下游兼容接口（OpenAI / Anthropic）、图片与文件、管理端与公共 API。

pub mod admin;
pub mod chat;
pub mod count_tokens;
pub mod dispatch;
pub mod files;
pub mod images;
pub mod imagine;
pub mod models;
pub mod request;
pub mod transcode;

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::app::AppContext;

/// 处理器共享状态
pub type HandlerState = Arc<AppContext>;

/// 请求 ID 头
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map_or("", str::trim)
}

/// 中间件写入的请求 ID；缺失时现场生成
#[must_use]
pub fn request_id(headers: &HeaderMap) -> String {
    let id = header_str(headers, REQUEST_ID_HEADER);
    if id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        id.to_string()
    }
}

/// 客户端地址：`X-Forwarded-For` 第一段，其次 `X-Real-IP`
#[must_use]
pub fn client_ip(headers: &HeaderMap) -> String {
    let forwarded = header_str(headers, "x-forwarded-for");
    if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
        return first.to_string();
    }
    header_str(headers, "x-real-ip").to_string()
}

#[must_use]
pub fn user_agent(headers: &HeaderMap) -> String {
    header_str(headers, "user-agent").to_string()
}
