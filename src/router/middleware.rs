//! # 路由级中间件
//!
//! 请求 ID 与请求计数。

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::Next,
    response::Response,
};

use crate::app::Metrics;
use crate::handler::REQUEST_ID_HEADER;

/// 请求 ID 最长保留的字符数
const MAX_REQUEST_ID_LEN: usize = 128;

/// 请求 ID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// 沿用客户端给出的 ID；空值、过长或含控制字符时重新生成
    #[must_use]
    pub fn from_header(value: Option<&HeaderValue>) -> Self {
        value
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty() && v.len() <= MAX_REQUEST_ID_LEN)
            .filter(|v| v.chars().all(|c| c.is_ascii_graphic()))
            .map_or_else(Self::new, |v| Self(v.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl Deref for RequestId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// 写入请求头与扩展，并回写到响应头
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = RequestId::from_header(request.headers().get(REQUEST_ID_HEADER));
    let value = HeaderValue::from_str(&request_id).ok();
    if let Some(value) = &value {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Some(value) = value {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// 按匹配到的路由模板计数，避免路径参数撑爆标签
pub async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    request: Request,
    next: Next,
) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| "unmatched".to_string(), |p| p.as_str().to_string());
    let response = next.run(request).await;
    metrics.record_request(&route, response.status().as_u16());
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_from_header() {
        let given = HeaderValue::from_static("abc-123");
        assert_eq!(RequestId::from_header(Some(&given)).as_str(), "abc-123");

        let blank = HeaderValue::from_static("   ");
        assert_eq!(RequestId::from_header(Some(&blank)).len(), 36);

        let long = HeaderValue::from_str(&"x".repeat(200)).unwrap();
        assert_eq!(RequestId::from_header(Some(&long)).len(), 36);

        assert_eq!(RequestId::from_header(None).len(), 36);
    }
}
