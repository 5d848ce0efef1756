//! The unified error handling system for the application.

use std::fmt::Display;

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::json;

pub use types::ProxyError;

/// A unified `Result` type for the entire application.
pub type Result<T> = std::result::Result<T, ProxyError>;

pub mod classify;
pub mod types;

/// Context trait for adding context to errors.
pub trait Context<T, E> {
    #[track_caller]
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display;

    #[track_caller]
    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display;
}

impl<T, E> Context<T, E> for std::result::Result<T, E>
where
    E: Into<ProxyError>,
{
    fn context<C>(self, context: C) -> Result<T>
    where
        C: Display,
    {
        self.with_context(|| context)
    }

    fn with_context<C, F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> C,
        C: Display,
    {
        match self {
            Ok(value) => Ok(value),
            Err(error) => Err(ProxyError::Context {
                context: context().to_string(),
                source: Box::new(error.into()),
            }),
        }
    }
}

/// Error category for alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Caused by the caller (4xx).
    Client,
    /// Caused by us or an upstream (5xx).
    Server,
}

impl ProxyError {
    /// Category derived from the HTTP status.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        if self.to_http_response_parts().0.is_client_error() {
            ErrorCategory::Client
        } else {
            ErrorCategory::Server
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.to_http_response_parts();
        let message = self.public_message();

        if status.is_server_error() {
            tracing::error!(error = %self, status = status.as_u16(), "请求处理失败");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "请求被拒绝");
        }

        if matches!(self.root(), Self::Cancelled { .. }) {
            return StatusCode::from_u16(499)
                .unwrap_or(StatusCode::BAD_REQUEST)
                .into_response();
        }

        if status == StatusCode::UNAUTHORIZED {
            let mut response = (status, Json(json!({ "detail": message }))).into_response();
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
            return response;
        }

        let body = json!({
            "type": "error",
            "error": {
                "type": error_type,
                "message": message,
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn test_context_wraps_and_keeps_status() {
        let err: Result<()> = Err(ProxyError::not_found("account 7")).context("加载账号");
        let err = err.unwrap_err();
        assert_eq!(err.to_http_response_parts().0, StatusCode::NOT_FOUND);
        assert!(err.to_string().starts_with("加载账号"));
        assert!(matches!(err.root(), ProxyError::NotFound { .. }));
    }

    #[test]
    fn test_categories() {
        assert_eq!(ProxyError::validation("x").category(), ErrorCategory::Client);
        assert_eq!(ProxyError::internal("x").category(), ErrorCategory::Server);
        assert_eq!(
            ProxyError::no_available_account("x").category(),
            ErrorCategory::Server
        );
    }

    #[tokio::test]
    async fn test_auth_error_sets_www_authenticate() {
        let response = ProxyError::auth("Missing authentication token").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["detail"], "Missing authentication token");
    }

    #[tokio::test]
    async fn test_internal_error_hides_details() {
        let response = ProxyError::internal("lock poisoned at slot 3").into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["error"]["message"], "internal server error");
    }

    #[tokio::test]
    async fn test_no_available_account_is_503() {
        let response = ProxyError::no_available_account("channel warp").into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), 1024).await.unwrap();
        let value: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["error"]["message"], "no available token");
        assert_eq!(value["error"]["type"], "overloaded_error");
    }
}
