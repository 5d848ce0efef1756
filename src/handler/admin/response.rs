//! # 管理端响应结构
//!
//! 统一的 JSON 外壳：`{success, data?, message?, timestamp}`，失败时 `{success:false, error:{code, message}}`

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, Result};

/// 标准成功响应
#[derive(Debug, Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

/// 标准错误响应
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: ErrorInfo,
    pub timestamp: DateTime<Utc>,
}

/// 管理端所有出口
#[derive(Debug)]
pub enum ApiResponse<T: Serialize> {
    Success(T),
    SuccessWithMessage(T, String),
    SuccessWithoutData(String),
    Error(StatusCode, String, String),
    AppError(ProxyError),
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        match self {
            Self::Success(data) => ok_body(Some(data), "操作成功".to_string()),
            Self::SuccessWithMessage(data, message) => ok_body(Some(data), message),
            Self::SuccessWithoutData(message) => ok_body::<()>(None, message),
            Self::Error(status, code, message) => error_body(status, code, message),
            Self::AppError(error) => {
                let (status, code) = error.to_http_response_parts();
                if status.is_server_error() {
                    tracing::error!(error = %error, status = status.as_u16(), "管理接口处理失败");
                }
                error_body(status, code.to_string(), error.public_message())
            }
        }
    }
}

fn ok_body<T: Serialize>(data: Option<T>, message: String) -> Response {
    (
        StatusCode::OK,
        Json(SuccessResponse {
            success: true,
            data,
            message: Some(message),
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

fn error_body(status: StatusCode, code: String, message: String) -> Response {
    (
        status,
        Json(ErrorResponse {
            success: false,
            error: ErrorInfo { code, message },
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

pub fn success<T: Serialize>(data: T) -> Response {
    ApiResponse::Success(data).into_response()
}

pub fn success_with_message<T: Serialize>(data: T, message: &str) -> Response {
    ApiResponse::SuccessWithMessage(data, message.to_string()).into_response()
}

pub fn success_without_data(message: &str) -> Response {
    ApiResponse::<()>::SuccessWithoutData(message.to_string()).into_response()
}

pub fn error(status: StatusCode, code: &str, message: &str) -> Response {
    ApiResponse::<()>::Error(status, code.to_string(), message.to_string()).into_response()
}

pub fn app_error(error: ProxyError) -> Response {
    ApiResponse::<()>::AppError(error).into_response()
}

/// 把处理结果折叠成响应
pub fn respond<T: Serialize>(result: Result<T>) -> Response {
    match result {
        Ok(data) => success(data),
        Err(e) => app_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::{Value, json};

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_success_envelope() {
        let response = success(json!({"id": 1}));
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["id"], 1);
        assert!(body["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_app_error_hides_internal_detail() {
        let response = app_error(ProxyError::store("redis: connection refused"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["success"], false);
        assert_eq!(body["error"]["message"], "internal server error");

        let response = app_error(ProxyError::not_found("account 9"));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["error"]["code"], "not_found_error");
    }
}
