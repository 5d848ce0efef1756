//! # 错误类型定义

use axum::http::StatusCode;
use thiserror::Error;

/// 应用主要错误类型
#[derive(Debug, Error)]
pub enum ProxyError {
    /// 配置相关错误
    #[error("配置错误: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// KV 存储错误
    #[error("存储错误: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 资源不存在（未知账号、任务、缓存文件，或无法解码的记录）
    #[error("资源不存在: {message}")]
    NotFound { message: String },

    /// 网络通信错误
    #[error("网络错误: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 上游返回非成功状态
    #[error("上游错误 ({provider}): HTTP {status}: {message}")]
    Upstream {
        provider: String,
        status: u16,
        message: String,
    },

    /// 上游调用超时
    #[error("上游超时 ({provider}): {timeout_ms}ms")]
    UpstreamTimeout { provider: String, timeout_ms: u64 },

    /// 刷新令牌失败
    #[error("刷新令牌失败 ({provider}): {message}")]
    RefreshFailed { provider: String, message: String },

    /// 认证和授权错误
    #[error("认证错误: {message}")]
    Auth { message: String },

    /// 客户端输入错误
    #[error("请求参数错误: {message}")]
    Validation { message: String },

    /// 没有可用账号
    #[error("没有可用账号: {message}")]
    NoAvailableAccount { message: String },

    /// 并发容量耗尽
    #[error("{message}")]
    Capacity { message: String },

    /// 熔断器打开
    #[error("熔断器已打开: {name}")]
    CircuitOpen { name: String },

    /// 操作被取消（客户端断开或停机）
    #[error("操作已取消: {message}")]
    Cancelled { message: String },

    /// 系统内部错误
    #[error("内部错误: {message}")]
    Internal {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// IO相关错误
    #[error("IO错误: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化错误
    #[error("序列化错误: {message}")]
    Serialization {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// 服务器初始化错误
    #[error("服务器初始化错误: {message}")]
    ServerInit {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 服务器启动错误
    #[error("服务器启动错误: {message}")]
    ServerStart {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// 带上下文的错误
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<ProxyError>,
    },
}

impl ProxyError {
    /// 转换为 HTTP 状态码与错误类型标识
    #[must_use]
    pub fn to_http_response_parts(&self) -> (StatusCode, &'static str) {
        match self {
            Self::Config { .. } | Self::Validation { .. } | Self::Serialization { .. } => {
                (StatusCode::BAD_REQUEST, "invalid_request_error")
            }
            Self::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found_error"),
            Self::Auth { .. } => (StatusCode::UNAUTHORIZED, "authentication_error"),
            Self::Network { .. }
            | Self::Upstream { .. }
            | Self::UpstreamTimeout { .. }
            | Self::RefreshFailed { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            Self::NoAvailableAccount { .. } | Self::Capacity { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error")
            }
            Self::CircuitOpen { .. } => (StatusCode::SERVICE_UNAVAILABLE, "circuit_breaker_open"),
            // 499: 客户端已断开，不会真正写出响应体
            Self::Cancelled { .. } => (
                StatusCode::from_u16(499).unwrap_or(StatusCode::BAD_REQUEST),
                "request_cancelled",
            ),
            Self::Store { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::ServerInit { .. }
            | Self::ServerStart { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "api_error"),
            Self::Context { source, .. } => source.to_http_response_parts(),
        }
    }

    /// 返回最内层的错误（剥离上下文包装）
    #[must_use]
    pub fn root(&self) -> &Self {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// 对外展示的错误信息；内部错误只给出通用描述
    #[must_use]
    pub fn public_message(&self) -> String {
        match self.root() {
            Self::Store { .. }
            | Self::Internal { .. }
            | Self::Io { .. }
            | Self::ServerInit { .. }
            | Self::ServerStart { .. } => "internal server error".to_string(),
            Self::NoAvailableAccount { .. } => "no available token".to_string(),
            Self::Auth { message } | Self::Validation { message } | Self::Capacity { message } => {
                message.clone()
            }
            other => other.to_string(),
        }
    }

    /// 上游 HTTP 状态码（如果有）
    #[must_use]
    pub fn upstream_status(&self) -> Option<u16> {
        match self.root() {
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 创建配置错误
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的配置错误
    pub fn config_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建存储错误
    pub fn store<T: Into<String>>(message: T) -> Self {
        Self::Store {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的存储错误
    pub fn store_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Store {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建资源不存在错误
    pub fn not_found<T: Into<String>>(message: T) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// 创建网络错误
    pub fn network<T: Into<String>>(message: T) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的网络错误
    pub fn network_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Network {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建上游状态错误
    pub fn upstream<P: Into<String>, T: Into<String>>(provider: P, status: u16, message: T) -> Self {
        Self::Upstream {
            provider: provider.into(),
            status,
            message: message.into(),
        }
    }

    /// 创建上游超时错误
    pub fn upstream_timeout<P: Into<String>>(provider: P, timeout_ms: u64) -> Self {
        Self::UpstreamTimeout {
            provider: provider.into(),
            timeout_ms,
        }
    }

    /// 创建刷新失败错误
    pub fn refresh_failed<P: Into<String>, T: Into<String>>(provider: P, message: T) -> Self {
        Self::RefreshFailed {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// 创建认证错误
    pub fn auth<T: Into<String>>(message: T) -> Self {
        Self::Auth {
            message: message.into(),
        }
    }

    /// 创建参数校验错误
    pub fn validation<T: Into<String>>(message: T) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// 创建无可用账号错误
    pub fn no_available_account<T: Into<String>>(message: T) -> Self {
        Self::NoAvailableAccount {
            message: message.into(),
        }
    }

    /// 创建容量耗尽错误
    pub fn capacity<T: Into<String>>(message: T) -> Self {
        Self::Capacity {
            message: message.into(),
        }
    }

    /// 创建熔断错误
    pub fn circuit_open<T: Into<String>>(name: T) -> Self {
        Self::CircuitOpen { name: name.into() }
    }

    /// 创建取消错误
    pub fn cancelled<T: Into<String>>(message: T) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// 创建内部错误
    pub fn internal<T: Into<String>>(message: T) -> Self {
        Self::Internal {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的内部错误
    pub fn internal_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::Internal {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建序列化错误
    pub fn serialization<T: Into<String>, E: Into<anyhow::Error>>(message: T, source: E) -> Self {
        Self::Serialization {
            message: message.into(),
            source: source.into(),
        }
    }

    /// 创建服务器初始化错误
    pub fn server_init<T: Into<String>>(message: T) -> Self {
        Self::ServerInit {
            message: message.into(),
            source: None,
        }
    }

    /// 创建带来源的服务器初始化错误
    pub fn server_init_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::ServerInit {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// 创建服务器启动错误
    pub fn server_start_with_source<T: Into<String>, E: Into<anyhow::Error>>(
        message: T,
        source: E,
    ) -> Self {
        Self::ServerStart {
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: "文件操作失败".to_string(),
            source: err,
        }
    }
}

impl From<toml::de::Error> for ProxyError {
    fn from(err: toml::de::Error) -> Self {
        Self::config_with_source("TOML解析失败", err)
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: "JSON处理失败".to_string(),
            source: err.into(),
        }
    }
}

impl From<redis::RedisError> for ProxyError {
    fn from(err: redis::RedisError) -> Self {
        Self::store_with_source(format!("Redis操作失败: {err}"), err)
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::network_with_source(format!("请求超时: timeout: {err}"), err);
        }
        if err.is_connect() {
            return Self::network_with_source(format!("连接失败: connection refused: {err}"), err);
        }
        Self::network_with_source(format!("HTTP请求失败: {err}"), err)
    }
}
