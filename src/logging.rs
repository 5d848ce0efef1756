//! # 日志配置模块
//!
//! 初始化 tracing 订阅器，并提供带请求阶段/组件标签的结构化日志宏

use std::fmt;

use tracing_subscriber::{EnvFilter, fmt as tfmt, layer::SubscriberExt, util::SubscriberInitExt};

/// 请求处理阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogStage {
    Startup,
    Shutdown,
    Authentication,
    Scheduling,
    UpstreamRequest,
    Streaming,
    Response,
    Background,
    Cache,
    Batch,
}

impl LogStage {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Startup => "startup",
            Self::Shutdown => "shutdown",
            Self::Authentication => "authentication",
            Self::Scheduling => "scheduling",
            Self::UpstreamRequest => "upstream_request",
            Self::Streaming => "streaming",
            Self::Response => "response",
            Self::Background => "background",
            Self::Cache => "cache",
            Self::Batch => "batch",
        }
    }
}

impl fmt::Display for LogStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 产生日志的子系统
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogComponent {
    Main,
    Config,
    Store,
    Tracker,
    Balancer,
    Provider,
    Warp,
    Orchids,
    Grok,
    Limiter,
    Batch,
    Auth,
    Dedup,
    TokenCache,
    Router,
    Reliability,
    Audit,
}

impl LogComponent {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Main => "main",
            Self::Config => "config",
            Self::Store => "store",
            Self::Tracker => "tracker",
            Self::Balancer => "balancer",
            Self::Provider => "provider",
            Self::Warp => "warp",
            Self::Orchids => "orchids",
            Self::Grok => "grok",
            Self::Limiter => "limiter",
            Self::Batch => "batch",
            Self::Auth => "auth",
            Self::Dedup => "dedup",
            Self::TokenCache => "token_cache",
            Self::Router => "router",
            Self::Reliability => "reliability",
            Self::Audit => "audit",
        }
    }
}

impl fmt::Display for LogComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别；`json = true` 时输出 JSON 行。
/// 重复初始化（例如测试中）会被静默忽略。
pub fn init_logging(log_level: Option<&str>, json: bool) {
    let level = log_level.unwrap_or("info");
    let default_filter = format!("{level},hyper=warn,reqwest=warn,h2=warn,tower_http=info");
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tfmt::layer().json().with_target(true))
            .try_init()
    } else {
        registry
            .with(tfmt::layer().with_target(true).compact())
            .try_init()
    };
    if result.is_err() {
        tracing::debug!("日志系统已初始化，跳过");
    }
}

/// 结构化 INFO 日志
///
/// ```ignore
/// linfo!(request_id, LogStage::Scheduling, LogComponent::Balancer, "account_selected", "选中账号", account_id = id);
/// ```
#[macro_export]
macro_rules! linfo {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::info!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            $($($field)+,)?
            "{}",
            $msg
        )
    };
}

/// 结构化 DEBUG 日志
#[macro_export]
macro_rules! ldebug {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::debug!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            $($($field)+,)?
            "{}",
            $msg
        )
    };
}

/// 结构化 WARN 日志
#[macro_export]
macro_rules! lwarn {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::warn!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            $($($field)+,)?
            "{}",
            $msg
        )
    };
}

/// 结构化 ERROR 日志
#[macro_export]
macro_rules! lerror {
    ($rid:expr, $stage:expr, $comp:expr, $op:expr, $msg:expr $(, $($field:tt)+)?) => {
        ::tracing::error!(
            request_id = %$rid,
            stage = %$stage,
            component = %$comp,
            operation = $op,
            $($($field)+,)?
            "{}",
            $msg
        )
    };
}
