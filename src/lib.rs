//! # AI Relay
//!
//! 多租户 AI 反向代理：在 Orchids、Warp、Grok 三个上游前提供 OpenAI / Anthropic
//! 兼容接口，按加权最少连接在账号池中调度，并提供管理端与公共 API。

pub mod app;
pub mod auth;
pub mod balancer;
pub mod batch;
pub mod config;
pub mod ephemeral;
pub mod error;
pub mod handler;
pub mod limiter;
pub mod logging;
pub mod provider;
pub mod reliability;
pub mod router;
pub mod server;
pub mod store;
pub mod token_cache;
pub mod tracker;
pub mod utils;

pub use config::AppConfig;
pub use error::{ProxyError, Result};
