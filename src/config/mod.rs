//! # 配置管理模块
//!
//! 处理应用配置加载、验证和管理

mod app_config;
mod manager;

pub use app_config::{
    AppConfig, AuthConfig, BalancerConfig, BatchConfig, DedupConfig, GrokConfig, LimiterConfig,
    LogConfig, OrchidsConfig, RedisConfig, ReliabilityConfig, ServerConfig, StoreConfig,
    TokenCacheConfig, WarpConfig,
};
pub use manager::{ConfigManager, apply_env_overrides, apply_overrides_from, load_config, merge_json};

/// 存放生效配置的 setting 键
pub const CONFIG_SETTING_KEY: &str = "config";

/// 管理员密码最小长度
pub const MIN_ADMIN_PASS_LEN: usize = 16;
