//! # 应用配置结构定义

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 应用主配置结构
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub store: StoreConfig,
    pub balancer: BalancerConfig,
    pub limiter: LimiterConfig,
    pub auth: AuthConfig,
    pub dedup: DedupConfig,
    pub token_cache: TokenCacheConfig,
    pub batch: BatchConfig,
    pub reliability: ReliabilityConfig,
    pub warp: WarpConfig,
    pub orchids: OrchidsConfig,
    pub grok: GrokConfig,
    pub log: LogConfig,
}

/// HTTP 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 读取请求头超时（秒）
    pub read_header_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    /// 优雅停机排空时间（秒）
    pub shutdown_timeout_secs: u64,
    /// 对外可访问的基础地址，用于拼接图片链接
    pub public_base_url: String,
    /// 缓存文件目录（`{dir}/image`、`{dir}/video`）
    pub data_dir: String,
    pub debug: bool,
    pub max_body_bytes: usize,
    /// 允许的跨域来源，包含 `*` 时放开全部
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3002,
            read_header_timeout_secs: 10,
            read_timeout_secs: 30,
            idle_timeout_secs: 60,
            shutdown_timeout_secs: 30,
            public_base_url: String::new(),
            data_dir: "data/tmp".to_string(),
            debug: false,
            max_body_bytes: 32 * 1024 * 1024,
            cors_origins: vec!["*".to_string()],
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RedisConfig {
    /// 为 false 时使用进程内 KV（单实例）
    pub enabled: bool,
    /// 完整连接 URL，非空时优先于 host/port
    pub url: String,
    pub host: String,
    pub port: u16,
    pub database: u8,
    pub password: Option<String>,
    /// 所有键的命名空间前缀
    pub prefix: String,
    /// 连接超时时间（秒）
    pub connection_timeout: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
            prefix: "relay".to_string(),
            connection_timeout: 5,
        }
    }
}

impl RedisConfig {
    /// 构建 Redis 连接 URL
    #[must_use]
    pub fn build_url(&self) -> String {
        if !self.url.trim().is_empty() {
            return self.url.trim().to_string();
        }
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                urlencoding::encode(password),
                self.host,
                self.port,
                self.database
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.database),
        }
    }
}

/// KV 门面配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StoreConfig {
    /// 读缓存 TTL（毫秒），0 表示不缓存
    pub read_cache_ttl_ms: u64,
    /// 首次启动时写入默认模型
    pub seed_models: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            read_cache_ttl_ms: 2000,
            seed_models: true,
        }
    }
}

/// 负载均衡配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BalancerConfig {
    /// 启用账号快照缓存 TTL（毫秒）
    pub cache_ttl_ms: u64,
    /// 429 冷却时间（秒）
    pub cooldown_secs: u64,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            cache_ttl_ms: 5000,
            cooldown_secs: 60 * 60,
        }
    }
}

impl BalancerConfig {
    #[must_use]
    pub const fn cache_ttl(&self) -> Duration {
        Duration::from_millis(self.cache_ttl_ms)
    }

    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// 并发限制配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimiterConfig {
    pub max_concurrent: usize,
    /// 全局并发超时（毫秒），同时约束等待与处理时长
    pub timeout_ms: u64,
    /// 非自适应（或样本不足）时的等待超时（毫秒）
    pub wait_timeout_ms: u64,
    pub adaptive: bool,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 100,
            timeout_ms: 120_000,
            wait_timeout_ms: 60_000,
            adaptive: true,
        }
    }
}

/// 认证配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AuthConfig {
    pub admin_user: String,
    pub admin_pass: String,
    pub admin_token: String,
    /// 公共 API 密钥，空表示不鉴权
    pub public_key: String,
    /// 管理端会话有效期（秒）
    pub session_ttl_secs: u64,
    /// `task_id` 临时授权有效期（秒）
    pub task_grant_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_user: "admin".to_string(),
            admin_pass: String::new(),
            admin_token: String::new(),
            public_key: String::new(),
            session_ttl_secs: 24 * 60 * 60,
            task_grant_ttl_secs: 10 * 60,
        }
    }
}

/// 请求去重配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub window_ms: u64,
    /// 内存实现中无在途请求的记录保留时长（毫秒）
    pub cleanup_window_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 2000,
            cleanup_window_ms: 10_000,
        }
    }
}

/// token 计数缓存配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TokenCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    pub max_entries: usize,
    /// `mix`：键不含模型；`split`：键包含模型
    pub strategy: String,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 5 * 60,
            max_entries: 10_000,
            strategy: "mix".to_string(),
        }
    }
}

/// 批量任务配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    /// 终态任务保留时间（秒）
    pub task_ttl_secs: u64,
    pub default_concurrency: usize,
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            task_ttl_secs: 5 * 60,
            default_concurrency: 5,
            max_concurrency: 20,
        }
    }
}

/// 熔断与重试配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReliabilityConfig {
    pub breaker_max_requests: u32,
    pub breaker_interval_secs: u64,
    pub breaker_timeout_secs: u64,
    pub breaker_failure_ratio: f64,
    pub breaker_min_requests: u32,
    pub retry_max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_multiplier: f64,
    pub retry_jitter: f64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            breaker_max_requests: 3,
            breaker_interval_secs: 60,
            breaker_timeout_secs: 30,
            breaker_failure_ratio: 0.5,
            breaker_min_requests: 5,
            retry_max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 10_000,
            retry_multiplier: 2.0,
            retry_jitter: 0.1,
        }
    }
}

/// Warp 上游配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WarpConfig {
    pub ai_url: String,
    pub refresh_url: String,
    pub login_url: String,
    pub client_id: String,
    pub client_version: String,
    pub os_category: String,
    pub os_name: String,
    pub os_version: String,
    /// 丢弃工具定义并在提示词前注入说明
    pub disable_tools: bool,
    pub no_tools_prompt: String,
    pub default_model: String,
    /// 后台刷新周期（秒）
    pub refresh_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            ai_url: "https://app.warp.dev/ai/multi-agent".to_string(),
            refresh_url: "https://app.warp.dev/proxy/token".to_string(),
            login_url: "https://app.warp.dev/client/login".to_string(),
            client_id: "warp-app".to_string(),
            client_version: "v0.2025.08.06.08.12.stable_02".to_string(),
            os_category: "macOS".to_string(),
            os_name: "macOS".to_string(),
            os_version: "14.0".to_string(),
            disable_tools: true,
            no_tools_prompt: "Do not call any tools. Answer directly in plain text.".to_string(),
            default_model: "auto".to_string(),
            refresh_interval_secs: 30 * 60,
            request_timeout_secs: 180,
        }
    }
}

/// Orchids 上游配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchidsConfig {
    pub api_url: String,
    pub clerk_token_url: String,
    pub origin: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
}

impl Default for OrchidsConfig {
    fn default() -> Self {
        Self {
            api_url: "https://www.orchids.app/api/agent/stream".to_string(),
            clerk_token_url: "https://clerk.orchids.app/v1/client/sessions/{session_id}/tokens"
                .to_string(),
            origin: "https://www.orchids.app".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36".to_string(),
            request_timeout_secs: 120,
        }
    }
}

/// Grok 上游配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GrokConfig {
    pub base_url: String,
    pub chat_path: String,
    pub rate_limits_path: String,
    pub upload_path: String,
    pub nsfw_path: String,
    pub user_agent: String,
    pub request_timeout_secs: u64,
    /// 图片生成最长等待（秒）
    pub image_timeout_secs: u64,
    /// 公共 imagine 页面参数：最终图与中间图的最小字节数
    pub imagine_final_min_bytes: u64,
    pub imagine_medium_min_bytes: u64,
    pub imagine_nsfw: bool,
}

impl Default for GrokConfig {
    fn default() -> Self {
        Self {
            base_url: "https://grok.com".to_string(),
            chat_path: "/rest/app-chat/conversations/new".to_string(),
            rate_limits_path: "/rest/rate-limits".to_string(),
            upload_path: "/rest/app-chat/upload-file".to_string(),
            nsfw_path: "/rest/user-settings".to_string(),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36".to_string(),
            request_timeout_secs: 120,
            image_timeout_secs: 180,
            imagine_final_min_bytes: 100_000,
            imagine_medium_min_bytes: 30_000,
            imagine_nsfw: true,
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl AppConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port 不能为 0".to_string());
        }
        if self.limiter.max_concurrent == 0 {
            return Err("limiter.max_concurrent 必须大于 0".to_string());
        }
        if self.limiter.timeout_ms == 0 {
            return Err("limiter.timeout_ms 必须大于 0".to_string());
        }
        if !(0.0..=1.0).contains(&self.reliability.breaker_failure_ratio) {
            return Err("reliability.breaker_failure_ratio 必须在 [0, 1] 之间".to_string());
        }
        if self.batch.max_concurrency == 0 {
            return Err("batch.max_concurrency 必须大于 0".to_string());
        }
        let strategy = self.token_cache.strategy.trim().to_lowercase();
        if !matches!(strategy.as_str(), "" | "mix" | "mixed" | "split") {
            return Err(format!("未知的 token_cache.strategy: {strategy}"));
        }
        if self.redis.enabled && self.redis.prefix.trim().is_empty() {
            return Err("redis.prefix 不能为空".to_string());
        }
        Ok(())
    }
}
