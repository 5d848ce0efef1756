//! # 配置管理器
//!
//! 持有当前生效配置，支持环境变量覆盖和运行时更新

use std::env;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use super::AppConfig;
use crate::error::{ProxyError, Result};

/// 配置管理器
pub struct ConfigManager {
    config: Arc<RwLock<AppConfig>>,
    notifier: broadcast::Sender<Arc<AppConfig>>,
}

impl ConfigManager {
    /// 使用给定配置创建管理器
    #[must_use]
    pub fn new(config: AppConfig) -> Self {
        let (notifier, _) = broadcast::channel(16);
        Self {
            config: Arc::new(RwLock::new(config)),
            notifier,
        }
    }

    /// 从文件加载并应用环境变量覆盖
    pub fn from_file(path: Option<&Path>) -> Result<Self> {
        Ok(Self::new(load_config(path)?))
    }

    /// 当前配置快照
    pub async fn get_config(&self) -> AppConfig {
        self.config.read().await.clone()
    }

    /// 订阅配置变更
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<AppConfig>> {
        self.notifier.subscribe()
    }

    /// 替换整个配置（校验通过后才生效）
    pub async fn replace(&self, new_config: AppConfig) -> Result<()> {
        new_config.validate().map_err(ProxyError::validation)?;
        {
            let mut guard = self.config.write().await;
            *guard = new_config.clone();
        }
        // 没有订阅者时发送失败是正常情况
        let _ = self.notifier.send(Arc::new(new_config));
        info!("配置已更新");
        Ok(())
    }

    /// 以 JSON 合并补丁更新配置
    pub async fn patch(&self, patch: &serde_json::Value) -> Result<AppConfig> {
        let current = self.get_config().await;
        let mut value = serde_json::to_value(&current)?;
        merge_json(&mut value, patch);
        let updated: AppConfig = serde_json::from_value(value)
            .map_err(|e| ProxyError::validation(format!("配置格式错误: {e}")))?;
        self.replace(updated.clone()).await?;
        Ok(updated)
    }
}

/// 递归合并 JSON 对象，`null` 值被忽略
pub fn merge_json(target: &mut serde_json::Value, patch: &serde_json::Value) {
    match (target, patch) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    continue;
                }
                match target_map.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// 加载配置文件；文件不存在时使用默认值
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut config = match path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(path).map_err(|e| {
                ProxyError::config_with_source(format!("读取配置文件失败: {}", path.display()), e)
            })?;
            debug!(path = %path.display(), "读取配置文件");
            toml::from_str::<AppConfig>(&content)?
        }
        Some(path) => {
            warn!(path = %path.display(), "配置文件不存在，使用默认配置");
            AppConfig::default()
        }
        None => AppConfig::default(),
    };

    apply_env_overrides(&mut config)?;
    config.validate().map_err(ProxyError::config)?;
    Ok(config)
}

/// 应用进程环境变量覆盖
pub fn apply_env_overrides(config: &mut AppConfig) -> Result<()> {
    apply_overrides_from(config, |name| env::var(name).ok())
}

/// 从任意来源读取覆盖项（测试中可以传入映射表）
pub fn apply_overrides_from<F>(config: &mut AppConfig, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| {
        lookup(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let parse = |name: &str| -> Result<Option<u64>> {
        get(name)
            .map(|raw| {
                raw.parse::<u64>()
                    .map_err(|_| ProxyError::config(format!("环境变量 {name} 格式错误: {raw}")))
            })
            .transpose()
    };

    if let Some(port) = parse("PORT")? {
        config.server.port = u16::try_from(port)
            .map_err(|_| ProxyError::config(format!("环境变量 PORT 超出范围: {port}")))?;
    }
    if let Some(url) = get("REDIS_URL") {
        config.redis.url = url;
        config.redis.enabled = true;
    }
    if let Some(host) = get("REDIS_HOST") {
        config.redis.host = host;
        config.redis.enabled = true;
    }
    if let Some(port) = parse("REDIS_PORT")? {
        config.redis.port = u16::try_from(port)
            .map_err(|_| ProxyError::config(format!("环境变量 REDIS_PORT 超出范围: {port}")))?;
    }
    if let Some(db) = parse("REDIS_DB")? {
        config.redis.database = u8::try_from(db)
            .map_err(|_| ProxyError::config(format!("环境变量 REDIS_DB 超出范围: {db}")))?;
    }
    if let Some(password) = get("REDIS_PASSWORD") {
        config.redis.password = Some(password);
    }
    if let Some(prefix) = get("REDIS_PREFIX") {
        config.redis.prefix = prefix;
    }
    if let Some(base) = get("PUBLIC_BASE_URL") {
        config.server.public_base_url = base.trim_end_matches('/').to_string();
    }
    if let Some(debug) = get("DEBUG") {
        config.server.debug = matches!(debug.to_lowercase().as_str(), "1" | "true" | "yes");
    }
    if let Some(user) = get("ADMIN_USER") {
        config.auth.admin_user = user;
    }
    if let Some(pass) = get("ADMIN_PASS") {
        config.auth.admin_pass = pass;
    }
    if let Some(token) = get("ADMIN_TOKEN") {
        config.auth.admin_token = token;
    }
    if let Some(key) = get("PUBLIC_KEY") {
        config.auth.public_key = key;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = load_config(Some(Path::new("/nonexistent/relay.toml"))).unwrap();
        assert_eq!(config.balancer.cache_ttl_ms, 5000);
        assert_eq!(config.limiter.max_concurrent, 100);
    }

    #[test]
    fn test_load_partial_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[server]\nport = 8088\n\n[limiter]\nmax_concurrent = 4\nadaptive = false\n"
        )
        .unwrap();
        let config = load_config(Some(file.path())).unwrap();
        assert_eq!(config.limiter.max_concurrent, 4);
        assert!(!config.limiter.adaptive);
        assert_eq!(config.limiter.timeout_ms, 120_000);
    }

    #[test]
    fn test_broken_toml_is_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        let result = load_config(Some(file.path()));
        assert!(matches!(result, Err(ProxyError::Config { .. })));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AppConfig::default();
        apply_overrides_from(
            &mut config,
            lookup(&[
                ("PORT", "9001"),
                ("REDIS_URL", "redis://10.0.0.2:6380/1"),
                ("PUBLIC_BASE_URL", "https://relay.example.com/"),
                ("DEBUG", "true"),
            ]),
        )
        .unwrap();
        assert_eq!(config.server.port, 9001);
        assert!(config.redis.enabled);
        assert_eq!(config.redis.build_url(), "redis://10.0.0.2:6380/1");
        assert_eq!(config.server.public_base_url, "https://relay.example.com");
        assert!(config.server.debug);
    }

    #[test]
    fn test_invalid_env_is_config_error() {
        let mut config = AppConfig::default();
        let result = apply_overrides_from(&mut config, lookup(&[("PORT", "not-a-port")]));
        assert!(matches!(result, Err(ProxyError::Config { .. })));
        let result = apply_overrides_from(&mut config, lookup(&[("REDIS_DB", "300")]));
        assert!(matches!(result, Err(ProxyError::Config { .. })));
    }

    #[test]
    fn test_redis_url_with_password() {
        let mut config = AppConfig::default();
        config.redis.password = Some("p@ss".to_string());
        assert_eq!(config.redis.build_url(), "redis://:p%40ss@127.0.0.1:6379/0");
    }

    #[tokio::test]
    async fn test_patch_merges_nested_values() {
        let manager = ConfigManager::new(AppConfig::default());
        let mut rx = manager.subscribe();
        let updated = manager
            .patch(&serde_json::json!({"warp": {"disable_tools": false}, "balancer": null}))
            .await
            .unwrap();
        assert!(!updated.warp.disable_tools);
        assert_eq!(updated.balancer.cooldown_secs, 3600);
        assert!(!rx.recv().await.unwrap().warp.disable_tools);
    }

    #[tokio::test]
    async fn test_patch_rejects_invalid() {
        let manager = ConfigManager::new(AppConfig::default());
        let err = manager
            .patch(&serde_json::json!({"limiter": {"max_concurrent": 0}}))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
        assert_eq!(manager.get_config().await.limiter.max_concurrent, 100);
    }
}
