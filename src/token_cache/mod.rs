//! # token 计数缓存
//!
//! `count_tokens` 的估算结果按文本摘要缓存。`mix` 策略的键只含文本，
//! `split` 策略把模型名也纳入键。

pub mod estimate;

use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use estimate::{TokenBreakdown, estimate_request, estimate_text_tokens};

use crate::config::TokenCacheConfig;
use crate::error::Result;
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::store::{KeySpace, KvBackend};

/// 键策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    Mix,
    Split,
}

impl CacheStrategy {
    /// 未知取值按 `mix` 处理
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("split") {
            Self::Split
        } else {
            Self::Mix
        }
    }
}

/// 缓存键：`sha256([model \0] text)`
#[must_use]
pub fn cache_key(strategy: CacheStrategy, model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    if strategy == CacheStrategy::Split {
        hasher.update(model.trim().to_lowercase().as_bytes());
        hasher.update([0u8]);
    }
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenCacheStats {
    pub entries: u64,
    pub size_bytes: u64,
}

/// token 缓存接口
#[async_trait]
pub trait TokenCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<u64>;

    async fn put(&self, key: &str, tokens: u64);

    async fn stats(&self) -> Result<TokenCacheStats>;

    async fn clear(&self) -> Result<u64>;

    /// 修改 TTL；TTL 变化会清空已有条目
    fn set_ttl(&self, ttl: Duration);

    /// 清理过期条目
    async fn sweep(&self) {}
}

fn entry_size(key: &str) -> u64 {
    key.len() as u64 + 8
}

/// 进程内缓存（moka），容量满时淘汰最不常用的条目
#[derive(Debug)]
pub struct MemoryTokenCache {
    max_entries: u64,
    ttl: RwLock<Duration>,
    inner: RwLock<Cache<String, u64>>,
}

impl MemoryTokenCache {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        let max_entries = max_entries.max(1) as u64;
        Self {
            max_entries,
            ttl: RwLock::new(ttl),
            inner: RwLock::new(Self::build(ttl, max_entries)),
        }
    }

    fn build(ttl: Duration, max_entries: u64) -> Cache<String, u64> {
        let builder = Cache::builder().max_capacity(max_entries);
        if ttl.is_zero() {
            builder.build()
        } else {
            builder.time_to_live(ttl).build()
        }
    }

    fn cache(&self) -> Cache<String, u64> {
        self.inner
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl TokenCache for MemoryTokenCache {
    async fn get(&self, key: &str) -> Option<u64> {
        self.cache().get(key).await
    }

    async fn put(&self, key: &str, tokens: u64) {
        self.cache().insert(key.to_string(), tokens).await;
    }

    async fn stats(&self) -> Result<TokenCacheStats> {
        let cache = self.cache();
        cache.run_pending_tasks().await;
        let size_bytes = cache.iter().map(|(k, _)| entry_size(&k)).sum();
        Ok(TokenCacheStats {
            entries: cache.entry_count(),
            size_bytes,
        })
    }

    async fn clear(&self) -> Result<u64> {
        let cache = self.cache();
        cache.run_pending_tasks().await;
        let count = cache.entry_count();
        cache.invalidate_all();
        cache.run_pending_tasks().await;
        Ok(count)
    }

    fn set_ttl(&self, ttl: Duration) {
        let mut current = self.ttl.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        if *current == ttl {
            return;
        }
        *current = ttl;
        *self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner) =
            Self::build(ttl, self.max_entries);
    }

    async fn sweep(&self) {
        self.cache().run_pending_tasks().await;
    }
}

/// KV 缓存，多实例共享
pub struct KvTokenCache {
    kv: Arc<dyn KvBackend>,
    keys: KeySpace,
    ttl: RwLock<Duration>,
}

impl std::fmt::Debug for KvTokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvTokenCache")
            .field("backend", &self.kv.name())
            .finish_non_exhaustive()
    }
}

impl KvTokenCache {
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, keys: KeySpace, ttl: Duration) -> Self {
        Self {
            kv,
            keys,
            ttl: RwLock::new(ttl),
        }
    }

    fn ttl(&self) -> Option<Duration> {
        let ttl = *self.ttl.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        (!ttl.is_zero()).then_some(ttl)
    }
}

#[async_trait]
impl TokenCache for KvTokenCache {
    async fn get(&self, key: &str) -> Option<u64> {
        let raw = self.kv.get(&self.keys.token_cache(key)).await.ok()??;
        raw.trim().parse().ok()
    }

    async fn put(&self, key: &str, tokens: u64) {
        if let Err(e) = self
            .kv
            .set(&self.keys.token_cache(key), &tokens.to_string(), self.ttl())
            .await
        {
            ldebug!(
                "system",
                LogStage::Cache,
                LogComponent::TokenCache,
                "put_failed",
                "token 缓存写入失败",
                error = %e
            );
        }
    }

    async fn stats(&self) -> Result<TokenCacheStats> {
        let prefix = self.keys.token_cache_prefix();
        let keys = self.kv.scan_prefix(&prefix).await?;
        let size_bytes = keys
            .iter()
            .map(|k| entry_size(k.strip_prefix(&prefix).unwrap_or(k)))
            .sum();
        Ok(TokenCacheStats {
            entries: keys.len() as u64,
            size_bytes,
        })
    }

    async fn clear(&self) -> Result<u64> {
        self.kv.delete_prefix(&self.keys.token_cache_prefix()).await
    }

    fn set_ttl(&self, ttl: Duration) {
        *self.ttl.write().unwrap_or_else(std::sync::PoisonError::into_inner) = ttl;
    }
}

/// 按配置构造缓存；未启用时返回 `None`
#[must_use]
pub fn build_token_cache(
    config: &TokenCacheConfig,
    kv: Option<(Arc<dyn KvBackend>, KeySpace)>,
) -> Option<Arc<dyn TokenCache>> {
    if !config.enabled {
        return None;
    }
    let ttl = Duration::from_secs(config.ttl_secs);
    Some(match kv {
        Some((kv, keys)) => Arc::new(KvTokenCache::new(kv, keys, ttl)),
        None => Arc::new(MemoryTokenCache::new(ttl, config.max_entries)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[test]
    fn test_strategy_controls_model_in_key() {
        let mix_a = cache_key(CacheStrategy::Mix, "grok-4", "hello");
        let mix_b = cache_key(CacheStrategy::Mix, "auto", "hello");
        assert_eq!(mix_a, mix_b);
        let split_a = cache_key(CacheStrategy::Split, "grok-4", "hello");
        let split_b = cache_key(CacheStrategy::Split, " GROK-4 ", "hello");
        assert_eq!(split_a, split_b);
        assert_ne!(split_a, mix_a);
        assert_eq!(CacheStrategy::parse("SPLIT"), CacheStrategy::Split);
        assert_eq!(CacheStrategy::parse("mixed"), CacheStrategy::Mix);
    }

    #[tokio::test]
    async fn test_memory_cache_round_trip_and_clear() {
        let cache = MemoryTokenCache::new(Duration::from_secs(60), 100);
        cache.put("k1", 42).await;
        cache.put("k2", 7).await;
        assert_eq!(cache.get("k1").await, Some(42));
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.size_bytes, 20);
        assert_eq!(cache.clear().await.unwrap(), 2);
        assert_eq!(cache.get("k1").await, None);
    }

    #[tokio::test]
    async fn test_memory_set_ttl_resets_entries() {
        let cache = MemoryTokenCache::new(Duration::from_secs(60), 100);
        cache.put("k", 1).await;
        cache.set_ttl(Duration::from_secs(60));
        assert_eq!(cache.get("k").await, Some(1));
        cache.set_ttl(Duration::from_secs(120));
        assert_eq!(cache.get("k").await, None);
    }

    #[tokio::test]
    async fn test_kv_cache() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let cache = KvTokenCache::new(kv, KeySpace::new("t"), Duration::from_secs(60));
        cache.put("abc", 9).await;
        assert_eq!(cache.get("abc").await, Some(9));
        assert_eq!(cache.get("missing").await, None);
        assert_eq!(
            cache.stats().await.unwrap(),
            TokenCacheStats {
                entries: 1,
                size_bytes: 11
            }
        );
        assert_eq!(cache.clear().await.unwrap(), 1);
        assert_eq!(cache.stats().await.unwrap().entries, 0);
    }
}
