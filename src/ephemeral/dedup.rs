//! # 请求去重
//!
//! 指纹 = sha256(method, path, sha256(body), user)。窗口内的重复请求被标记，
//! 同指纹仍在处理中时由调用方返回 409。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;

use crate::config::DedupConfig;
use crate::logging::{LogComponent, LogStage};
use crate::store::{DedupOutcome, KeySpace, KvBackend};
use crate::utils::sha256_hex;
use crate::{ldebug, lwarn};

/// 计算请求指纹
#[must_use]
pub fn fingerprint(method: &str, path: &str, body: &[u8], user: &str) -> String {
    let body_hash = sha256_hex(body);
    sha256_hex(format!("{method}\n{path}\n{body_hash}\n{user}").as_bytes())
}

/// 重复请求的响应
#[must_use]
pub fn duplicate_response() -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "type": "error",
            "error": {
                "type": "duplicate_request",
                "message": "duplicate request is still in flight",
            }
        })),
    )
        .into_response()
}

/// 去重存储
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// 登记一次请求；后端故障时按非重复处理
    async fn register(&self, fingerprint: &str) -> DedupOutcome;

    /// 标记请求完成
    async fn finish(&self, fingerprint: &str);

    /// 清理过期记录，返回清理数量
    fn sweep(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone, Copy)]
struct Recent {
    last: Instant,
    in_flight: u32,
}

/// 进程内去重
#[derive(Debug)]
pub struct MemoryDedupStore {
    window: Duration,
    cleanup_window: Duration,
    requests: Mutex<HashMap<String, Recent>>,
}

impl MemoryDedupStore {
    #[must_use]
    pub fn new(window: Duration, cleanup_window: Duration) -> Self {
        Self {
            window,
            cleanup_window,
            requests: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DedupStore for MemoryDedupStore {
    async fn register(&self, fingerprint: &str) -> DedupOutcome {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        match requests.get_mut(fingerprint) {
            Some(rec) if now.duration_since(rec.last) <= self.window => DedupOutcome {
                duplicate: true,
                in_flight: rec.in_flight > 0,
            },
            Some(rec) => {
                rec.last = now;
                rec.in_flight += 1;
                DedupOutcome::default()
            }
            None => {
                requests.insert(
                    fingerprint.to_string(),
                    Recent {
                        last: now,
                        in_flight: 1,
                    },
                );
                DedupOutcome::default()
            }
        }
    }

    async fn finish(&self, fingerprint: &str) {
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rec) = requests.get_mut(fingerprint) {
            rec.in_flight = rec.in_flight.saturating_sub(1);
            rec.last = Instant::now();
        }
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let before = requests.len();
        requests.retain(|_, rec| rec.in_flight > 0 || now.duration_since(rec.last) <= self.cleanup_window);
        before - requests.len()
    }
}

/// 基于 KV 脚本的去重，多实例共享
pub struct KvDedupStore {
    kv: Arc<dyn KvBackend>,
    keys: KeySpace,
    window: Duration,
    record_ttl: Duration,
}

impl std::fmt::Debug for KvDedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvDedupStore")
            .field("backend", &self.kv.name())
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl KvDedupStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, keys: KeySpace, window: Duration, record_ttl: Duration) -> Self {
        Self {
            kv,
            keys,
            window,
            record_ttl,
        }
    }

    fn ttl_ms(&self) -> u64 {
        u64::try_from(self.record_ttl.as_millis()).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl DedupStore for KvDedupStore {
    async fn register(&self, fingerprint: &str) -> DedupOutcome {
        let window_ms = i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX);
        match self
            .kv
            .dedup_register(
                &self.keys.dedup(fingerprint),
                Utc::now().timestamp_millis(),
                window_ms,
                self.ttl_ms(),
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Authentication,
                    LogComponent::Dedup,
                    "register_failed",
                    "去重登记失败，按非重复处理",
                    error = %e
                );
                DedupOutcome::default()
            }
        }
    }

    async fn finish(&self, fingerprint: &str) {
        if let Err(e) = self
            .kv
            .dedup_finish(
                &self.keys.dedup(fingerprint),
                Utc::now().timestamp_millis(),
                self.ttl_ms(),
            )
            .await
        {
            ldebug!(
                "system",
                LogStage::Response,
                LogComponent::Dedup,
                "finish_failed",
                "去重完成标记失败",
                error = %e
            );
        }
    }
}

/// 按配置构造去重存储；未启用时返回 `None`
#[must_use]
pub fn build_dedup_store(
    config: &DedupConfig,
    kv: Option<(Arc<dyn KvBackend>, KeySpace)>,
) -> Option<Arc<dyn DedupStore>> {
    if !config.enabled {
        return None;
    }
    let window = Duration::from_millis(config.window_ms);
    let cleanup = Duration::from_millis(config.cleanup_window_ms.max(config.window_ms));
    Some(match kv {
        Some((kv, keys)) => Arc::new(KvDedupStore::new(kv, keys, window, cleanup)),
        None => Arc::new(MemoryDedupStore::new(window, cleanup)),
    })
}

/// 一次已登记的请求；完成或丢弃时回报 `finish`
pub struct DedupGuard {
    store: Arc<dyn DedupStore>,
    fingerprint: String,
    finished: AtomicBool,
}

impl std::fmt::Debug for DedupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupGuard")
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

impl DedupGuard {
    /// 登记请求。同指纹仍在处理中时返回 `Err(outcome)`；
    /// 窗口内已完成的重复请求直接放行，但不再登记。
    pub async fn register(
        store: Arc<dyn DedupStore>,
        fingerprint: String,
    ) -> std::result::Result<Option<Self>, DedupOutcome> {
        let outcome = store.register(&fingerprint).await;
        if outcome.duplicate {
            if outcome.in_flight {
                return Err(outcome);
            }
            return Ok(None);
        }
        Ok(Some(Self {
            store,
            fingerprint,
            finished: AtomicBool::new(false),
        }))
    }

    pub async fn finish(&self) {
        if !self.finished.swap(true, Ordering::AcqRel) {
            self.store.finish(&self.fingerprint).await;
        }
    }
}

impl Drop for DedupGuard {
    fn drop(&mut self) {
        if self.finished.swap(true, Ordering::AcqRel) {
            return;
        }
        let store = Arc::clone(&self.store);
        let fingerprint = std::mem::take(&mut self.fingerprint);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                store.finish(&fingerprint).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[test]
    fn test_fingerprint_depends_on_every_part() {
        let base = fingerprint("POST", "/v1/messages", b"{}", "u1");
        assert_eq!(base.len(), 64);
        assert_eq!(base, fingerprint("POST", "/v1/messages", b"{}", "u1"));
        assert_ne!(base, fingerprint("POST", "/v1/messages", b"{ }", "u1"));
        assert_ne!(base, fingerprint("POST", "/v1/messages", b"{}", "u2"));
        assert_ne!(base, fingerprint("PUT", "/v1/messages", b"{}", "u1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_window_and_in_flight() {
        let store = MemoryDedupStore::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(store.register("fp").await, DedupOutcome::default());
        let dup = store.register("fp").await;
        assert!(dup.duplicate && dup.in_flight);

        store.finish("fp").await;
        let dup = store.register("fp").await;
        assert!(dup.duplicate && !dup.in_flight);

        tokio::time::advance(Duration::from_secs(3)).await;
        assert_eq!(store.register("fp").await, DedupOutcome::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_sweep_keeps_in_flight() {
        let store = MemoryDedupStore::new(Duration::from_secs(2), Duration::from_secs(10));
        store.register("done").await;
        store.finish("done").await;
        store.register("busy").await;
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_kv_store_shares_state() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let keys = KeySpace::new("t");
        let a = KvDedupStore::new(kv.clone(), keys.clone(), Duration::from_secs(2), Duration::from_secs(10));
        let b = KvDedupStore::new(kv, keys, Duration::from_secs(2), Duration::from_secs(10));
        assert!(!a.register("fp").await.duplicate);
        let dup = b.register("fp").await;
        assert!(dup.duplicate && dup.in_flight);
    }

    #[tokio::test]
    async fn test_guard_rejects_in_flight_and_finishes_on_drop() {
        let store: Arc<dyn DedupStore> =
            Arc::new(MemoryDedupStore::new(Duration::from_secs(2), Duration::from_secs(10)));
        let guard = DedupGuard::register(store.clone(), "fp".into())
            .await
            .unwrap()
            .unwrap();
        assert!(DedupGuard::register(store.clone(), "fp".into()).await.is_err());
        guard.finish().await;
        assert!(DedupGuard::register(store.clone(), "fp".into())
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_disabled_config_builds_nothing() {
        let config = DedupConfig {
            enabled: false,
            ..DedupConfig::default()
        };
        assert!(build_dedup_store(&config, None).is_none());
        assert!(build_dedup_store(&DedupConfig::default(), None).is_some());
    }
}
