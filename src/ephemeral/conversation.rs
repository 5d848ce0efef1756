//! # 会话记忆
//!
//! 会话键 → {workdir, conv_id}，带 TTL。内存实现由后台循环定期清理，
//! KV 实现依赖键过期。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ldebug;
use crate::logging::{LogComponent, LogStage};
use crate::store::{KeySpace, KvBackend};

/// 会话默认存活时间
pub const DEFAULT_CONVERSATION_TTL: Duration = Duration::from_secs(30 * 60);
/// 内存实现的容量上限
pub const DEFAULT_MAX_CONVERSATIONS: usize = 10_000;

/// 一个会话的记忆
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationState {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workdir: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub conv_id: String,
}

/// 会话存储
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get(&self, key: &str) -> Option<ConversationState>;

    async fn set_workdir(&self, key: &str, workdir: &str);

    async fn set_conv_id(&self, key: &str, conv_id: &str);

    async fn delete(&self, key: &str);

    /// 刷新 TTL
    async fn touch(&self, key: &str);

    /// 清理过期会话；KV 实现为空操作
    fn cleanup(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    state: ConversationState,
    touched: Instant,
}

/// 进程内会话存储
#[derive(Debug)]
pub struct MemoryConversationStore {
    ttl: Duration,
    max_size: usize,
    sessions: Mutex<HashMap<String, Entry>>,
}

impl Default for MemoryConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_CONVERSATION_TTL, DEFAULT_MAX_CONVERSATIONS)
    }
}

impl MemoryConversationStore {
    #[must_use]
    pub fn new(ttl: Duration, max_size: usize) -> Self {
        Self {
            ttl,
            max_size: max_size.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn update(&self, key: &str, apply: impl FnOnce(&mut ConversationState)) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if !sessions.contains_key(key) && sessions.len() >= self.max_size {
            // 满了先淘汰最久未访问的一个
            if let Some(oldest) = sessions
                .iter()
                .min_by_key(|(_, e)| e.touched)
                .map(|(k, _)| k.clone())
            {
                sessions.remove(&oldest);
            }
        }
        let entry = sessions.entry(key.to_string()).or_insert_with(|| Entry {
            state: ConversationState::default(),
            touched: now,
        });
        apply(&mut entry.state);
        entry.touched = now;
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
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
impl ConversationStore for MemoryConversationStore {
    async fn get(&self, key: &str) -> Option<ConversationState> {
        let sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(key)
            .filter(|e| e.touched.elapsed() <= self.ttl)
            .map(|e| e.state.clone())
    }

    async fn set_workdir(&self, key: &str, workdir: &str) {
        self.update(key, |s| s.workdir = workdir.to_string());
    }

    async fn set_conv_id(&self, key: &str, conv_id: &str) {
        self.update(key, |s| s.conv_id = conv_id.to_string());
    }

    async fn delete(&self, key: &str) {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    async fn touch(&self, key: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = sessions.get_mut(key) {
            entry.touched = Instant::now();
        }
    }

    fn cleanup(&self) -> usize {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let before = sessions.len();
        sessions.retain(|_, e| e.touched.elapsed() <= self.ttl);
        before - sessions.len()
    }
}

/// KV 会话存储，记录以 JSON 保存并设置过期
pub struct KvConversationStore {
    kv: Arc<dyn KvBackend>,
    keys: KeySpace,
    ttl: Duration,
}

impl std::fmt::Debug for KvConversationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConversationStore")
            .field("backend", &self.kv.name())
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl KvConversationStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvBackend>, keys: KeySpace, ttl: Duration) -> Self {
        Self { kv, keys, ttl }
    }

    async fn read(&self, key: &str) -> Option<ConversationState> {
        let raw = self.kv.get(&self.keys.session(key)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }

    async fn write(&self, key: &str, apply: impl FnOnce(&mut ConversationState) + Send) {
        let mut state = self.read(key).await.unwrap_or_default();
        apply(&mut state);
        let result = match serde_json::to_string(&state) {
            Ok(raw) => self.kv.set(&self.keys.session(key), &raw, Some(self.ttl)).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            ldebug!(
                "system",
                LogStage::Cache,
                LogComponent::Store,
                "conversation_write_failed",
                "会话记忆写入失败",
                error = %e
            );
        }
    }
}

#[async_trait]
impl ConversationStore for KvConversationStore {
    async fn get(&self, key: &str) -> Option<ConversationState> {
        self.read(key).await
    }

    async fn set_workdir(&self, key: &str, workdir: &str) {
        let workdir = workdir.to_string();
        self.write(key, move |s| s.workdir = workdir).await;
    }

    async fn set_conv_id(&self, key: &str, conv_id: &str) {
        let conv_id = conv_id.to_string();
        self.write(key, move |s| s.conv_id = conv_id).await;
    }

    async fn delete(&self, key: &str) {
        let _ = self.kv.del(&[self.keys.session(key)]).await;
    }

    async fn touch(&self, key: &str) {
        let _ = self.kv.expire(&self.keys.session(key), self.ttl).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expires_and_cleans_up() {
        let store = MemoryConversationStore::new(Duration::from_secs(60), 10);
        store.set_workdir("c1", "/work/app").await;
        store.set_conv_id("c1", "conv-9").await;
        assert_eq!(
            store.get("c1").await,
            Some(ConversationState {
                workdir: "/work/app".into(),
                conv_id: "conv-9".into(),
            })
        );

        tokio::time::advance(Duration::from_secs(45)).await;
        store.touch("c1").await;
        tokio::time::advance(Duration::from_secs(45)).await;
        assert!(store.get("c1").await.is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get("c1").await.is_none());
        assert_eq!(store.cleanup(), 1);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_evicts_oldest_when_full() {
        let store = MemoryConversationStore::new(Duration::from_secs(60), 2);
        store.set_workdir("a", "/a").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set_workdir("b", "/b").await;
        tokio::time::advance(Duration::from_millis(10)).await;
        store.set_workdir("c", "/c").await;
        assert_eq!(store.len(), 2);
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_merges_fields() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let store = KvConversationStore::new(kv, KeySpace::new("t"), Duration::from_secs(60));
        store.set_workdir("k", "/srv").await;
        store.set_conv_id("k", "conv-1").await;
        let state = store.get("k").await.unwrap();
        assert_eq!(state.workdir, "/srv");
        assert_eq!(state.conv_id, "conv-1");
        store.delete("k").await;
        assert!(store.get("k").await.is_none());
    }
}
