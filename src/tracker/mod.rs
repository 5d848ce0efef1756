//! # 账号连接计数
//!
//! 记录每个账号正在处理的请求数，供负载均衡按加权最少连接选择。
//! 计数永不为负：对未知 id 或 0 值的释放是空操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::{KeySpace, KvBackend};
use crate::{linfo, lwarn};

/// 连接计数器
#[async_trait]
pub trait ConnTracker: Send + Sync {
    async fn acquire(&self, account_id: i64);

    async fn release(&self, account_id: i64);

    async fn get_count(&self, account_id: i64) -> i64;

    /// 一次往返取回多个账号的计数
    async fn get_counts(&self, account_ids: &[i64]) -> HashMap<i64, i64>;
}

/// 进程内实现：每个账号一个原子计数
#[derive(Debug, Default)]
pub struct MemoryConnTracker {
    conns: DashMap<i64, AtomicI64>,
}

impl MemoryConnTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConnTracker for MemoryConnTracker {
    async fn acquire(&self, account_id: i64) {
        self.conns
            .entry(account_id)
            .or_default()
            .fetch_add(1, Ordering::AcqRel);
    }

    async fn release(&self, account_id: i64) {
        if let Some(counter) = self.conns.get(&account_id) {
            // 下限为 0 的 CAS 递减
            let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current > 0).then(|| current - 1)
            });
        }
    }

    async fn get_count(&self, account_id: i64) -> i64 {
        self.conns
            .get(&account_id)
            .map_or(0, |counter| counter.load(Ordering::Acquire))
    }

    async fn get_counts(&self, account_ids: &[i64]) -> HashMap<i64, i64> {
        account_ids
            .iter()
            .map(|id| {
                let count = self
                    .conns
                    .get(id)
                    .map_or(0, |counter| counter.load(Ordering::Acquire));
                (*id, count)
            })
            .collect()
    }
}

/// KV 实现：`INCR` + 脚本化的下限递减，多实例共享计数
pub struct KvConnTracker {
    kv: Arc<dyn KvBackend>,
    keys: KeySpace,
}

impl std::fmt::Debug for KvConnTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvConnTracker")
            .field("prefix", &self.keys.conns_prefix())
            .finish_non_exhaustive()
    }
}

impl KvConnTracker {
    /// 创建并清理上次崩溃遗留的计数键
    pub async fn new(kv: Arc<dyn KvBackend>, keys: KeySpace) -> Result<Self> {
        let tracker = Self { kv, keys };
        let cleared = tracker.kv.delete_prefix(&tracker.keys.conns_prefix()).await?;
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Tracker,
            "clear_stale_counters",
            &format!("清理遗留连接计数 {cleared} 个")
        );
        Ok(tracker)
    }
}

#[async_trait]
impl ConnTracker for KvConnTracker {
    async fn acquire(&self, account_id: i64) {
        if let Err(e) = self.kv.incr_by(&self.keys.conn(account_id), 1).await {
            lwarn!(
                "system",
                LogStage::Scheduling,
                LogComponent::Tracker,
                "acquire",
                "连接计数递增失败",
                account_id = account_id,
                error = %e
            );
        }
    }

    async fn release(&self, account_id: i64) {
        if let Err(e) = self.kv.decr_floor_zero(&self.keys.conn(account_id)).await {
            lwarn!(
                "system",
                LogStage::Scheduling,
                LogComponent::Tracker,
                "release",
                "连接计数递减失败",
                account_id = account_id,
                error = %e
            );
        }
    }

    async fn get_count(&self, account_id: i64) -> i64 {
        match self.kv.get(&self.keys.conn(account_id)).await {
            Ok(value) => value.and_then(|v| v.parse().ok()).unwrap_or(0).max(0),
            Err(_) => 0,
        }
    }

    async fn get_counts(&self, account_ids: &[i64]) -> HashMap<i64, i64> {
        if account_ids.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<String> = account_ids.iter().map(|id| self.keys.conn(*id)).collect();
        let values = match self.kv.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::Tracker,
                    "get_counts",
                    "批量读取连接计数失败，按 0 处理",
                    error = %e
                );
                vec![None; account_ids.len()]
            }
        };
        account_ids
            .iter()
            .zip(values)
            .map(|(id, value)| {
                let count = value.and_then(|v| v.parse().ok()).unwrap_or(0_i64).max(0);
                (*id, count)
            })
            .collect()
    }
}

/// 一次请求持有的账号连接
///
/// 正常路径调用 `release().await`；提前返回、出错或 panic 时由 `Drop` 异步补偿释放，
/// 保证每次 acquire 恰好对应一次 release。
pub struct AccountLease {
    tracker: Arc<dyn ConnTracker>,
    account_id: i64,
    released: AtomicBool,
}

impl std::fmt::Debug for AccountLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountLease")
            .field("account_id", &self.account_id)
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

impl AccountLease {
    /// 递增计数并返回租约
    pub async fn acquire(tracker: Arc<dyn ConnTracker>, account_id: i64) -> Self {
        tracker.acquire(account_id).await;
        Self {
            tracker,
            account_id,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub const fn account_id(&self) -> i64 {
        self.account_id
    }

    /// 释放；重复调用无副作用
    pub async fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.tracker.release(self.account_id).await;
        }
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let tracker = Arc::clone(&self.tracker);
        let account_id = self.account_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    tracker.release(account_id).await;
                });
            }
            Err(_) => {
                lwarn!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Tracker,
                    "lease_drop",
                    "运行时已关闭，连接计数未释放",
                    account_id = account_id
                );
            }
        }
    }
}
