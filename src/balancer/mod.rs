//! # 账号负载均衡
//!
//! 在启用账号中按加权最少连接选择：`score = 活跃连接 / max(权重, 1)`，
//! 只在严格最小值集合中随机挑选。账号快照带 TTL 缓存，刷新为单飞模式。

pub mod availability;
pub mod clock;

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Local, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;

pub use availability::{Availability, evaluate_availability, next_month_start};
pub use clock::{Clock, ManualClock, SystemClock};

use crate::config::BalancerConfig;
use crate::error::classify::{STATUS_QUOTA_EXCEEDED, classify_account_status};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{Account, Store};
use crate::tracker::ConnTracker;
use crate::utils::mask_secret;
use crate::{ldebug, linfo, lwarn};

struct CachedAccounts {
    accounts: Arc<Vec<Account>>,
    expires_at: Instant,
}

/// 负载均衡器
pub struct LoadBalancer {
    store: Store,
    tracker: Arc<dyn ConnTracker>,
    cache: RwLock<Option<CachedAccounts>>,
    /// 同一时刻至多一个刷新
    refresh_lock: Mutex<()>,
    cache_ttl: Duration,
    cooldown: chrono::Duration,
    clock: Arc<dyn Clock>,
    /// 计算配额重置时间用的时区；`None` 表示本地时区
    tz: Option<FixedOffset>,
}

impl std::fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("cache_ttl", &self.cache_ttl)
            .field("cooldown", &self.cooldown)
            .finish_non_exhaustive()
    }
}

impl LoadBalancer {
    #[must_use]
    pub fn new(store: Store, tracker: Arc<dyn ConnTracker>, config: &BalancerConfig) -> Self {
        let cache_ttl = if config.cache_ttl_ms == 0 {
            Duration::from_secs(5)
        } else {
            config.cache_ttl()
        };
        let cooldown = chrono::Duration::from_std(config.cooldown())
            .unwrap_or_else(|_| chrono::Duration::minutes(60));
        Self {
            store,
            tracker,
            cache: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            cache_ttl,
            cooldown,
            clock: Arc::new(SystemClock),
            tz: None,
        }
    }

    /// 替换时钟（测试使用）
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 固定配额重置使用的时区
    #[must_use]
    pub const fn with_timezone(mut self, tz: FixedOffset) -> Self {
        self.tz = Some(tz);
        self
    }

    #[must_use]
    pub fn tracker(&self) -> Arc<dyn ConnTracker> {
        Arc::clone(&self.tracker)
    }

    #[must_use]
    pub const fn store(&self) -> &Store {
        &self.store
    }

    /// 丢弃账号快照，下次选择时重新加载
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn fresh_snapshot(&self) -> Option<Arc<Vec<Account>>> {
        let guard = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|cached| Instant::now() < cached.expires_at)
            .map(|cached| Arc::clone(&cached.accounts))
    }

    /// 启用账号快照（深拷贝）
    pub async fn enabled_accounts(&self) -> Result<Vec<Account>> {
        if let Some(accounts) = self.fresh_snapshot() {
            return Ok(accounts.as_ref().clone());
        }
        let _guard = self.refresh_lock.lock().await;
        // 等锁期间可能已被其他调用刷新
        if let Some(accounts) = self.fresh_snapshot() {
            return Ok(accounts.as_ref().clone());
        }
        let accounts = Arc::new(self.store.get_enabled_accounts().await?);
        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedAccounts {
            accounts: Arc::clone(&accounts),
            expires_at: Instant::now() + self.cache_ttl,
        });
        ldebug!(
            "system",
            LogStage::Scheduling,
            LogComponent::Balancer,
            "refresh_snapshot",
            &format!("刷新账号快照，共 {} 个启用账号", accounts.len())
        );
        Ok(accounts.as_ref().clone())
    }

    fn next_reset(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.tz {
            Some(tz) => next_month_start(now, tz),
            None => next_month_start(now, &Local),
        }
    }

    fn availability(&self, account: &Account, now: DateTime<Utc>) -> Availability {
        match &self.tz {
            Some(tz) => evaluate_availability(account, now, self.cooldown, tz),
            None => evaluate_availability(account, now, self.cooldown, &Local),
        }
    }

    /// 选出下一个账号
    ///
    /// 依次过滤：排除列表、渠道不匹配、不可用。选中后先递增请求计数再返回。
    pub async fn next_account(
        &self,
        request_id: &str,
        exclude_ids: &[i64],
        channel: &str,
    ) -> Result<Account> {
        let accounts = self.enabled_accounts().await?;
        let excluded: HashSet<i64> = exclude_ids.iter().copied().collect();
        let now = self.clock.now();

        let mut candidates = Vec::with_capacity(accounts.len());
        for mut account in accounts {
            if excluded.contains(&account.id) || !account.matches_channel(channel) {
                continue;
            }
            match self.availability(&account, now) {
                Availability::Available => candidates.push(account),
                Availability::Recovered => {
                    let fresh = self
                        .update_status(
                            request_id,
                            account.id,
                            "冷却或配额窗口结束，自动恢复",
                            Account::clear_status,
                        )
                        .await;
                    match fresh {
                        Some(fresh) if fresh.enabled => candidates.push(fresh),
                        Some(_) => {}
                        None => {
                            account.clear_status();
                            candidates.push(account);
                        }
                    }
                }
                Availability::QuotaPending(reset_at) => {
                    self.update_status(request_id, account.id, "记录配额重置时间", |current| {
                        current.quota_reset_at = Some(reset_at);
                    })
                    .await;
                }
                Availability::Unavailable => {}
            }
        }

        if candidates.is_empty() {
            return Err(ProxyError::no_available_account(format!(
                "no enabled accounts available for channel: {channel}"
            )));
        }

        let ids: Vec<i64> = candidates.iter().map(|a| a.id).collect();
        let counts = self.tracker.get_counts(&ids).await;
        let scored: Vec<(i64, i64)> = candidates
            .iter()
            .map(|a| (counts.get(&a.id).copied().unwrap_or(0), a.effective_weight()))
            .collect();
        let best = select_least_loaded(&scored);
        let index = best[fastrand::usize(..best.len())];
        let mut account = candidates.swap_remove(index);

        match self.store.increment_request_count(account.id).await {
            Ok(count) => account.request_count = count,
            Err(e) => lwarn!(
                request_id,
                LogStage::Scheduling,
                LogComponent::Balancer,
                "increment_request_count",
                "请求计数递增失败",
                account_id = account.id,
                error = %e
            ),
        }

        linfo!(
            request_id,
            LogStage::Scheduling,
            LogComponent::Balancer,
            "account_selected",
            "选中账号",
            account_id = account.id,
            account_name = %account.name,
            channel = %account.channel(),
            session = %mask_secret(&account.session_id),
            active = scored[index].0
        );
        Ok(account)
    }

    /// 根据错误文本标记账号状态；无法归类为账号问题时不做任何事
    pub async fn mark_account_status(&self, request_id: &str, account: &Account, message: &str) {
        let status = classify_account_status(message);
        if status.is_empty() {
            return;
        }
        let mut updated = match self.store.get_account(account.id).await {
            Ok(current) => current,
            Err(_) => account.clone(),
        };
        let now = self.clock.now();
        updated.status_code.clone_from(&status);
        updated.last_attempt = Some(now);
        if status == STATUS_QUOTA_EXCEEDED {
            updated.quota_reset_at = self.next_reset(now);
        }
        self.persist_status(request_id, &updated, "上游错误").await;
    }

    /// 重新读取账号后只改状态字段再写回；读不到时放弃写入
    async fn update_status<F>(
        &self,
        request_id: &str,
        account_id: i64,
        reason: &str,
        apply: F,
    ) -> Option<Account>
    where
        F: FnOnce(&mut Account),
    {
        let mut current = match self.store.get_account(account_id).await {
            Ok(current) => current,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::Scheduling,
                    LogComponent::Balancer,
                    "update_status",
                    "读取账号失败，跳过状态写入",
                    account_id = account_id,
                    reason = reason,
                    error = %e
                );
                return None;
            }
        };
        apply(&mut current);
        self.persist_status(request_id, &current, reason).await;
        Some(current)
    }

    /// 状态写入是尽力而为：失败只记日志
    async fn persist_status(&self, request_id: &str, account: &Account, reason: &str) {
        match self.store.update_account(account).await {
            Ok(()) => {
                self.invalidate();
                linfo!(
                    request_id,
                    LogStage::Scheduling,
                    LogComponent::Balancer,
                    "persist_status",
                    "账号状态已更新",
                    account_id = account.id,
                    status = %account.status_code,
                    reason = reason
                );
            }
            Err(e) => lwarn!(
                request_id,
                LogStage::Scheduling,
                LogComponent::Balancer,
                "persist_status",
                "账号状态更新失败",
                account_id = account.id,
                reason = reason,
                error = %e
            ),
        }
    }
}

/// 返回得分严格最小的下标集合；入参为 (活跃连接, 权重)
///
/// 以交叉相乘比较 `c1/w1` 与 `c2/w2`，避免浮点误差。
#[must_use]
pub fn select_least_loaded(scored: &[(i64, i64)]) -> Vec<usize> {
    let mut best: Vec<usize> = Vec::new();
    for (i, &(conns, weight)) in scored.iter().enumerate() {
        let Some(&first) = best.first() else {
            best.push(i);
            continue;
        };
        let (best_conns, best_weight) = scored[first];
        let lhs = i128::from(conns) * i128::from(best_weight.max(1));
        let rhs = i128::from(best_conns) * i128::from(weight.max(1));
        match lhs.cmp(&rhs) {
            std::cmp::Ordering::Less => {
                best.clear();
                best.push(i);
            }
            std::cmp::Ordering::Equal => best.push(i),
            std::cmp::Ordering::Greater => {}
        }
    }
    best
}
