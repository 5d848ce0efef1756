//! # 后台循环
//!
//! 每个循环持有根取消令牌的子令牌，停止时取消并等待循环退出。

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::app::AppContext;
use crate::app::task_scheduler::{ScheduledTask, TaskScheduler};
use crate::error::Result;
use crate::handler::admin::jobs::refresh_one;
use crate::logging::{LogComponent, LogStage};
use crate::provider::warp::{PROVIDER_NAME as WARP, TOKEN_MARGIN};
use crate::{ldebug, lwarn};

const DEDUP_SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const CONVERSATION_CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const TOKEN_CACHE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const AUTH_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const IMAGINE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const KV_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// 后台任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// Warp 账号临近过期时提前刷新
    WarpTokenRefresh,
    DedupSweep,
    ConversationCleanup,
    TokenCacheSweep,
    /// 管理会话与 `task_id` 授权
    AuthSweep,
    ImagineSweep,
    /// 内存 KV 的过期键
    KvSweep,
}

/// 固定周期执行的循环
#[derive(Debug)]
pub struct PeriodicLoop {
    task_type: TaskType,
    period: Duration,
    token: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicLoop {
    #[must_use]
    pub fn new(task_type: TaskType, period: Duration, root: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            task_type,
            period: period.max(Duration::from_millis(10)),
            token: root.child_token(),
            handle: Mutex::new(None),
        })
    }

    /// 启动循环；首个周期结束后才第一次执行 `tick`
    pub fn start<F, Fut>(&self, tick: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.clone();
        let period = self.period;
        let task_type = self.task_type;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            ldebug!(
                "system",
                LogStage::Background,
                LogComponent::Main,
                "loop_exit",
                "后台循环已退出",
                task = ?task_type
            );
        });
        let previous = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// 取消并等待循环退出
    pub async fn stop(&self) {
        self.token.cancel();
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

fn periodic_task<F, Fut>(
    ctx: &Arc<AppContext>,
    task_type: TaskType,
    period: Duration,
    tick: F,
) -> ScheduledTask
where
    F: Fn(Arc<AppContext>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let periodic = PeriodicLoop::new(task_type, period, &ctx.shutdown);
    let tick = Arc::new(tick);
    let starter = Arc::clone(&periodic);
    let ctx = Arc::clone(ctx);
    ScheduledTask::new(task_type, move || {
        let tick = Arc::clone(&tick);
        let ctx = Arc::clone(&ctx);
        starter.start(move || tick(Arc::clone(&ctx)));
        async { Ok(()) }
    })
    .on_stop(move || {
        let periodic = Arc::clone(&periodic);
        async move {
            periodic.stop().await;
            Ok(())
        }
    })
}

fn log_swept(task: &str, removed: usize) {
    if removed > 0 {
        ldebug!(
            "system",
            LogStage::Background,
            LogComponent::Main,
            task,
            "清理过期条目",
            removed = removed
        );
    }
}

/// 刷新临近过期的 Warp 会话；单个失败只记日志
pub async fn refresh_expiring_warp(ctx: Arc<AppContext>) {
    let accounts = match ctx.store.get_enabled_accounts().await {
        Ok(accounts) => accounts,
        Err(e) => {
            lwarn!(
                "system",
                LogStage::Background,
                LogComponent::Warp,
                "refresh_loop",
                "读取账号失败，跳过本轮刷新",
                error = %e
            );
            return;
        }
    };
    for account in accounts.iter().filter(|a| a.matches_channel(WARP)) {
        if ctx.shutdown.is_cancelled() {
            return;
        }
        let session = ctx.sessions.get_or_create(WARP, account);
        if !session.expiring_within(TOKEN_MARGIN).await {
            continue;
        }
        match refresh_one(&ctx, account).await {
            Ok(_) => ldebug!(
                "system",
                LogStage::Background,
                LogComponent::Warp,
                "refresh_loop",
                "Warp 会话已提前刷新",
                account_id = account.id
            ),
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Background,
                    LogComponent::Warp,
                    "refresh_loop",
                    "Warp 会话刷新失败",
                    account_id = account.id,
                    error = %e
                );
                ctx.balancer
                    .mark_account_status("system", account, &e.to_string())
                    .await;
            }
        }
    }
}

/// 后台任务集合
pub struct AppTasks {
    scheduler: Arc<TaskScheduler>,
}

impl AppTasks {
    /// 注册全部后台循环（尚未启动）
    pub async fn initialize(ctx: &Arc<AppContext>) -> Arc<Self> {
        let cfg = ctx.config.get_config().await;
        let scheduler = Arc::new(TaskScheduler::new());
        scheduler
            .register_many(vec![
                periodic_task(
                    ctx,
                    TaskType::WarpTokenRefresh,
                    Duration::from_secs(cfg.warp.refresh_interval_secs.max(1)),
                    refresh_expiring_warp,
                ),
                periodic_task(ctx, TaskType::DedupSweep, DEDUP_SWEEP_INTERVAL, |ctx| async move {
                    if let Some(dedup) = &ctx.dedup {
                        log_swept("dedup_sweep", dedup.sweep());
                    }
                }),
                periodic_task(
                    ctx,
                    TaskType::ConversationCleanup,
                    CONVERSATION_CLEANUP_INTERVAL,
                    |ctx| async move { log_swept("conversation_cleanup", ctx.conversations.cleanup()) },
                ),
                periodic_task(
                    ctx,
                    TaskType::TokenCacheSweep,
                    TOKEN_CACHE_SWEEP_INTERVAL,
                    |ctx| async move {
                        if let Some(cache) = &ctx.token_cache {
                            cache.sweep().await;
                        }
                    },
                ),
                periodic_task(ctx, TaskType::AuthSweep, AUTH_SWEEP_INTERVAL, |ctx| async move {
                    log_swept("auth_sweep", ctx.auth.sweep());
                }),
                periodic_task(ctx, TaskType::ImagineSweep, IMAGINE_SWEEP_INTERVAL, |ctx| async move {
                    log_swept("imagine_sweep", ctx.imagine.sweep());
                }),
                periodic_task(ctx, TaskType::KvSweep, KV_SWEEP_INTERVAL, |ctx| async move {
                    log_swept("kv_sweep", ctx.store.kv().sweep_expired());
                }),
            ])
            .await;
        Arc::new(Self { scheduler })
    }

    #[must_use]
    pub fn scheduler(&self) -> Arc<TaskScheduler> {
        Arc::clone(&self.scheduler)
    }

    pub async fn start(&self) -> Result<()> {
        self.scheduler.start_all().await
    }

    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}
