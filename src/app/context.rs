//! 应用上下文
//!
//! 统一持有跨模块共享的组件实例，处理器通过 `State<Arc<AppContext>>` 取用。
//! 测试使用 [`AppContext::in_memory`] 注入内存实现。

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::app::metrics::{Gauges, Metrics};
use crate::auth::AuthGate;
use crate::balancer::LoadBalancer;
use crate::batch::BatchRegistry;
use crate::config::{AppConfig, ConfigManager};
use crate::ephemeral::conversation::{DEFAULT_CONVERSATION_TTL, DEFAULT_MAX_CONVERSATIONS};
use crate::ephemeral::{
    AuditLogger, ConversationStore, DedupStore, KvAuditLogger, KvConversationStore,
    MemoryConversationStore, build_dedup_store,
};
use crate::error::Result;
use crate::handler::files::FileCache;
use crate::handler::imagine::ImagineSessions;
use crate::limiter::ConcurrencyLimiter;
use crate::logging::{LogComponent, LogStage};
use crate::provider::grok::GrokProvider;
use crate::provider::orchids::OrchidsProvider;
use crate::provider::warp::WarpProvider;
use crate::provider::{ProviderRegistry, SessionRegistry};
use crate::reliability::CircuitBreakerManager;
use crate::store::{KvBackend, RedisKv, Store};
use crate::token_cache::{TokenCache, build_token_cache};
use crate::tracker::{ConnTracker, KvConnTracker, MemoryConnTracker};
use crate::linfo;

/// 共享组件集合
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ConfigManager>,
    pub store: Store,
    pub balancer: Arc<LoadBalancer>,
    pub providers: Arc<ProviderRegistry>,
    pub sessions: Arc<SessionRegistry>,
    pub limiter: Arc<ConcurrencyLimiter>,
    pub batches: Arc<BatchRegistry>,
    pub auth: Arc<AuthGate>,
    pub dedup: Option<Arc<dyn DedupStore>>,
    pub conversations: Arc<dyn ConversationStore>,
    pub audit: Arc<dyn AuditLogger>,
    pub token_cache: Option<Arc<dyn TokenCache>>,
    pub breakers: Arc<CircuitBreakerManager>,
    pub files: Arc<FileCache>,
    pub imagine: Arc<ImagineSessions>,
    pub metrics: Arc<Metrics>,
    /// 后台循环与批量任务的根取消令牌
    pub shutdown: CancellationToken,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("providers", &self.providers)
            .field("batches", &self.batches.len())
            .finish_non_exhaustive()
    }
}

/// 默认注册 Orchids、Warp、Grok 三个上游，Orchids 为回退
pub fn default_providers(config: &AppConfig, sessions: &Arc<SessionRegistry>) -> Result<ProviderRegistry> {
    let mut registry = ProviderRegistry::new();
    registry.register(Arc::new(OrchidsProvider::new(
        config.orchids.clone(),
        Arc::clone(sessions),
    )?));
    registry.register(Arc::new(WarpProvider::new(config.warp.clone(), Arc::clone(sessions))?));
    registry.register(Arc::new(GrokProvider::new(config.grok.clone())?));
    Ok(registry)
}

impl AppContext {
    /// 按配置连接 Redis 或退回内存后端，组装全部组件
    pub async fn initialize(config: Arc<ConfigManager>) -> Result<Self> {
        let cfg = config.get_config().await;
        let sessions = Arc::new(SessionRegistry::new());
        let providers = default_providers(&cfg, &sessions)?;

        if cfg.redis.enabled {
            let kv: Arc<dyn KvBackend> = Arc::new(
                RedisKv::connect(
                    &cfg.redis.build_url(),
                    Duration::from_secs(cfg.redis.connection_timeout.max(1)),
                )
                .await?,
            );
            let store = Store::new(
                Arc::clone(&kv),
                &cfg.redis.prefix,
                Duration::from_millis(cfg.store.read_cache_ttl_ms),
            );
            let tracker: Arc<dyn ConnTracker> =
                Arc::new(KvConnTracker::new(Arc::clone(&kv), store.keys().clone()).await?);
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Main,
                "initialize",
                "使用 Redis 存储后端",
                prefix = %cfg.redis.prefix
            );
            Ok(Self::assemble(config, &cfg, store, tracker, providers, sessions, true))
        } else {
            let store = Store::new(
                Arc::new(crate::store::MemoryKv::new()),
                &cfg.redis.prefix,
                Duration::from_millis(cfg.store.read_cache_ttl_ms),
            );
            linfo!(
                "system",
                LogStage::Startup,
                LogComponent::Main,
                "initialize",
                "Redis 未启用，使用内存存储后端"
            );
            Ok(Self::assemble(
                config,
                &cfg,
                store,
                Arc::new(MemoryConnTracker::new()),
                providers,
                sessions,
                false,
            ))
        }
    }

    /// 全内存上下文；需要在 tokio 运行时内调用
    #[must_use]
    pub fn in_memory(cfg: AppConfig, providers: ProviderRegistry) -> Self {
        let store = Store::in_memory(&cfg.redis.prefix);
        let config = Arc::new(ConfigManager::new(cfg.clone()));
        Self::assemble(
            config,
            &cfg,
            store,
            Arc::new(MemoryConnTracker::new()),
            providers,
            Arc::new(SessionRegistry::new()),
            false,
        )
    }

    /// `shared` 为真时去重、会话、token 缓存走 KV 以便多实例共享
    fn assemble(
        config: Arc<ConfigManager>,
        cfg: &AppConfig,
        store: Store,
        tracker: Arc<dyn ConnTracker>,
        providers: ProviderRegistry,
        sessions: Arc<SessionRegistry>,
        shared: bool,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let kv = store.kv();
        let keys = store.keys().clone();
        let shared_kv = || shared.then(|| (Arc::clone(&kv), keys.clone()));

        let conversations: Arc<dyn ConversationStore> = if shared {
            Arc::new(KvConversationStore::new(
                Arc::clone(&kv),
                keys.clone(),
                DEFAULT_CONVERSATION_TTL,
            ))
        } else {
            Arc::new(MemoryConversationStore::new(
                DEFAULT_CONVERSATION_TTL,
                DEFAULT_MAX_CONVERSATIONS,
            ))
        };

        Self {
            balancer: Arc::new(LoadBalancer::new(store.clone(), tracker, &cfg.balancer)),
            providers: Arc::new(providers),
            sessions,
            limiter: Arc::new(ConcurrencyLimiter::new(&cfg.limiter)),
            batches: Arc::new(BatchRegistry::new(
                Duration::from_secs(cfg.batch.task_ttl_secs),
                shutdown.clone(),
            )),
            auth: Arc::new(AuthGate::new(Arc::clone(&config), store.clone(), &cfg.auth)),
            dedup: build_dedup_store(&cfg.dedup, shared_kv()),
            conversations,
            audit: Arc::new(KvAuditLogger::start(Arc::clone(&kv), &keys, 0)),
            token_cache: build_token_cache(&cfg.token_cache, shared_kv()),
            breakers: Arc::new(CircuitBreakerManager::from_config(&cfg.reliability)),
            files: Arc::new(FileCache::from_data_dir(&cfg.server.data_dir)),
            imagine: Arc::new(ImagineSessions::default()),
            metrics: Arc::new(Metrics::new()),
            config,
            store,
            shutdown,
        }
    }

    /// `/metrics` 渲染用的瞬时值
    pub async fn gauges(&self) -> Gauges {
        let limiter = self.limiter.stats();
        let accounts_enabled = self
            .balancer
            .enabled_accounts()
            .await
            .map_or(0, |a| a.len() as u64);
        Gauges {
            limiter_active: limiter.active,
            limiter_total: limiter.total,
            limiter_rejected: limiter.rejected,
            batch_tasks: self.batches.len() as u64,
            accounts_enabled,
        }
    }

    /// 停机收尾：取消后台任务并刷完审计缓冲
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.audit.close().await;
        self.store.close();
    }
}
