//! # 可靠性组件
//!
//! 每个上游一个熔断器，外层熔断、内层指数退避重试。

pub mod breaker;
pub mod retry;

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker, Counts, counts_as_failure};
pub use retry::{RetryConfig, retry_with_backoff};

use crate::config::ReliabilityConfig;
use crate::error::Result;

/// 熔断器状态快照
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub counts: Counts,
}

/// 按上游名称管理熔断器
#[derive(Debug)]
pub struct CircuitBreakerManager {
    settings: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Default for CircuitBreakerManager {
    fn default() -> Self {
        Self::new(BreakerSettings::default())
    }
}

impl CircuitBreakerManager {
    #[must_use]
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: DashMap::new(),
        }
    }

    #[must_use]
    pub fn from_config(config: &ReliabilityConfig) -> Self {
        Self::new(BreakerSettings::from(config))
    }

    /// 获取或创建指定上游的熔断器
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.settings.clone())))
            .clone()
    }

    /// 所有熔断器的状态，按名称排序
    #[must_use]
    pub fn states(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<BreakerSnapshot> = self
            .breakers
            .iter()
            .map(|entry| BreakerSnapshot {
                name: entry.key().clone(),
                state: entry.value().state(),
                counts: entry.value().counts(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// 熔断包裹重试：熔断打开时直接返回 `CircuitOpen`，不会进入重试
    pub async fn execute<T, F, Fut>(
        &self,
        name: &str,
        token: &CancellationToken,
        retry: &RetryConfig,
        op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        execute_with_breaker_and_retry(&self.get(name), token, retry, op).await
    }
}

/// 熔断在外、重试在内
pub async fn execute_with_breaker_and_retry<T, F, Fut>(
    breaker: &CircuitBreaker,
    token: &CancellationToken,
    retry: &RetryConfig,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    breaker
        .call(|| retry_with_backoff(token, retry, op))
        .await
}
