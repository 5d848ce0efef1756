//! # 指数退避重试

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ReliabilityConfig;
use crate::error::classify::is_retryable;
use crate::error::{ProxyError, Result};
use crate::ldebug;
use crate::logging::{LogComponent, LogStage};

/// 重试参数
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// 抖动比例，0.1 表示 ±10%
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&ReliabilityConfig::default())
    }
}

impl From<&ReliabilityConfig> for RetryConfig {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_retries: config.retry_max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            multiplier: config.retry_multiplier,
            jitter: config.retry_jitter,
        }
    }
}

impl RetryConfig {
    /// 第 `attempt` 次重试（从 0 开始）前的等待时间，不含抖动
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(i32::try_from(attempt).unwrap_or(i32::MAX));
        let millis = self.initial_delay.as_secs_f64() * 1000.0 * factor;
        let capped = millis.min(self.max_delay.as_secs_f64() * 1000.0);
        Duration::from_secs_f64((capped / 1000.0).max(0.0))
    }

    /// 含抖动的等待时间
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let spread = fastrand::f64().mul_add(2.0, -1.0) * jitter;
        base.mul_f64((1.0 + spread).max(0.0)).min(self.max_delay)
    }
}

/// 按退避策略重试 `op`；不可重试的错误立即返回，取消时返回 `Cancelled`
pub async fn retry_with_backoff<T, F, Fut>(
    token: &CancellationToken,
    config: &RetryConfig,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(ProxyError::cancelled("retry cancelled"));
        }
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if attempt >= config.max_retries || !is_retryable(&err) {
            return Err(err);
        }
        let delay = config.delay(attempt);
        ldebug!(
            "system",
            LogStage::UpstreamRequest,
            LogComponent::Reliability,
            "retry",
            "等待后重试",
            attempt = attempt + 1,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %err
        );
        tokio::select! {
            () = token.cancelled() => return Err(ProxyError::cancelled("retry cancelled")),
            () = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}
