//! # 熔断器
//!
//! 三态熔断：Closed 状态按统计窗口累计请求与失败，失败率超过阈值且请求数达到下限时跳闸；
//! Open 状态在超时后转入 HalfOpen；HalfOpen 最多放行 `max_requests` 个探测请求，
//! 全部成功后闭合，任一失败重新打开。

use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::config::ReliabilityConfig;
use crate::error::classify::{UpstreamErrorCategory, classify_upstream_error};
use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 熔断器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// 熔断参数
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// HalfOpen 状态下允许的探测请求数
    pub max_requests: u32,
    /// Closed 状态统计窗口，到期清零
    pub interval: Duration,
    /// Open 持续时间
    pub timeout: Duration,
    pub failure_ratio: f64,
    pub min_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&ReliabilityConfig::default())
    }
}

impl From<&ReliabilityConfig> for BreakerSettings {
    fn from(config: &ReliabilityConfig) -> Self {
        Self {
            max_requests: config.breaker_max_requests.max(1),
            interval: Duration::from_secs(config.breaker_interval_secs),
            timeout: Duration::from_secs(config.breaker_timeout_secs),
            failure_ratio: config.breaker_failure_ratio,
            min_requests: config.breaker_min_requests,
        }
    }
}

/// 当前窗口内的计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    /// Closed：窗口到期时间；Open：转 HalfOpen 的时间
    expiry: Option<Instant>,
}

/// 单个熔断器
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

/// 是否计为熔断失败：只统计上游自身故障，客户端错误、限流与取消不计
#[must_use]
pub fn counts_as_failure(err: &ProxyError) -> bool {
    matches!(
        classify_upstream_error(err).category,
        UpstreamErrorCategory::Timeout
            | UpstreamErrorCategory::Network
            | UpstreamErrorCategory::Server
            | UpstreamErrorCategory::Unknown
    ) && !matches!(err.root(), ProxyError::CircuitOpen { .. })
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let now = Instant::now();
        let expiry = (!settings.interval.is_zero()).then(|| now + settings.interval);
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前状态（会推进到期的状态转换）
    #[must_use]
    pub fn state(&self) -> BreakerState {
        let mut inner = self.lock();
        self.advance(&mut inner, Instant::now());
        inner.state
    }

    #[must_use]
    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.advance(&mut inner, Instant::now());
        inner.counts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|exp| exp <= now) {
                    self.new_generation(inner, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|exp| exp <= now) {
                    self.set_state(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed => (!self.settings.interval.is_zero()).then(|| now + self.settings.interval),
            BreakerState::Open => Some(now + self.settings.timeout),
            BreakerState::HalfOpen => None,
        };
    }

    fn set_state(&self, inner: &mut Inner, state: BreakerState, now: Instant) {
        if inner.state == state {
            return;
        }
        let from = inner.state;
        inner.state = state;
        self.new_generation(inner, now);
        linfo!(
            "system",
            LogStage::UpstreamRequest,
            LogComponent::Reliability,
            "state_change",
            "熔断器状态变更",
            breaker = %self.name,
            from = from.as_str(),
            to = state.as_str()
        );
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        if counts.requests < self.settings.min_requests.max(1) {
            return false;
        }
        f64::from(counts.total_failures) / f64::from(counts.requests) >= self.settings.failure_ratio
    }

    /// 请求前检查；返回本次请求所属的代，用于结果回报
    fn before_request(&self) -> Result<u64> {
        let mut inner = self.lock();
        let now = Instant::now();
        self.advance(&mut inner, now);
        match inner.state {
            BreakerState::Open => return Err(ProxyError::circuit_open(self.name.clone())),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                return Err(ProxyError::circuit_open(self.name.clone()));
            }
            _ => {}
        }
        inner.counts.on_request();
        Ok(inner.generation)
    }

    fn after_request(&self, generation: u64, success: bool) {
        let mut inner = self.lock();
        let now = Instant::now();
        self.advance(&mut inner, now);
        // 跨代的结果已经没有意义
        if inner.generation != generation {
            return;
        }
        if success {
            inner.counts.on_success();
            if inner.state == BreakerState::HalfOpen
                && inner.counts.consecutive_successes >= self.settings.max_requests
            {
                self.set_state(&mut inner, BreakerState::Closed, now);
            }
        } else {
            inner.counts.on_failure();
            match inner.state {
                BreakerState::Closed if self.ready_to_trip(&inner.counts) => {
                    self.set_state(&mut inner, BreakerState::Open, now);
                }
                BreakerState::HalfOpen => self.set_state(&mut inner, BreakerState::Open, now),
                _ => {}
            }
        }
    }

    /// 在熔断保护下执行
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let generation = self.before_request()?;
        let result = op().await;
        let success = match &result {
            Ok(_) => true,
            Err(e) => !counts_as_failure(e),
        };
        self.after_request(generation, success);
        result
    }
}
