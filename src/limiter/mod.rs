//! # 并发限流
//!
//! 计数信号量 + 自适应等待超时。等待时间取最近 100 次请求耗时的 p95 的 1.5 倍，
//! 限制在 5s 到 60s 之间，并且不超过全局超时。
//!
//! 槽位随响应体一起释放：流式响应在整个流结束前都占用槽位，全局超时同样覆盖响应体。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use axum::{
    body::Body,
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::LimiterConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lwarn};

/// 排队超时返回给客户端的固定文案
pub const BUSY_MESSAGE: &str = "Request timed out while waiting for a worker slot or server busy";

const RING_SIZE: usize = 100;
const MIN_SAMPLES: usize = 10;
const MIN_ADAPTIVE_WAIT: Duration = Duration::from_secs(5);
const MAX_ADAPTIVE_WAIT: Duration = Duration::from_secs(60);

/// 定长耗时环形缓冲
#[derive(Debug)]
struct LatencyRing {
    samples: [u64; RING_SIZE],
    len: usize,
    next: usize,
}

impl LatencyRing {
    const fn new() -> Self {
        Self {
            samples: [0; RING_SIZE],
            len: 0,
            next: 0,
        }
    }

    fn push(&mut self, millis: u64) {
        self.samples[self.next] = millis;
        self.next = (self.next + 1) % RING_SIZE;
        self.len = (self.len + 1).min(RING_SIZE);
    }

    fn p95(&self) -> Option<u64> {
        if self.len < MIN_SAMPLES {
            return None;
        }
        let mut sorted = self.samples[..self.len].to_vec();
        sorted.sort_unstable();
        let rank = (self.len * 95).div_ceil(100).max(1);
        sorted.get(rank - 1).copied()
    }
}

/// 限流统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LimiterStats {
    pub active: u64,
    pub total: u64,
    pub rejected: u64,
    pub max_concurrent: usize,
    pub wait_timeout_ms: u64,
}

/// 并发限流器
#[derive(Debug)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    timeout: Duration,
    wait_timeout: Duration,
    adaptive: bool,
    latencies: Mutex<LatencyRing>,
    active: AtomicU64,
    total: AtomicU64,
    rejected: AtomicU64,
}

/// 占用中的槽位；释放时记录耗时
#[derive(Debug)]
pub struct LimiterSlot<'a> {
    limiter: &'a ConcurrencyLimiter,
    started: Instant,
    _permit: OwnedSemaphorePermit,
}

impl Drop for LimiterSlot<'_> {
    fn drop(&mut self) {
        self.limiter.release(self.started);
    }
}

/// 可随响应体移动的槽位
#[derive(Debug)]
pub struct OwnedLimiterSlot {
    limiter: Arc<ConcurrencyLimiter>,
    started: Instant,
    _permit: OwnedSemaphorePermit,
}

impl OwnedLimiterSlot {
    /// 槽位起始时间加全局超时
    #[must_use]
    pub fn deadline(&self) -> Instant {
        self.started + self.limiter.timeout
    }
}

impl Drop for OwnedLimiterSlot {
    fn drop(&mut self) {
        self.limiter.release(self.started);
    }
}

impl ConcurrencyLimiter {
    #[must_use]
    pub fn new(config: &LimiterConfig) -> Self {
        let max_concurrent = config.max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            timeout: Duration::from_millis(config.timeout_ms.max(1)),
            wait_timeout: Duration::from_millis(config.wait_timeout_ms.max(1)),
            adaptive: config.adaptive,
            latencies: Mutex::new(LatencyRing::new()),
            active: AtomicU64::new(0),
            total: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    fn release(&self, started: Instant) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        if self.adaptive {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.record_latency(elapsed);
        }
    }

    fn record_latency(&self, millis: u64) {
        self.latencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(millis);
    }

    /// 当前排队等待上限
    #[must_use]
    pub fn wait_timeout(&self) -> Duration {
        let mut wait = self.wait_timeout;
        if self.adaptive {
            let p95 = self
                .latencies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .p95();
            if let Some(p95) = p95 {
                wait = Duration::from_millis(p95.saturating_mul(3) / 2)
                    .clamp(MIN_ADAPTIVE_WAIT, MAX_ADAPTIVE_WAIT);
            }
        }
        wait.min(self.timeout)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        let wait = self.wait_timeout();
        let permit = match tokio::time::timeout(wait, self.semaphore.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ProxyError::capacity(BUSY_MESSAGE)),
            Err(_) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                lwarn!(
                    "system",
                    LogStage::Scheduling,
                    LogComponent::Limiter,
                    "rejected",
                    "等待并发槽位超时",
                    wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                    active = self.active.load(Ordering::Relaxed)
                );
                return Err(ProxyError::capacity(BUSY_MESSAGE));
            }
        };
        self.active.fetch_add(1, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(permit)
    }

    /// 获取一个槽位，超过等待上限返回 `Capacity`
    pub async fn acquire(&self) -> Result<LimiterSlot<'_>> {
        let permit = self.acquire_permit().await?;
        Ok(LimiterSlot {
            limiter: self,
            started: Instant::now(),
            _permit: permit,
        })
    }

    /// 获取一个可移动的槽位，供响应体持有
    pub async fn acquire_owned(self: &Arc<Self>) -> Result<OwnedLimiterSlot> {
        let permit = self.acquire_permit().await?;
        Ok(OwnedLimiterSlot {
            limiter: Arc::clone(self),
            started: Instant::now(),
            _permit: permit,
        })
    }

    fn timeout_error(&self) -> ProxyError {
        ProxyError::upstream_timeout(
            "limiter",
            u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
        )
    }

    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        LimiterStats {
            active: self.active.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            max_concurrent: self.max_concurrent,
            wait_timeout_ms: u64::try_from(self.wait_timeout().as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// axum 中间件：排队、超时与统计
///
/// 响应头必须在全局超时内返回；之后槽位移入响应体，到期时响应体被截断。
pub async fn concurrency_middleware(
    State(limiter): State<Arc<ConcurrencyLimiter>>,
    request: Request,
    next: Next,
) -> Result<Response> {
    let slot = limiter.acquire_owned().await?;
    let deadline = slot.deadline();
    let Ok(response) = tokio::time::timeout_at(deadline, next.run(request)).await else {
        ldebug!(
            "system",
            LogStage::Response,
            LogComponent::Limiter,
            "handler_timeout",
            "请求处理超过全局超时"
        );
        return Err(limiter.timeout_error());
    };

    let (parts, body) = response.into_parts();
    let body = body
        .into_data_stream()
        .take_until(tokio::time::sleep_until(deadline))
        .map(move |chunk| {
            let _held = &slot;
            chunk
        });
    Ok(Response::from_parts(parts, Body::from_stream(body)))
}
