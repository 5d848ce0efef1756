//! 批量任务工作池
//!
//! 生产者把条目送入有界通道，`concurrency` 个工作协程依次领取。
//! 取消后不再领取新条目，进行中的上游请求被直接丢弃。

use std::future::Future;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::task::BatchTask;

/// 默认并发
pub const DEFAULT_BATCH_CONCURRENCY: usize = 5;
/// 并发上限
pub const MAX_BATCH_CONCURRENCY: usize = 20;

/// 单个条目的处理结果
#[derive(Debug, Clone, PartialEq)]
pub struct ItemOutcome {
    /// 结果表中的键，通常是脱敏后的 token
    pub key: String,
    pub ok: bool,
    pub payload: Value,
}

impl ItemOutcome {
    #[must_use]
    pub fn ok(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            ok: true,
            payload,
        }
    }

    #[must_use]
    pub fn fail(key: impl Into<String>, payload: Value) -> Self {
        Self {
            key: key.into(),
            ok: false,
            payload,
        }
    }
}

/// 规范化请求的并发：缺省或 0 取默认值，超过上限截断
#[must_use]
pub fn normalize_concurrency(requested: Option<usize>, default: usize, max: usize) -> usize {
    let max = if max == 0 { MAX_BATCH_CONCURRENCY } else { max };
    let default = if default == 0 {
        DEFAULT_BATCH_CONCURRENCY
    } else {
        default
    };
    match requested {
        Some(n) if n > 0 => n.min(max),
        _ => default.min(max),
    }
}

/// 结果表里的 token 显示形式：长于 20 个字符时保留首尾各 8 个
#[must_use]
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 20 {
        return token.to_string();
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 8..].iter().collect();
    format!("{head}...{tail}")
}

/// 以有界并发处理 `items`，每个结果写入 `task`
///
/// 返回时所有工作协程都已退出；是否被取消由调用方通过任务的取消令牌判断。
pub async fn run_pool<T, F, Fut>(task: &BatchTask, items: Vec<T>, concurrency: usize, worker: F)
where
    F: Fn(T, CancellationToken) -> Fut,
    Fut: Future<Output = ItemOutcome>,
{
    let concurrency = concurrency.clamp(1, MAX_BATCH_CONCURRENCY);
    let token = task.cancel_token();
    let (tx, rx) = async_channel::bounded::<T>(concurrency);

    let producer = {
        let token = token.clone();
        async move {
            for item in items {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            tx.close();
        }
    };

    let workers = (0..concurrency).map(|_| {
        let rx = rx.clone();
        let token = token.clone();
        let worker = &worker;
        async move {
            while let Ok(item) = rx.recv().await {
                if token.is_cancelled() {
                    break;
                }
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    outcome = worker(item, token.clone()) => {
                        task.record(&outcome.key, outcome.ok, outcome.payload);
                    }
                }
            }
        }
    });

    futures::join!(producer, futures::future::join_all(workers));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::task::TaskStatus;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_normalize_concurrency() {
        assert_eq!(normalize_concurrency(None, 5, 20), 5);
        assert_eq!(normalize_concurrency(Some(0), 5, 20), 5);
        assert_eq!(normalize_concurrency(Some(3), 5, 20), 3);
        assert_eq!(normalize_concurrency(Some(100), 5, 20), 20);
        assert_eq!(normalize_concurrency(None, 0, 0), 5);
    }

    #[test]
    fn test_mask_token() {
        assert_eq!(mask_token("short"), "short");
        assert_eq!(mask_token("abcdefgh0123456789XYZxyz"), "abcdefgh...9XYZxyz");
    }

    #[tokio::test]
    async fn test_run_pool_processes_all_items() {
        let task = BatchTask::new(10, CancellationToken::new());
        let peak = AtomicUsize::new(0);
        let active = AtomicUsize::new(0);
        run_pool(&task, (0..10).collect(), 3, |i: i32, _| {
            let peak = &peak;
            let active = &active;
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::task::yield_now().await;
                active.fetch_sub(1, Ordering::SeqCst);
                if i % 2 == 0 {
                    ItemOutcome::ok(format!("t{i}"), json!({"success": true}))
                } else {
                    ItemOutcome::fail(format!("t{i}"), json!({"error": "bad"}))
                }
            }
        })
        .await;
        let snap = task.snapshot();
        assert_eq!((snap.processed, snap.ok, snap.fail), (10, 5, 5));
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(snap.status, TaskStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_new_work() {
        let token = CancellationToken::new();
        let task = BatchTask::new(100, token.clone());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            canceller.cancel();
        });
        run_pool(&task, (0..100).collect(), 2, |i: i32, _| async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            ItemOutcome::ok(i.to_string(), json!(null))
        })
        .await;
        let snap = task.snapshot();
        assert!(snap.processed < 100);
        assert_eq!(snap.processed, snap.ok + snap.fail);
        assert_eq!(snap.processed, 4);
    }
}
