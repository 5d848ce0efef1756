//! 有界并发映射

use std::future::Future;

use futures::stream::{self, StreamExt};

/// 少于该数量时顺序执行
pub const PARALLEL_THRESHOLD: usize = 8;

/// 以最多 `concurrency` 个并发执行 `f`，结果顺序与输入一致
pub async fn parallel_map<T, R, F, Fut>(items: Vec<T>, concurrency: usize, f: F) -> Vec<R>
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = R>,
{
    if items.len() < PARALLEL_THRESHOLD || concurrency <= 1 {
        let mut out = Vec::with_capacity(items.len());
        for item in items {
            out.push(f(item).await);
        }
        return out;
    }
    stream::iter(items.into_iter().map(f))
        .buffered(concurrency)
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_preserves_order() {
        let items: Vec<u64> = (0..20).collect();
        let out = parallel_map(items, 4, |n| async move {
            tokio::time::sleep(Duration::from_millis(20 - n)).await;
            n * 2
        })
        .await;
        assert_eq!(out, (0..20).map(|n| n * 2).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_respects_concurrency_bound() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let items: Vec<usize> = (0..16).collect();
        parallel_map(items, 3, |_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }
        })
        .await;
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_small_input_runs_sequentially() {
        let out = parallel_map(vec![1, 2, 3], 8, |n| async move { n + 1 }).await;
        assert_eq!(out, vec![2, 3, 4]);
    }
}
