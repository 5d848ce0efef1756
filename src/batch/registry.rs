//! 任务注册表：id → 任务，终态后按 TTL 定时删除

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::task::{BatchTask, TaskStatus};
use crate::error::Result;
use crate::{ldebug, lerror};
use crate::logging::{LogComponent, LogStage};

/// 默认保留时间
pub const DEFAULT_TASK_TTL: Duration = Duration::from_secs(5 * 60);

/// 批量任务注册表
#[derive(Debug)]
pub struct BatchRegistry {
    ttl: Duration,
    /// 停机时取消所有任务
    root: CancellationToken,
    tasks: Mutex<HashMap<String, Arc<BatchTask>>>,
}

impl Default for BatchRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_TASK_TTL, CancellationToken::new())
    }
}

impl BatchRegistry {
    #[must_use]
    pub fn new(ttl: Duration, root: CancellationToken) -> Self {
        Self {
            ttl: if ttl.is_zero() { DEFAULT_TASK_TTL } else { ttl },
            root,
            tasks: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<BatchTask>>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记一个新任务
    pub fn create(&self, total: usize) -> Arc<BatchTask> {
        let task = Arc::new(BatchTask::new(total, self.root.child_token()));
        self.lock().insert(task.id().to_string(), task.clone());
        task
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<BatchTask>> {
        self.lock().get(id.trim()).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<Arc<BatchTask>> {
        self.lock().remove(id.trim())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// TTL 后删除任务
    pub fn schedule_removal(self: &Arc<Self>, id: String) {
        let registry = Arc::clone(self);
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if registry.remove(&id).is_some() {
                ldebug!(
                    "system",
                    LogStage::Background,
                    LogComponent::Batch,
                    "task_purged",
                    "批量任务已清理",
                    task_id = %id
                );
            }
        });
    }

    /// 创建任务并在后台运行 `job`
    ///
    /// 取消令牌被触发时任务以 cancelled 结束；`job` 出错以 error 结束；
    /// 否则写入返回的结果并以 done 结束。终态后按 TTL 清理。
    pub fn spawn<F, Fut>(self: &Arc<Self>, total: usize, job: F) -> Arc<BatchTask>
    where
        F: FnOnce(Arc<BatchTask>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
    {
        let task = self.create(total);
        let registry = Arc::clone(self);
        let runner = Arc::clone(&task);
        tokio::spawn(async move {
            let outcome = tokio::spawn(job(Arc::clone(&runner))).await;
            let token = runner.cancel_token();
            match outcome {
                Err(join_err) => {
                    lerror!(
                        "system",
                        LogStage::Batch,
                        LogComponent::Batch,
                        "task_panicked",
                        "批量任务异常退出",
                        task_id = %runner.id(),
                        error = %join_err
                    );
                    runner.finish(TaskStatus::Error, Some("task panicked".to_string()));
                }
                _ if token.is_cancelled() => {
                    runner.finish(TaskStatus::Cancelled, None);
                }
                Ok(Ok(result)) => {
                    if let Some(result) = result {
                        runner.set_result(result);
                    }
                    runner.finish(TaskStatus::Done, None);
                }
                Ok(Err(e)) => {
                    runner.finish(TaskStatus::Error, Some(e.public_message()));
                }
            }
            registry.schedule_removal(runner.id().to_string());
        });
        task
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_spawn_finishes_and_purges_after_ttl() {
        let registry = Arc::new(BatchRegistry::new(Duration::from_secs(300), CancellationToken::new()));
        let task = registry.spawn(1, |task| async move {
            task.record("a", true, json!(true));
            Ok(Some(json!({"n": 1})))
        });
        task.wait_done().await;
        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Done);
        assert_eq!(snap.result, Some(json!({"n": 1})));
        assert!(registry.get(task.id()).is_some());

        tokio::time::sleep(Duration::from_secs(301)).await;
        assert!(registry.get(task.id()).is_none());
    }

    #[tokio::test]
    async fn test_spawn_error_status() {
        let registry = Arc::new(BatchRegistry::default());
        let task = registry.spawn(0, |_| async { Err(ProxyError::validation("no tokens available")) });
        task.wait_done().await;
        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("no tokens available"));
    }

    #[tokio::test]
    async fn test_root_cancel_reaches_tasks() {
        let root = CancellationToken::new();
        let registry = Arc::new(BatchRegistry::new(Duration::from_secs(1), root.clone()));
        let task = registry.spawn(1, |task| async move {
            task.cancel_token().cancelled().await;
            Ok(None)
        });
        root.cancel();
        task.wait_done().await;
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_job_ends_in_error_and_purges() {
        let registry = Arc::new(BatchRegistry::new(Duration::from_secs(60), CancellationToken::new()));
        let task = registry.spawn(2, |task| async move {
            task.record("a", true, json!(true));
            let missing: Option<Value> = None;
            Ok(Some(missing.expect("worker exploded")))
        });
        tokio::time::timeout(Duration::from_secs(5), task.wait_done())
            .await
            .expect("panicked task must reach a terminal state");

        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("task panicked"));
        assert_eq!(snap.processed, 1);
        assert!(task.is_done());

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(registry.get(task.id()).is_none());
    }
}
