//! # 后台任务调度器
//!
//! 统一注册、启动与停止后台循环；停止按注册的逆序进行。

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::app::tasks::TaskType;
use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{lerror, linfo};

type TaskFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;
type TaskAction = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// 调度任务定义
#[derive(Clone)]
pub struct ScheduledTask {
    task_type: TaskType,
    start: TaskAction,
    stop: Option<TaskAction>,
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask")
            .field("task_type", &self.task_type)
            .field("has_stop", &self.stop.is_some())
            .finish()
    }
}

impl ScheduledTask {
    /// 以启动逻辑创建任务
    #[must_use]
    pub fn new<F, Fut>(task_type: TaskType, start: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            task_type,
            start: Arc::new(move || Box::pin(start())),
            stop: None,
        }
    }

    /// 注册停止逻辑
    #[must_use]
    pub fn on_stop<F, Fut>(mut self, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.stop = Some(Arc::new(move || Box::pin(action())));
        self
    }

    #[must_use]
    pub const fn task_type(&self) -> TaskType {
        self.task_type
    }

    async fn start(&self) -> Result<()> {
        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::Main,
            "task_start",
            "启动后台任务",
            task = ?self.task_type
        );
        (self.start)().await
    }

    async fn stop(&self) -> Result<()> {
        let Some(action) = &self.stop else {
            return Ok(());
        };
        linfo!(
            "system",
            LogStage::Shutdown,
            LogComponent::Main,
            "task_stop",
            "停止后台任务",
            task = ?self.task_type
        );
        action().await
    }
}

/// 后台任务调度器
#[derive(Default)]
pub struct TaskScheduler {
    tasks: RwLock<Vec<ScheduledTask>>,
}

impl TaskScheduler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, task: ScheduledTask) {
        self.tasks.write().await.push(task);
    }

    pub async fn register_many(&self, tasks: Vec<ScheduledTask>) {
        self.tasks.write().await.extend(tasks);
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    /// 按注册顺序启动；任一失败立即返回
    pub async fn start_all(&self) -> Result<()> {
        let tasks = { self.tasks.read().await.clone() };
        for task in tasks {
            if let Err(err) = task.start().await {
                lerror!(
                    "system",
                    LogStage::Startup,
                    LogComponent::Main,
                    "task_start_failed",
                    "后台任务启动失败",
                    task = ?task.task_type,
                    error = %err
                );
                return Err(err);
            }
        }
        Ok(())
    }

    /// 逆序停止全部任务；单个失败只记录，不影响其余任务
    pub async fn shutdown(&self) {
        let tasks = { self.tasks.read().await.clone() };
        for task in tasks.into_iter().rev() {
            if let Err(err) = task.stop().await {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::Main,
                    "task_stop_failed",
                    "后台任务未能正常停止",
                    task = ?task.task_type,
                    error = %err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[tokio::test]
    async fn test_shutdown_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let scheduler = TaskScheduler::new();
        for task_type in [TaskType::DedupSweep, TaskType::AuthSweep] {
            let order = Arc::clone(&order);
            scheduler
                .register(ScheduledTask::new(task_type, || async { Ok(()) }).on_stop(move || {
                    let order = Arc::clone(&order);
                    async move {
                        order.lock().unwrap().push(task_type);
                        Ok(())
                    }
                }))
                .await;
        }
        scheduler.start_all().await.unwrap();
        scheduler.shutdown().await;
        assert_eq!(*order.lock().unwrap(), vec![TaskType::AuthSweep, TaskType::DedupSweep]);
    }

    #[tokio::test]
    async fn test_start_failure_propagates() {
        let scheduler = TaskScheduler::new();
        scheduler
            .register(ScheduledTask::new(TaskType::KvSweep, || async {
                Err(crate::error::ProxyError::internal("boom"))
            }))
            .await;
        assert!(scheduler.start_all().await.is_err());
    }
}
