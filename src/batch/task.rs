//! 批量任务对象
//!
//! 编排者是唯一写者；读者通过 `snapshot` 拿到一致的副本。

use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::utils::random_hex;

/// 任务状态；只会沿 running → (cancelling →) 终态 前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Cancelling,
    Done,
    Cancelled,
    Error,
}

impl TaskStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Cancelled | Self::Error)
    }
}

/// 汇总计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub total: usize,
    pub done: usize,
    pub ok: usize,
    pub fail: usize,
}

/// 任务快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    pub total: usize,
    pub processed: usize,
    pub ok: usize,
    pub fail: usize,
    pub summary: BatchSummary,
    /// 按键排序，保证相同状态序列化结果逐字节一致
    pub results: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// SSE 事件类型：snapshot 或终态名
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug)]
struct TaskState {
    status: TaskStatus,
    processed: usize,
    ok: usize,
    fail: usize,
    results: BTreeMap<String, Value>,
    result: Option<Value>,
    error: Option<String>,
}

/// 一个批量任务
#[derive(Debug)]
pub struct BatchTask {
    id: String,
    total: usize,
    created_at: DateTime<Utc>,
    cancel: CancellationToken,
    done: CancellationToken,
    state: RwLock<TaskState>,
}

impl BatchTask {
    /// 新建任务；`cancel` 被触发时工作协程停止领取新任务
    #[must_use]
    pub fn new(total: usize, cancel: CancellationToken) -> Self {
        Self {
            id: random_hex(16),
            total,
            created_at: Utc::now(),
            cancel,
            done: CancellationToken::new(),
            state: RwLock::new(TaskState {
                status: TaskStatus::Running,
                processed: 0,
                ok: 0,
                fail: 0,
                results: BTreeMap::new(),
                result: None,
                error: None,
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn total(&self) -> usize {
        self.total
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// 工作协程观察的取消令牌
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.read().status
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TaskState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TaskState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 记录一个条目的结果
    pub fn record(&self, key: &str, ok: bool, payload: Value) {
        let key = if key.trim().is_empty() { "unknown" } else { key };
        let mut state = self.write();
        if state.status.is_terminal() {
            return;
        }
        state.results.insert(key.to_string(), payload);
        state.processed += 1;
        if ok {
            state.ok += 1;
        } else {
            state.fail += 1;
        }
    }

    pub fn set_result(&self, payload: Value) {
        self.write().result = Some(payload);
    }

    /// 进入终态；只有第一次调用生效，完成信号随之触发
    pub fn finish(&self, status: TaskStatus, error: Option<String>) -> bool {
        let status = if status.is_terminal() {
            status
        } else {
            TaskStatus::Done
        };
        {
            let mut state = self.write();
            if state.status.is_terminal() {
                return false;
            }
            state.status = status;
            state.error = error
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty());
        }
        self.done.cancel();
        linfo!(
            "system",
            LogStage::Batch,
            LogComponent::Batch,
            "task_finished",
            "批量任务结束",
            task_id = %self.id,
            status = status.as_str()
        );
        true
    }

    /// running → cancelling，并触发取消
    pub fn request_cancel(&self) {
        {
            let mut state = self.write();
            if state.status == TaskStatus::Running {
                state.status = TaskStatus::Cancelling;
            }
        }
        self.cancel.cancel();
    }

    /// 任务进入终态后完成
    pub async fn wait_done(&self) {
        self.done.cancelled().await;
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_cancelled()
    }

    #[must_use]
    pub fn snapshot(&self) -> BatchSnapshot {
        let state = self.read();
        BatchSnapshot {
            task_id: self.id.clone(),
            status: state.status,
            total: self.total,
            processed: state.processed,
            ok: state.ok,
            fail: state.fail,
            summary: BatchSummary {
                total: self.total,
                done: state.processed,
                ok: state.ok,
                fail: state.fail,
            },
            results: state.results.clone(),
            result: state.result.clone(),
            error: state.error.clone(),
            kind: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_snapshot() {
        let task = BatchTask::new(3, CancellationToken::new());
        assert_eq!(task.id().len(), 32);
        task.record("a", true, json!({"success": true}));
        task.record("", false, json!({"error": "boom"}));
        let snap = task.snapshot();
        assert_eq!((snap.processed, snap.ok, snap.fail), (2, 1, 1));
        assert_eq!(snap.summary.done, 2);
        assert!(snap.results.contains_key("unknown"));
        assert_eq!(snap.status, TaskStatus::Running);
    }

    #[tokio::test]
    async fn test_finish_fires_once_and_is_monotone() {
        let task = BatchTask::new(1, CancellationToken::new());
        assert!(!task.is_done());
        assert!(task.finish(TaskStatus::Error, Some(" upstream down ".into())));
        assert!(!task.finish(TaskStatus::Done, None));
        task.wait_done().await;
        let snap = task.snapshot();
        assert_eq!(snap.status, TaskStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("upstream down"));

        // 终态后的记录被忽略
        task.record("late", true, json!(null));
        assert_eq!(task.snapshot().processed, 0);
    }

    #[test]
    fn test_request_cancel_moves_to_cancelling() {
        let token = CancellationToken::new();
        let task = BatchTask::new(5, token.clone());
        task.request_cancel();
        assert!(token.is_cancelled());
        assert_eq!(task.status(), TaskStatus::Cancelling);
        task.finish(TaskStatus::Cancelled, None);
        task.request_cancel();
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }

    #[test]
    fn test_snapshot_serde_round_trip() {
        let task = BatchTask::new(2, CancellationToken::new());
        task.record("x", true, json!({"n": 1}));
        task.set_result(json!({"refreshed": 1}));
        let mut snap = task.snapshot();
        snap.kind = Some("snapshot".into());
        let raw = serde_json::to_string(&snap).unwrap();
        let back: BatchSnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, snap);
        assert!(raw.contains("\"type\":\"snapshot\""));
    }
}
