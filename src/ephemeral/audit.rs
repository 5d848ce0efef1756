//! # 审计日志
//!
//! 请求路径只做非阻塞投递：缓冲区满时丢弃并告警。后台写入协程把事件写入
//! KV 列表（最新在前，长度封顶）。

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::store::{KeySpace, KvBackend};
use crate::{ldebug, lwarn};

/// 投递缓冲大小
pub const AUDIT_BUFFER: usize = 256;
/// 列表默认最大长度
pub const DEFAULT_AUDIT_MAX_LEN: usize = 10_000;
const DEFAULT_QUERY_LIMIT: usize = 100;

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// 一条审计事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub account_id: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub channel: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub client_ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub user_agent: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub duration_ms: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            account_id: 0,
            model: String::new(),
            channel: String::new(),
            client_ip: String::new(),
            user_agent: String::new(),
            duration_ms: 0,
            status: status.into(),
            error: String::new(),
            metadata: None,
        }
    }
}

/// 查询条件
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AuditQuery {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub action: Option<String>,
    pub limit: Option<usize>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        self.start.is_none_or(|s| event.timestamp >= s)
            && self.end.is_none_or(|e| event.timestamp <= e)
            && self
                .action
                .as_deref()
                .filter(|a| !a.is_empty())
                .is_none_or(|a| event.action == a)
    }
}

/// 审计日志接口
#[async_trait]
pub trait AuditLogger: Send + Sync {
    /// 非阻塞投递
    fn log(&self, event: AuditEvent);

    /// 最近的事件，最新在前
    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>>;

    /// 关闭并等待缓冲写完
    async fn close(&self);
}

/// 丢弃一切
#[derive(Debug, Default, Clone, Copy)]
pub struct NopAuditLogger;

#[async_trait]
impl AuditLogger for NopAuditLogger {
    fn log(&self, _event: AuditEvent) {}

    async fn query(&self, _query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        Ok(Vec::new())
    }

    async fn close(&self) {}
}

/// KV 列表审计日志
pub struct KvAuditLogger {
    kv: Arc<dyn KvBackend>,
    key: String,
    max_len: usize,
    tx: Mutex<Option<mpsc::Sender<AuditEvent>>>,
    writer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for KvAuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvAuditLogger")
            .field("key", &self.key)
            .field("max_len", &self.max_len)
            .finish_non_exhaustive()
    }
}

impl KvAuditLogger {
    /// 创建并启动后台写入协程（需要在 tokio 运行时内调用）
    #[must_use]
    pub fn start(kv: Arc<dyn KvBackend>, keys: &KeySpace, max_len: usize) -> Self {
        let max_len = if max_len == 0 { DEFAULT_AUDIT_MAX_LEN } else { max_len };
        let key = keys.audit_log();
        let (tx, rx) = mpsc::channel(AUDIT_BUFFER);
        let writer = tokio::spawn(write_loop(kv.clone(), key.clone(), max_len, rx));
        Self {
            kv,
            key,
            max_len,
            tx: Mutex::new(Some(tx)),
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }
}

async fn write_loop(
    kv: Arc<dyn KvBackend>,
    key: String,
    max_len: usize,
    mut rx: mpsc::Receiver<AuditEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Ok(raw) = serde_json::to_string(&event) else {
            continue;
        };
        if let Err(e) = kv.list_push_capped(&key, &raw, max_len).await {
            ldebug!(
                "system",
                LogStage::Background,
                LogComponent::Audit,
                "write_failed",
                "审计事件写入失败",
                action = %event.action,
                error = %e
            );
        }
    }
}

#[async_trait]
impl AuditLogger for KvAuditLogger {
    fn log(&self, event: AuditEvent) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = tx.as_ref() else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(event)) = tx.try_send(event) {
            lwarn!(
                "system",
                LogStage::Response,
                LogComponent::Audit,
                "buffer_full",
                "审计缓冲已满，丢弃事件",
                action = %event.action
            );
        }
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let limit = query.limit.filter(|l| *l > 0).unwrap_or(DEFAULT_QUERY_LIMIT);
        let raw = self.kv.list_range(&self.key, self.max_len).await?;
        Ok(raw
            .iter()
            .filter_map(|line| serde_json::from_str::<AuditEvent>(line).ok())
            .filter(|event| query.matches(event))
            .take(limit)
            .collect())
    }

    async fn close(&self) {
        drop(self.tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        if let Some(writer) = self.writer.lock().await.take() {
            let _ = writer.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKv;
    use chrono::Duration;

    fn event(action: &str, at: DateTime<Utc>) -> AuditEvent {
        AuditEvent {
            timestamp: at,
            model: "grok-4".into(),
            ..AuditEvent::new(action, "ok")
        }
    }

    #[tokio::test]
    async fn test_kv_logger_writes_newest_first_and_caps() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let logger = KvAuditLogger::start(kv.clone(), &KeySpace::new("t"), 3);
        let now = Utc::now();
        for i in 0..5 {
            logger.log(event(&format!("chat{i}"), now + Duration::seconds(i)));
        }
        logger.close().await;

        let events = logger.query(&AuditQuery::default()).await.unwrap();
        let actions: Vec<_> = events.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, ["chat4", "chat3", "chat2"]);

        // 关闭后投递被忽略
        logger.log(event("late", now));
    }

    #[tokio::test]
    async fn test_query_filters() {
        let kv: Arc<dyn KvBackend> = Arc::new(MemoryKv::new());
        let logger = KvAuditLogger::start(kv, &KeySpace::new("t"), 100);
        let now = Utc::now();
        logger.log(event("chat", now - Duration::hours(2)));
        logger.log(event("images", now - Duration::minutes(5)));
        logger.log(event("chat", now));
        logger.close().await;

        let q = AuditQuery {
            action: Some("chat".into()),
            ..AuditQuery::default()
        };
        assert_eq!(logger.query(&q).await.unwrap().len(), 2);

        let q = AuditQuery {
            start: Some(now - Duration::hours(1)),
            limit: Some(1),
            ..AuditQuery::default()
        };
        let got = logger.query(&q).await.unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].action, "chat");
    }

    #[test]
    fn test_event_serialization_omits_empty_fields() {
        let json = serde_json::to_value(AuditEvent::new("chat", "ok")).unwrap();
        let obj = json.as_object().unwrap();
        assert!(obj.contains_key("timestamp"));
        assert!(!obj.contains_key("account_id"));
        assert!(!obj.contains_key("error"));
    }
}
