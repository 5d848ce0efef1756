//! # 上游提供商抽象
//!
//! 每种账号类型对应一个 `Provider` 工厂，为具体账号创建 `UpstreamClient`。
//! 处理器只依赖这里的统一能力集，新增上游只需注册新的工厂。

pub mod grok;
pub mod images;
pub mod orchids;
pub mod ratelimit;
pub mod registry;
pub mod session;
pub mod warp;

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;

use crate::error::{ProxyError, Result};
use crate::store::{Account, RateLimitInfo};
use crate::utils::{EventStream, EventStreamData, JsonLinesData};

pub use registry::ProviderRegistry;
pub use session::{AccountSession, SessionRegistry, TokenGrant};

/// 对话中的一条消息（已归一化为纯文本）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }
}

/// 工具定义
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub input_schema: Option<Value>,
}

/// 发往上游的统一请求
#[derive(Debug, Clone, Default)]
pub struct UpstreamRequest {
    pub request_id: String,
    pub model: String,
    /// 合并后的提示词（最后一条用户消息，或带历史的拼接文本）
    pub prompt: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    /// 本次请求强制不带工具
    pub no_tools: bool,
    pub thinking: bool,
    /// 客户端工作目录（来自请求或会话记忆）
    pub workdir: String,
    /// 会话标识，空表示一次性对话
    pub conversation_id: String,
}

impl UpstreamRequest {
    /// 是否携带历史对话
    #[must_use]
    pub fn has_history(&self) -> bool {
        self.messages.len() > 1
    }

    /// 不支持独立历史字段的上游使用：历史消息按角色拼接在提示词之前
    #[must_use]
    pub fn transcript(&self) -> String {
        if !self.has_history() {
            return self.prompt.clone();
        }
        let history = &self.messages[..self.messages.len() - 1];
        let mut out = String::new();
        for message in history.iter().filter(|m| !m.content.trim().is_empty()) {
            let role = if message.role.eq_ignore_ascii_case("assistant") {
                "Assistant"
            } else {
                "User"
            };
            out.push_str(role);
            out.push_str(": ");
            out.push_str(message.content.trim());
            out.push_str("\n\n");
        }
        out.push_str("User: ");
        out.push_str(self.prompt.trim());
        out
    }
}

/// 结束原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    EndTurn,
    ToolUse,
}

impl FinishReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
        }
    }

    /// OpenAI `finish_reason` 取值
    #[must_use]
    pub const fn as_openai(self) -> &'static str {
        match self {
            Self::EndTurn => "stop",
            Self::ToolUse => "tool_calls",
        }
    }
}

/// token 用量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// 上游流中的一个归一化事件
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamEvent {
    TextDelta(String),
    ReasoningDelta(String),
    ToolCall {
        id: String,
        name: String,
        input: Value,
    },
    Finish {
        reason: FinishReason,
        usage: Option<Usage>,
    },
}

/// 事件出口
///
/// 生产者（上游客户端）按到达顺序推送事件；消费者断开后推送返回取消错误。
/// 同一条流只会放行一个 `Finish`。
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::Sender<UpstreamEvent>,
    emitted: Arc<AtomicUsize>,
    finished: Arc<AtomicBool>,
    saw_tool_call: Arc<AtomicBool>,
}

impl EventSink {
    /// 创建一对出口与接收端
    #[must_use]
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<UpstreamEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                tx,
                emitted: Arc::new(AtomicUsize::new(0)),
                finished: Arc::new(AtomicBool::new(false)),
                saw_tool_call: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub async fn emit(&self, event: UpstreamEvent) -> Result<()> {
        match &event {
            UpstreamEvent::Finish { .. } => {
                if self.finished.swap(true, Ordering::AcqRel) {
                    return Ok(());
                }
            }
            UpstreamEvent::ToolCall { .. } => self.saw_tool_call.store(true, Ordering::Release),
            _ => {}
        }
        self.tx
            .send(event)
            .await
            .map_err(|_| ProxyError::cancelled("client disconnected"))?;
        self.emitted.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub async fn text(&self, delta: impl Into<String>) -> Result<()> {
        let delta = delta.into();
        if delta.is_empty() {
            return Ok(());
        }
        self.emit(UpstreamEvent::TextDelta(delta)).await
    }

    pub async fn reasoning(&self, delta: impl Into<String>) -> Result<()> {
        let delta = delta.into();
        if delta.is_empty() {
            return Ok(());
        }
        self.emit(UpstreamEvent::ReasoningDelta(delta)).await
    }

    /// 流结束但上游没有显式给出结束事件时补发
    pub async fn finish_if_missing(&self) -> Result<()> {
        if self.is_finished() {
            return Ok(());
        }
        self.emit(UpstreamEvent::Finish {
            reason: self.default_finish_reason(),
            usage: None,
        })
        .await
    }

    /// 见过工具调用时为 `tool_use`，否则 `end_turn`
    #[must_use]
    pub fn default_finish_reason(&self) -> FinishReason {
        if self.saw_tool_call.load(Ordering::Acquire) {
            FinishReason::ToolUse
        } else {
            FinishReason::EndTurn
        }
    }

    /// 已经发给下游的事件数；大于零后不再允许换号重试
    #[must_use]
    pub fn emitted(&self) -> usize {
        self.emitted.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }
}

/// 刷新账号凭据的结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefreshOutcome {
    pub bearer: String,
    /// 上游轮换后的新 refresh token
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub rate_limit: Option<RateLimitInfo>,
}

/// 图片生成请求
#[derive(Debug, Clone, Default)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    pub n: usize,
    /// 画幅比例，空表示上游默认
    pub aspect_ratio: String,
}

/// 图片编辑请求；参考图需要先以当前账号上传
#[derive(Debug, Clone, Default)]
pub struct ImageEditRequest {
    pub model: String,
    pub prompt: String,
    pub n: usize,
    /// (mime, 原始字节)
    pub images: Vec<(String, Vec<u8>)>,
}

/// 图片结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageOutput {
    pub urls: Vec<String>,
}

/// 上游客户端能力集
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    fn provider(&self) -> &str;

    /// 流式对话：事件逐个写入 `sink`，流结束时保证恰好一个结束事件
    async fn send_request(&self, request: &UpstreamRequest, sink: &EventSink) -> Result<()>;

    /// 强制刷新凭据
    async fn refresh_account(&self) -> Result<RefreshOutcome>;

    /// 最近一次响应头里的限额信息
    fn rate_limit(&self) -> Option<RateLimitInfo> {
        None
    }

    /// 请求途中被上游轮换、尚未写回账号的 refresh token
    async fn rotated_refresh_token(&self) -> Option<String> {
        None
    }

    async fn generate_images(&self, request: &ImageRequest) -> Result<ImageOutput> {
        let _ = request;
        Err(ProxyError::validation(format!(
            "{} does not support image generation",
            self.provider()
        )))
    }

    async fn edit_images(&self, request: &ImageEditRequest) -> Result<ImageOutput> {
        let _ = request;
        Err(ProxyError::validation(format!(
            "{} does not support image edits",
            self.provider()
        )))
    }

    async fn enable_nsfw(&self) -> Result<()> {
        Err(ProxyError::validation(format!(
            "{} does not support nsfw settings",
            self.provider()
        )))
    }

    /// 以当前账号下载上游资源，返回 (字节, content-type)
    async fn download_asset(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let _ = url;
        Err(ProxyError::validation(format!(
            "{} does not support asset download",
            self.provider()
        )))
    }
}

/// 上游工厂
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn new_client(&self, account: &Account) -> Arc<dyn UpstreamClient>;
}

/// 上游共用的 HTTP 客户端
pub fn build_http_client(timeout: Duration, user_agent: &str) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(10))
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(50)
        .user_agent(user_agent)
        .build()
        .map_err(|e| ProxyError::server_init_with_source("HTTP 客户端初始化失败", e))
}

/// 逐帧读取的上游响应体
pub type FrameStream<T> = Pin<Box<dyn Stream<Item = std::io::Result<T>> + Send>>;

/// 把响应体按 SSE 事件切帧
#[must_use]
pub fn sse_frames(response: reqwest::Response) -> FrameStream<EventStream> {
    let body = response.bytes_stream().map_err(std::io::Error::other);
    Box::pin(FramedRead::new(StreamReader::new(body), EventStreamData::new()))
}

/// 把响应体按 JSON 行切帧
#[must_use]
pub fn json_line_frames(response: reqwest::Response) -> FrameStream<Value> {
    let body = response.bytes_stream().map_err(std::io::Error::other);
    Box::pin(FramedRead::new(StreamReader::new(body), JsonLinesData::new()))
}

/// 非 2xx 响应转为上游错误，带上截断后的响应体
pub async fn error_for_status(provider: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.trim().chars().take(512).collect();
    Err(ProxyError::upstream(
        provider,
        status.as_u16(),
        format!("{provider} api error: HTTP {}: {snippet}", status.as_u16()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sink_allows_a_single_finish() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.text("hi").await.unwrap();
        sink.emit(UpstreamEvent::Finish {
            reason: FinishReason::EndTurn,
            usage: None,
        })
        .await
        .unwrap();
        sink.finish_if_missing().await.unwrap();
        drop(sink);

        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], UpstreamEvent::Finish { .. }));
    }

    #[tokio::test]
    async fn test_synthesized_finish_reflects_tool_calls() {
        let (sink, mut rx) = EventSink::channel(8);
        sink.emit(UpstreamEvent::ToolCall {
            id: "t1".into(),
            name: "ls".into(),
            input: serde_json::json!({}),
        })
        .await
        .unwrap();
        sink.finish_if_missing().await.unwrap();
        rx.recv().await.unwrap();
        assert_eq!(
            rx.recv().await.unwrap(),
            UpstreamEvent::Finish {
                reason: FinishReason::ToolUse,
                usage: None
            }
        );
        assert_eq!(sink.emitted(), 2);
    }

    #[tokio::test]
    async fn test_emit_after_disconnect_is_cancelled() {
        let (sink, rx) = EventSink::channel(1);
        drop(rx);
        let err = sink.text("late").await.unwrap_err();
        assert!(matches!(err, ProxyError::Cancelled { .. }));
        assert_eq!(sink.emitted(), 0);
    }

    #[test]
    fn test_transcript_prefixes_history() {
        let mut request = UpstreamRequest {
            prompt: "again".into(),
            messages: vec![ChatMessage::new("user", "again")],
            ..UpstreamRequest::default()
        };
        assert_eq!(request.transcript(), "again");
        request.messages = vec![
            ChatMessage::new("user", "hi"),
            ChatMessage::new("assistant", "hello"),
            ChatMessage::new("user", "again"),
        ];
        assert_eq!(request.transcript(), "User: hi\n\nAssistant: hello\n\nUser: again");
    }

    #[test]
    fn test_empty_deltas_are_skipped() {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(async {
            let (sink, _rx) = EventSink::channel(1);
            sink.text("").await.unwrap();
            sink.reasoning(String::new()).await.unwrap();
            assert_eq!(sink.emitted(), 0);
        });
    }
}
