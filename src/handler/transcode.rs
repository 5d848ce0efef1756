//! # 流式转码
//!
//! 把上游归一化事件编码为下游 SSE 帧（OpenAI `chat.completion.chunk` 或
//! Anthropic `message_*`/`content_block_*`），非流式请求则聚合为一个完整响应。
//! 编码器按事件到达顺序逐个输出，不做重排。

use std::fmt::Write as _;
use std::sync::LazyLock;

use bytes::Bytes;
use chrono::Utc;
use serde_json::{Value, json};

use super::request::ApiFormat;
use crate::provider::{FinishReason, UpstreamEvent, Usage};
use crate::utils::{BufferPool, random_hex};

/// OpenAI 流结束哨兵
pub const DONE_FRAME: &str = "data: [DONE]\n\n";

static FRAME_BUFFERS: LazyLock<BufferPool> = LazyLock::new(BufferPool::default);

fn write_frame(event: Option<&str>, payload: &Value) -> Bytes {
    let mut buf = FRAME_BUFFERS.get();
    if let Some(event) = event {
        let _ = write!(buf, "event: {event}\n");
    }
    let _ = write!(buf, "data: {payload}\n\n");
    Bytes::copy_from_slice(&buf)
}

fn data_frame(payload: &Value) -> Bytes {
    write_frame(None, payload)
}

fn named_frame(event: &str, payload: &Value) -> Bytes {
    write_frame(Some(event), payload)
}

/// 下游流编码器
pub trait StreamEncoder: Send {
    /// 首个事件之前输出的帧
    fn start(&mut self) -> Vec<Bytes>;

    /// 编码一个上游事件
    fn encode(&mut self, event: &UpstreamEvent) -> Vec<Bytes>;

    /// 上游中途出错时输出的帧
    fn error(&mut self, message: &str) -> Vec<Bytes>;

    /// 流结束后输出的帧
    fn end(&mut self) -> Vec<Bytes>;
}

/// 按协议创建编码器
#[must_use]
pub fn encoder_for(format: ApiFormat, model: &str, input_tokens: u64) -> Box<dyn StreamEncoder> {
    match format {
        ApiFormat::OpenAi => Box::new(OpenAiEncoder::new(model)),
        ApiFormat::Anthropic => Box::new(AnthropicEncoder::new(model, input_tokens)),
    }
}

/// OpenAI `chat.completion.chunk` 编码器
#[derive(Debug)]
pub struct OpenAiEncoder {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    tool_index: usize,
    finished: bool,
}

impl OpenAiEncoder {
    #[must_use]
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", random_hex(12)),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            role_sent: false,
            tool_index: 0,
            finished: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>, usage: Option<Usage>) -> Bytes {
        let mut payload = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        });
        if let Some(usage) = usage {
            payload["usage"] = openai_usage(usage);
        }
        data_frame(&payload)
    }

    fn role_frame(&mut self) -> Option<Bytes> {
        if self.role_sent {
            return None;
        }
        self.role_sent = true;
        Some(self.chunk(json!({"role": "assistant", "content": ""}), None, None))
    }
}

fn openai_usage(usage: Usage) -> Value {
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.input_tokens + usage.output_tokens,
    })
}

impl StreamEncoder for OpenAiEncoder {
    fn start(&mut self) -> Vec<Bytes> {
        self.role_frame().into_iter().collect()
    }

    fn encode(&mut self, event: &UpstreamEvent) -> Vec<Bytes> {
        if self.finished {
            return Vec::new();
        }
        let mut frames: Vec<Bytes> = self.role_frame().into_iter().collect();
        match event {
            UpstreamEvent::TextDelta(text) => frames.push(self.chunk(json!({"content": text}), None, None)),
            UpstreamEvent::ReasoningDelta(text) => {
                frames.push(self.chunk(json!({"reasoning_content": text}), None, None));
            }
            UpstreamEvent::ToolCall { id, name, input } => {
                let delta = json!({"tool_calls": [{
                    "index": self.tool_index,
                    "id": id,
                    "type": "function",
                    "function": {"name": name, "arguments": input.to_string()},
                }]});
                self.tool_index += 1;
                frames.push(self.chunk(delta, None, None));
            }
            UpstreamEvent::Finish { reason, usage } => {
                self.finished = true;
                frames.push(self.chunk(json!({}), Some(reason.as_openai()), *usage));
            }
        }
        frames
    }

    fn error(&mut self, message: &str) -> Vec<Bytes> {
        self.finished = true;
        vec![data_frame(&json!({"error": {"message": message, "type": "upstream_error"}}))]
    }

    fn end(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        if !self.finished {
            self.finished = true;
            frames.push(self.chunk(json!({}), Some(FinishReason::EndTurn.as_openai()), None));
        }
        frames.push(Bytes::from_static(DONE_FRAME.as_bytes()));
        frames
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

/// Anthropic messages 流编码器
#[derive(Debug)]
pub struct AnthropicEncoder {
    id: String,
    model: String,
    input_tokens: u64,
    started: bool,
    open_block: Option<BlockKind>,
    next_index: usize,
    stopped: bool,
}

impl AnthropicEncoder {
    #[must_use]
    pub fn new(model: &str, input_tokens: u64) -> Self {
        Self {
            id: format!("msg_{}", random_hex(12)),
            model: model.to_string(),
            input_tokens,
            started: false,
            open_block: None,
            next_index: 0,
            stopped: false,
        }
    }

    fn message_start(&mut self) -> Option<Bytes> {
        if self.started {
            return None;
        }
        self.started = true;
        Some(named_frame(
            "message_start",
            &json!({
                "type": "message_start",
                "message": {
                    "id": self.id,
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": self.input_tokens, "output_tokens": 0},
                },
            }),
        ))
    }

    fn close_block(&mut self, frames: &mut Vec<Bytes>) {
        if self.open_block.take().is_some() {
            frames.push(named_frame(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": self.next_index - 1}),
            ));
        }
    }

    /// 切换到指定类型的内容块，必要时关闭旧块并开启新块
    fn ensure_block(&mut self, kind: BlockKind, frames: &mut Vec<Bytes>) {
        if self.open_block == Some(kind) {
            return;
        }
        self.close_block(frames);
        let content_block = match kind {
            BlockKind::Text => json!({"type": "text", "text": ""}),
            BlockKind::Thinking => json!({"type": "thinking", "thinking": ""}),
        };
        frames.push(named_frame(
            "content_block_start",
            &json!({"type": "content_block_start", "index": self.next_index, "content_block": content_block}),
        ));
        self.open_block = Some(kind);
        self.next_index += 1;
    }

    fn delta(&self, delta: Value) -> Bytes {
        named_frame(
            "content_block_delta",
            &json!({"type": "content_block_delta", "index": self.next_index - 1, "delta": delta}),
        )
    }

    fn stop(&mut self, reason: FinishReason, usage: Option<Usage>, frames: &mut Vec<Bytes>) {
        self.close_block(frames);
        let output_tokens = usage.map_or(0, |u| u.output_tokens);
        frames.push(named_frame(
            "message_delta",
            &json!({
                "type": "message_delta",
                "delta": {"stop_reason": reason.as_str(), "stop_sequence": null},
                "usage": {"output_tokens": output_tokens},
            }),
        ));
        frames.push(named_frame("message_stop", &json!({"type": "message_stop"})));
        self.stopped = true;
    }
}

impl StreamEncoder for AnthropicEncoder {
    fn start(&mut self) -> Vec<Bytes> {
        self.message_start().into_iter().collect()
    }

    fn encode(&mut self, event: &UpstreamEvent) -> Vec<Bytes> {
        if self.stopped {
            return Vec::new();
        }
        let mut frames: Vec<Bytes> = self.message_start().into_iter().collect();
        match event {
            UpstreamEvent::TextDelta(text) => {
                self.ensure_block(BlockKind::Text, &mut frames);
                frames.push(self.delta(json!({"type": "text_delta", "text": text})));
            }
            UpstreamEvent::ReasoningDelta(text) => {
                self.ensure_block(BlockKind::Thinking, &mut frames);
                frames.push(self.delta(json!({"type": "thinking_delta", "thinking": text})));
            }
            UpstreamEvent::ToolCall { id, name, input } => {
                self.close_block(&mut frames);
                let index = self.next_index;
                self.next_index += 1;
                frames.push(named_frame(
                    "content_block_start",
                    &json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {"type": "tool_use", "id": id, "name": name, "input": {}},
                    }),
                ));
                frames.push(named_frame(
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": {"type": "input_json_delta", "partial_json": input.to_string()},
                    }),
                ));
                frames.push(named_frame(
                    "content_block_stop",
                    &json!({"type": "content_block_stop", "index": index}),
                ));
            }
            UpstreamEvent::Finish { reason, usage } => self.stop(*reason, *usage, &mut frames),
        }
        frames
    }

    fn error(&mut self, message: &str) -> Vec<Bytes> {
        self.stopped = true;
        vec![named_frame(
            "error",
            &json!({"type": "error", "error": {"type": "api_error", "message": message}}),
        )]
    }

    fn end(&mut self) -> Vec<Bytes> {
        if self.stopped {
            return Vec::new();
        }
        let mut frames: Vec<Bytes> = self.message_start().into_iter().collect();
        self.stop(FinishReason::EndTurn, None, &mut frames);
        frames
    }
}

/// 非流式响应的聚合结果
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collected {
    pub text: String,
    pub reasoning: String,
    pub tool_calls: Vec<(String, String, Value)>,
    pub finish: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl Collected {
    pub fn push(&mut self, event: UpstreamEvent) {
        match event {
            UpstreamEvent::TextDelta(text) => self.text.push_str(&text),
            UpstreamEvent::ReasoningDelta(text) => self.reasoning.push_str(&text),
            UpstreamEvent::ToolCall { id, name, input } => self.tool_calls.push((id, name, input)),
            UpstreamEvent::Finish { reason, usage } => {
                self.finish.get_or_insert(reason);
                if usage.is_some() {
                    self.usage = usage;
                }
            }
        }
    }

    fn finish_reason(&self) -> FinishReason {
        self.finish.unwrap_or(if self.tool_calls.is_empty() {
            FinishReason::EndTurn
        } else {
            FinishReason::ToolUse
        })
    }

    /// OpenAI `chat.completion`
    #[must_use]
    pub fn to_openai(&self, model: &str) -> Value {
        let mut message = json!({"role": "assistant", "content": self.text});
        if !self.reasoning.is_empty() {
            message["reasoning_content"] = json!(self.reasoning);
        }
        if !self.tool_calls.is_empty() {
            let calls: Vec<Value> = self
                .tool_calls
                .iter()
                .map(|(id, name, input)| {
                    json!({"id": id, "type": "function", "function": {"name": name, "arguments": input.to_string()}})
                })
                .collect();
            message["tool_calls"] = Value::Array(calls);
        }
        json!({
            "id": format!("chatcmpl-{}", random_hex(12)),
            "object": "chat.completion",
            "created": Utc::now().timestamp(),
            "model": model,
            "choices": [{"index": 0, "message": message, "finish_reason": self.finish_reason().as_openai()}],
            "usage": openai_usage(self.usage.unwrap_or_default()),
        })
    }

    /// Anthropic `message`
    #[must_use]
    pub fn to_anthropic(&self, model: &str, input_tokens: u64) -> Value {
        let mut content = Vec::new();
        if !self.reasoning.is_empty() {
            content.push(json!({"type": "thinking", "thinking": self.reasoning}));
        }
        if !self.text.is_empty() {
            content.push(json!({"type": "text", "text": self.text}));
        }
        for (id, name, input) in &self.tool_calls {
            content.push(json!({"type": "tool_use", "id": id, "name": name, "input": input}));
        }
        let usage = self.usage.unwrap_or(Usage {
            input_tokens,
            output_tokens: 0,
        });
        json!({
            "id": format!("msg_{}", random_hex(12)),
            "type": "message",
            "role": "assistant",
            "model": model,
            "content": content,
            "stop_reason": self.finish_reason().as_str(),
            "stop_sequence": null,
            "usage": {"input_tokens": usage.input_tokens, "output_tokens": usage.output_tokens},
        })
    }

    #[must_use]
    pub fn render(&self, format: ApiFormat, model: &str, input_tokens: u64) -> Value {
        match format {
            ApiFormat::OpenAi => self.to_openai(model),
            ApiFormat::Anthropic => self.to_anthropic(model, input_tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn text(frames: &[Bytes]) -> String {
        frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect()
    }

    fn events() -> Vec<UpstreamEvent> {
        vec![
            UpstreamEvent::ReasoningDelta("think".into()),
            UpstreamEvent::TextDelta("Hel".into()),
            UpstreamEvent::TextDelta("lo".into()),
            UpstreamEvent::ToolCall {
                id: "call_1".into(),
                name: "ls".into(),
                input: json!({"path": "."}),
            },
            UpstreamEvent::Finish {
                reason: FinishReason::ToolUse,
                usage: Some(Usage {
                    input_tokens: 3,
                    output_tokens: 5,
                }),
            },
        ]
    }

    #[test]
    fn test_openai_chunks_keep_order_and_end_with_done() {
        let mut encoder = OpenAiEncoder::new("auto");
        let mut frames = encoder.start();
        for event in events() {
            frames.extend(encoder.encode(&event));
        }
        frames.extend(encoder.end());
        let out = text(&frames);

        let role = out.find("\"role\":\"assistant\"").unwrap();
        let reasoning = out.find("reasoning_content").unwrap();
        let hel = out.find("\"Hel\"").unwrap();
        let tool = out.find("tool_calls").unwrap();
        let finish = out.find("\"finish_reason\":\"tool_calls\"").unwrap();
        assert!(role < reasoning && reasoning < hel && hel < tool && tool < finish);
        assert!(out.ends_with(DONE_FRAME));
        assert_eq!(out.matches("[DONE]").count(), 1);
        assert_eq!(out.matches("\"finish_reason\":\"").count(), 1);
    }

    #[test]
    fn test_openai_end_synthesizes_finish() {
        let mut encoder = OpenAiEncoder::new("auto");
        let mut frames = encoder.encode(&UpstreamEvent::TextDelta("x".into()));
        frames.extend(encoder.end());
        let out = text(&frames);
        assert_eq!(out.matches("\"finish_reason\":\"stop\"").count(), 1);
    }

    #[test]
    fn test_anthropic_block_sequence() {
        let mut encoder = AnthropicEncoder::new("claude-sonnet-4-5", 7);
        let mut frames = encoder.start();
        for event in events() {
            frames.extend(encoder.encode(&event));
        }
        frames.extend(encoder.end());
        let kinds: Vec<String> = text(&frames)
            .split("\n\n")
            .filter_map(|frame| frame.strip_prefix("event: "))
            .map(|rest| rest.lines().next().unwrap_or_default().to_string())
            .collect();
        assert_eq!(
            kinds,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        let out = text(&frames);
        assert!(out.contains("\"thinking_delta\""));
        assert!(out.contains("\"stop_reason\":\"tool_use\""));
        assert!(out.contains("\"input_tokens\":7"));
    }

    #[test]
    fn test_anthropic_end_without_finish_stops_once() {
        let mut encoder = AnthropicEncoder::new("m", 0);
        let mut frames = encoder.encode(&UpstreamEvent::TextDelta("a".into()));
        frames.extend(encoder.end());
        frames.extend(encoder.end());
        assert_eq!(text(&frames).matches("message_stop").count(), 2);
        assert_eq!(text(&frames).matches("event: message_stop").count(), 1);
    }

    #[test]
    fn test_collected_renders_both_formats() {
        let mut collected = Collected::default();
        for event in events() {
            collected.push(event);
        }
        let openai = collected.to_openai("auto");
        assert_eq!(openai["object"], "chat.completion");
        assert_eq!(openai["choices"][0]["message"]["content"], "Hello");
        assert_eq!(openai["choices"][0]["finish_reason"], "tool_calls");
        assert_eq!(openai["usage"]["total_tokens"], 8);

        let anthropic = collected.to_anthropic("m", 3);
        assert_eq!(anthropic["type"], "message");
        assert_eq!(anthropic["content"][0]["type"], "thinking");
        assert_eq!(anthropic["content"][2]["input"], json!({"path": "."}));
        assert_eq!(anthropic["stop_reason"], "tool_use");
    }
}
