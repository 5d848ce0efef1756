//! 下游请求解析
//!
//! OpenAI `chat/completions` 与 Anthropic `messages` 两种请求体都归一化为 [`ParsedChat`]。
//! 消息内容（字符串或内容块数组）压平为纯文本。

use serde::Deserialize;
use serde_json::Value;

use crate::error::{ProxyError, Result};
use crate::provider::{ChatMessage, ToolSpec, UpstreamRequest};

/// 下游协议
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFormat {
    OpenAi,
    Anthropic,
}

impl ApiFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }
}

/// 归一化后的对话请求
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedChat {
    pub model: String,
    pub stream: bool,
    pub system: String,
    /// 不含 system 的消息，最后一条是本轮提示
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub thinking: bool,
    pub no_tools: bool,
    /// 会话记忆键
    pub conversation_key: String,
    pub workdir: String,
}

impl ParsedChat {
    /// 最后一条用户消息
    #[must_use]
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map_or("", |m| m.content.as_str())
    }

    /// 组装发往上游的请求
    #[must_use]
    pub fn to_upstream(&self, request_id: &str, model: &str) -> UpstreamRequest {
        UpstreamRequest {
            request_id: request_id.to_string(),
            model: model.to_string(),
            prompt: self.prompt().to_string(),
            system: self.system.clone(),
            messages: self.messages.clone(),
            tools: self.tools.clone(),
            no_tools: self.no_tools,
            thinking: self.thinking,
            workdir: self.workdir.clone(),
            conversation_id: String::new(),
        }
    }
}

/// 压平内容：字符串原样返回；内容块数组逐块转成文本后以换行连接
#[must_use]
pub fn flatten_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(flatten_block)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten_block(block: &Value) -> Option<String> {
    if let Value::String(s) = block {
        return Some(s.clone());
    }
    let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
    match kind {
        "text" | "input_text" => block.get("text").and_then(Value::as_str).map(str::to_string),
        "tool_use" => {
            let name = block.get("name").and_then(Value::as_str).unwrap_or_default();
            let input = block.get("input").map(Value::to_string).unwrap_or_default();
            Some(format!("[tool_use {name}] {input}"))
        }
        "tool_result" => {
            let inner = block.get("content").map(flatten_content).unwrap_or_default();
            Some(format!("[tool_result] {inner}"))
        }
        "image" | "image_url" | "input_image" => Some("[image]".to_string()),
        // thinking 块不回传上游
        _ => None,
    }
}

fn str_field(body: &Value, key: &str) -> String {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn bool_field(body: &Value, key: &str) -> bool {
    body.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn conversation_key(body: &Value) -> String {
    let direct = str_field(body, "conversation_id");
    if !direct.is_empty() {
        return direct;
    }
    body.get("metadata")
        .and_then(|m| m.get("conversation_id").or_else(|| m.get("user_id")))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string()
}

fn parse_tool(tool: &Value) -> Option<ToolSpec> {
    // OpenAI: {type: function, function: {name, description, parameters}}
    let (spec, schema_key) = match tool.get("function") {
        Some(function) => (function, "parameters"),
        None => (tool, "input_schema"),
    };
    let name = spec.get("name").and_then(Value::as_str)?.trim();
    if name.is_empty() {
        return None;
    }
    Some(ToolSpec {
        name: name.to_string(),
        description: spec
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        input_schema: spec.get(schema_key).cloned(),
    })
}

fn parse_tools(body: &Value) -> Vec<ToolSpec> {
    body.get("tools")
        .and_then(Value::as_array)
        .map(|tools| tools.iter().filter_map(parse_tool).collect())
        .unwrap_or_default()
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: Value,
}

fn raw_messages(body: &Value) -> Result<Vec<RawMessage>> {
    let Some(messages) = body.get("messages") else {
        return Err(ProxyError::validation("messages is required"));
    };
    serde_json::from_value(messages.clone())
        .map_err(|e| ProxyError::validation(format!("invalid messages: {e}")))
}

fn finish(mut parsed: ParsedChat) -> Result<ParsedChat> {
    parsed.messages.retain(|m| !(m.role == "assistant" && m.content.trim().is_empty()));
    if parsed.prompt().trim().is_empty() {
        return Err(ProxyError::validation("no user message found"));
    }
    Ok(parsed)
}

/// 解析 OpenAI `chat/completions` 请求体
pub fn parse_openai(body: &Value) -> Result<ParsedChat> {
    let mut system = Vec::new();
    let mut messages = Vec::new();
    for raw in raw_messages(body)? {
        let text = flatten_content(&raw.content);
        match raw.role.as_str() {
            "system" | "developer" => system.push(text),
            "assistant" => messages.push(ChatMessage::new("assistant", text)),
            "tool" => messages.push(ChatMessage::new("user", format!("[tool_result] {text}"))),
            _ => messages.push(ChatMessage::new("user", text)),
        }
    }
    let thinking = body
        .get("reasoning_effort")
        .and_then(Value::as_str)
        .is_some_and(|effort| !effort.eq_ignore_ascii_case("none"));
    finish(ParsedChat {
        model: str_field(body, "model"),
        stream: bool_field(body, "stream"),
        system: system.join("\n"),
        messages,
        tools: parse_tools(body),
        thinking,
        no_tools: bool_field(body, "no_tools"),
        conversation_key: conversation_key(body),
        workdir: str_field(body, "workdir"),
    })
}

/// 解析 Anthropic `messages` 请求体
pub fn parse_anthropic(body: &Value) -> Result<ParsedChat> {
    let system = body.get("system").map(flatten_content).unwrap_or_default();
    let messages = raw_messages(body)?
        .into_iter()
        .map(|raw| {
            let role = if raw.role == "assistant" { "assistant" } else { "user" };
            ChatMessage::new(role, flatten_content(&raw.content))
        })
        .collect();
    let thinking = body
        .get("thinking")
        .and_then(|t| t.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|t| t == "enabled");
    finish(ParsedChat {
        model: str_field(body, "model"),
        stream: bool_field(body, "stream"),
        system,
        messages,
        tools: parse_tools(body),
        thinking,
        no_tools: bool_field(body, "no_tools"),
        conversation_key: conversation_key(body),
        workdir: str_field(body, "workdir"),
    })
}

/// 按协议解析
pub fn parse_chat(format: ApiFormat, body: &Value) -> Result<ParsedChat> {
    match format {
        ApiFormat::OpenAi => parse_openai(body),
        ApiFormat::Anthropic => parse_anthropic(body),
    }
}
