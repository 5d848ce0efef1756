//! # Warp 上游
//!
//! 请求体是手写编码的 protobuf，响应是 SSE，每个 `data:` 块是 base64 编码的 protobuf 帧。
//! 帧的解析通过 `WarpEventCodec` 注入，默认实现见 `ProtoEventCodec`。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use chrono::Utc;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;

use crate::config::WarpConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::Account;
use crate::utils::mask_secret;
use crate::{ldebug, linfo};

use super::session::{AccountSession, LoginContext, SessionRegistry, TokenGrant};
use super::{
    EventSink, Provider, RefreshOutcome, ToolSpec, UpstreamClient, UpstreamEvent, UpstreamRequest,
    Usage, build_http_client, error_for_status, sse_frames,
};

pub const PROVIDER_NAME: &str = "warp";

/// bearer 剩余有效期低于该值时刷新
pub const TOKEN_MARGIN: Duration = Duration::from_secs(10 * 60);
/// 登录信标间隔
const LOGIN_INTERVAL: Duration = Duration::from_secs(30 * 60);
const DEFAULT_EXPIRES_IN: i64 = 3600;

const KNOWN_MODELS: [&str; 15] = [
    "auto",
    "auto-efficient",
    "auto-genius",
    "warp-basic",
    "gpt-5",
    "gpt-4o",
    "gpt-4.1",
    "o3",
    "o4-mini",
    "gemini-2.5-pro",
    "claude-4-sonnet",
    "claude-4-opus",
    "claude-4.1-opus",
    "claude-4-5-sonnet",
    "claude-4-5-opus",
];

const SUPPORTED_TOOL_TYPES: [u64; 19] = [6, 7, 12, 8, 9, 15, 14, 0, 11, 16, 10, 20, 17, 19, 18, 2, 3, 1, 13];
const SUPPORTED_INPUT_TYPES: [u64; 8] = [10, 20, 6, 7, 12, 9, 2, 1];

// ---------------------------------------------------------------------------
// protobuf 编码
// ---------------------------------------------------------------------------

/// 最小 protobuf 写入器；空值字段不写出
#[derive(Debug, Default)]
pub struct ProtoEncoder {
    buf: Vec<u8>,
}

impl ProtoEncoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            #[allow(clippy::cast_possible_truncation)]
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        #[allow(clippy::cast_possible_truncation)]
        self.buf.push(value as u8);
    }

    pub fn write_key(&mut self, field: u32, wire_type: u8) {
        self.write_varint((u64::from(field) << 3) | u64::from(wire_type));
    }

    fn write_len_delimited(&mut self, field: u32, bytes: &[u8]) {
        self.write_key(field, 2);
        self.write_varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_string(&mut self, field: u32, value: &str) {
        if !value.is_empty() {
            self.write_len_delimited(field, value.as_bytes());
        }
    }

    pub fn write_bool(&mut self, field: u32, value: bool) {
        if value {
            self.write_key(field, 0);
            self.write_varint(1);
        }
    }

    pub fn write_uint(&mut self, field: u32, value: u64) {
        self.write_key(field, 0);
        self.write_varint(value);
    }

    pub fn write_double(&mut self, field: u32, value: f64) {
        self.write_key(field, 1);
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_message(&mut self, field: u32, message: &[u8]) {
        if !message.is_empty() {
            self.write_len_delimited(field, message);
        }
    }

    /// 即使为空也写出的子消息
    pub fn write_empty_message(&mut self, field: u32) {
        self.write_len_delimited(field, &[]);
    }

    pub fn write_packed_varints(&mut self, field: u32, values: &[u64]) {
        if values.is_empty() {
            return;
        }
        let mut inner = Self::new();
        for value in values {
            inner.write_varint(*value);
        }
        self.write_len_delimited(field, &inner.buf);
    }
}

/// 把 JSON 编码为 `google.protobuf.Struct`
#[must_use]
pub fn encode_struct(object: &serde_json::Map<String, Value>) -> Vec<u8> {
    let mut out = ProtoEncoder::new();
    for (key, value) in object {
        let mut entry = ProtoEncoder::new();
        entry.write_string(1, key);
        entry.write_len_delimited(2, &encode_value(value));
        out.write_len_delimited(1, &entry.buf);
    }
    out.into_bytes()
}

fn encode_value(value: &Value) -> Vec<u8> {
    let mut out = ProtoEncoder::new();
    match value {
        Value::Null => out.write_uint(1, 0),
        Value::Number(n) => out.write_double(2, n.as_f64().unwrap_or_default()),
        Value::String(s) => out.write_len_delimited(3, s.as_bytes()),
        Value::Bool(b) => {
            out.write_key(4, 0);
            out.write_varint(u64::from(*b));
        }
        Value::Object(map) => out.write_len_delimited(5, &encode_struct(map)),
        Value::Array(items) => {
            let mut list = ProtoEncoder::new();
            for item in items {
                list.write_len_delimited(1, &encode_value(item));
            }
            out.write_len_delimited(6, &list.buf);
        }
    }
    out.into_bytes()
}

/// 把外部模型名映射到 Warp 认识的模型
#[must_use]
pub fn normalize_model(model: &str, default_model: &str) -> String {
    let model = model.trim().to_lowercase();
    if model.is_empty() {
        return default_model.to_string();
    }
    if KNOWN_MODELS.contains(&model.as_str()) {
        return model;
    }
    let mapped = if model.contains("sonnet-4-5") || model.contains("sonnet 4.5") {
        "claude-4-5-sonnet"
    } else if model.contains("opus-4-5") || model.contains("opus 4.5") {
        "claude-4-5-opus"
    } else if model.contains("sonnet-4") {
        "claude-4-sonnet"
    } else if model.contains("opus-4") || model.contains("opus 4") {
        "claude-4-opus"
    } else {
        default_model
    };
    mapped.to_string()
}

fn build_input_context(os_name: &str, workdir: &str, now: chrono::DateTime<Utc>) -> Vec<u8> {
    let pwd = if workdir.trim().is_empty() {
        std::env::current_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_default()
    } else {
        workdir.trim().to_string()
    };
    let home = std::env::var("HOME").unwrap_or_default();
    let shell = std::env::var("SHELL")
        .ok()
        .and_then(|s| s.rsplit('/').next().map(str::to_string))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "zsh".to_string());

    let mut dir = ProtoEncoder::new();
    dir.write_string(1, &pwd);
    dir.write_string(2, &home);

    let mut os = ProtoEncoder::new();
    os.write_string(1, os_name);

    let mut sh = ProtoEncoder::new();
    sh.write_string(1, &shell);

    let mut ts = ProtoEncoder::new();
    ts.write_uint(1, u64::try_from(now.timestamp()).unwrap_or_default());
    ts.write_uint(2, u64::from(now.timestamp_subsec_nanos()));

    let mut ctx = ProtoEncoder::new();
    ctx.write_message(1, &dir.into_bytes());
    ctx.write_message(2, &os.into_bytes());
    ctx.write_message(3, &sh.into_bytes());
    ctx.write_message(4, &ts.into_bytes());
    ctx.into_bytes()
}

fn build_settings(model: &str, tools_enabled: bool) -> Vec<u8> {
    let mut model_cfg = ProtoEncoder::new();
    model_cfg.write_string(1, model);
    model_cfg.write_string(2, "o3");
    model_cfg.write_string(4, "auto");

    let mut settings = ProtoEncoder::new();
    settings.write_message(1, &model_cfg.into_bytes());
    for field in [2, 3, 4, 6, 7, 8, 10, 11, 12, 13, 14, 15, 16, 17, 21, 23] {
        settings.write_bool(field, true);
    }
    if tools_enabled {
        settings.write_packed_varints(9, &SUPPORTED_TOOL_TYPES);
    }
    settings.write_packed_varints(22, &SUPPORTED_INPUT_TYPES);
    settings.into_bytes()
}

fn build_mcp_context(tools: &[ToolSpec]) -> Vec<u8> {
    let mut ctx = ProtoEncoder::new();
    for tool in tools.iter().filter(|t| !t.name.trim().is_empty()) {
        let mut msg = ProtoEncoder::new();
        msg.write_string(1, &tool.name);
        msg.write_string(2, &tool.description);
        if let Some(Value::Object(schema)) = &tool.input_schema {
            msg.write_message(3, &encode_struct(schema));
        }
        ctx.write_message(2, &msg.into_bytes());
    }
    ctx.into_bytes()
}

/// 构造 Warp 请求体
pub fn build_request_bytes(request: &UpstreamRequest, config: &WarpConfig) -> Result<Vec<u8>> {
    if request.prompt.trim().is_empty() {
        return Err(ProxyError::validation("empty prompt"));
    }
    let transcript = request.transcript();
    let prompt = transcript.trim();
    let disable_tools = config.disable_tools || request.no_tools;
    let prompt = if disable_tools && !config.no_tools_prompt.trim().is_empty() {
        format!("{}\n\n{prompt}", config.no_tools_prompt.trim())
    } else {
        prompt.to_string()
    };

    let mut query = ProtoEncoder::new();
    query.write_string(1, &prompt);
    query.write_bool(4, !request.has_history());

    let mut input = ProtoEncoder::new();
    input.write_message(1, &build_input_context(&config.os_name, &request.workdir, Utc::now()));
    input.write_message(2, &query.into_bytes());

    let model = normalize_model(&request.model, &config.default_model);
    let mut out = ProtoEncoder::new();
    out.write_empty_message(1);
    out.write_message(2, &input.into_bytes());
    out.write_message(3, &build_settings(&model, !disable_tools));
    if !disable_tools {
        out.write_message(6, &build_mcp_context(&request.tools));
    }
    Ok(out.into_bytes())
}

// ---------------------------------------------------------------------------
// 响应解码
// ---------------------------------------------------------------------------

/// `data:` 块的 base64 解码，依次尝试 raw-url、url、std 三种字母表
pub fn decode_payload(data: &str) -> Result<Vec<u8>> {
    let data: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    if data.is_empty() {
        return Err(ProxyError::validation("empty payload"));
    }
    URL_SAFE_NO_PAD
        .decode(&data)
        .or_else(|_| URL_SAFE.decode(&data))
        .or_else(|_| STANDARD.decode(&data))
        .map_err(|e| ProxyError::serialization("warp payload base64 解码失败", e))
}

/// 一帧解析出的内容
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WarpFrame {
    pub text_deltas: Vec<String>,
    pub reasoning_deltas: Vec<String>,
    /// (id, name, input)
    pub tool_calls: Vec<(String, String, Value)>,
    pub finish: Option<Usage>,
}

/// 帧解码器
pub trait WarpEventCodec: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<WarpFrame>;
}

/// protobuf 读取器
struct ProtoReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

enum ProtoValue<'a> {
    Varint(u64),
    Bytes(&'a [u8]),
    Fixed,
}

impl<'a> ProtoReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(ProxyError::validation("truncated varint"));
            };
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProxyError::validation("varint overflow"))
    }

    fn next_field(&mut self) -> Result<Option<(u64, ProtoValue<'a>)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let key = self.varint()?;
        let field = key >> 3;
        let value = match key & 0x7 {
            0 => ProtoValue::Varint(self.varint()?),
            1 => {
                self.skip(8)?;
                ProtoValue::Fixed
            }
            2 => {
                let len = usize::try_from(self.varint()?)
                    .map_err(|_| ProxyError::validation("length overflow"))?;
                let start = self.pos;
                self.skip(len)?;
                ProtoValue::Bytes(&self.buf[start..start + len])
            }
            5 => {
                self.skip(4)?;
                ProtoValue::Fixed
            }
            other => {
                return Err(ProxyError::validation(format!("unsupported wire type {other}")));
            }
        };
        Ok(Some((field, value)))
    }

    fn skip(&mut self, n: usize) -> Result<()> {
        if self.buf.len().saturating_sub(self.pos) < n {
            return Err(ProxyError::validation("truncated field"));
        }
        self.pos += n;
        Ok(())
    }
}

fn utf8(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// 默认帧格式：
///
/// | 字段 | 含义 |
/// |---|---|
/// | 1 | 文本增量 |
/// | 2 | 推理增量 |
/// | 3 | 工具调用 `{1: id, 2: name, 3: input JSON}` |
/// | 4 | 结束 `{1: input_tokens, 2: output_tokens}` |
#[derive(Debug, Clone, Copy, Default)]
pub struct ProtoEventCodec;

impl WarpEventCodec for ProtoEventCodec {
    fn decode(&self, payload: &[u8]) -> Result<WarpFrame> {
        let mut frame = WarpFrame::default();
        let mut reader = ProtoReader::new(payload);
        while let Some((field, value)) = reader.next_field()? {
            match (field, value) {
                (1, ProtoValue::Bytes(b)) => frame.text_deltas.push(utf8(b)),
                (2, ProtoValue::Bytes(b)) => frame.reasoning_deltas.push(utf8(b)),
                (3, ProtoValue::Bytes(b)) => {
                    let mut call = ProtoReader::new(b);
                    let (mut id, mut name, mut input) = (String::new(), String::new(), Value::Null);
                    while let Some((f, v)) = call.next_field()? {
                        match (f, v) {
                            (1, ProtoValue::Bytes(s)) => id = utf8(s),
                            (2, ProtoValue::Bytes(s)) => name = utf8(s),
                            (3, ProtoValue::Bytes(s)) => {
                                input = serde_json::from_slice(s).unwrap_or_else(|_| Value::String(utf8(s)));
                            }
                            _ => {}
                        }
                    }
                    if input.is_null() {
                        input = Value::Object(serde_json::Map::new());
                    }
                    frame.tool_calls.push((id, name, input));
                }
                (4, ProtoValue::Bytes(b)) => {
                    let mut usage = Usage::default();
                    let mut fin = ProtoReader::new(b);
                    while let Some((f, v)) = fin.next_field()? {
                        match (f, v) {
                            (1, ProtoValue::Varint(n)) => usage.input_tokens = n,
                            (2, ProtoValue::Varint(n)) => usage.output_tokens = n,
                            _ => {}
                        }
                    }
                    frame.finish = Some(usage);
                }
                _ => {}
            }
        }
        Ok(frame)
    }
}

// ---------------------------------------------------------------------------
// 客户端
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct RefreshResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default, rename = "idToken")]
    id_token: String,
    #[serde(default)]
    expires_in: Option<Value>,
    #[serde(default, rename = "expiresIn")]
    expires_in_alt: Option<Value>,
    #[serde(default)]
    refresh_token: String,
    #[serde(default, rename = "refreshToken")]
    refresh_token_alt: String,
}

fn positive_secs(value: Option<&Value>) -> Option<i64> {
    let value = value?;
    value
        .as_i64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .filter(|n| *n > 0)
}

impl RefreshResponse {
    fn into_grant(self) -> Result<TokenGrant> {
        let bearer = if self.access_token.is_empty() {
            self.id_token
        } else {
            self.access_token
        };
        if bearer.is_empty() {
            return Err(ProxyError::refresh_failed(
                PROVIDER_NAME,
                "refresh response missing access token",
            ));
        }
        let expires_in = positive_secs(self.expires_in.as_ref())
            .or_else(|| positive_secs(self.expires_in_alt.as_ref()))
            .unwrap_or(DEFAULT_EXPIRES_IN);
        let rotated = if self.refresh_token.is_empty() {
            self.refresh_token_alt
        } else {
            self.refresh_token
        };
        Ok(TokenGrant {
            bearer,
            expires_at: Utc::now() + chrono::Duration::seconds(expires_in),
            refresh_token: (!rotated.is_empty()).then_some(rotated),
        })
    }
}

/// Warp 上游客户端
pub struct WarpClient {
    config: Arc<WarpConfig>,
    http: reqwest::Client,
    session: Arc<AccountSession>,
    codec: Arc<dyn WarpEventCodec>,
    account_id: i64,
    /// 创建客户端时账号里保存的凭据
    stored_credential: String,
}

impl std::fmt::Debug for WarpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarpClient")
            .field("account_id", &self.account_id)
            .field("session", &self.session.key())
            .finish_non_exhaustive()
    }
}

impl WarpClient {
    fn client_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-warp-client-id", &self.config.client_id)
            .header("x-warp-client-version", &self.config.client_version)
            .header("x-warp-os-category", &self.config.os_category)
            .header("x-warp-os-name", &self.config.os_name)
            .header("x-warp-os-version", &self.config.os_version)
    }

    async fn refresh_grant(&self, refresh_token: String) -> Result<TokenGrant> {
        let refresh_token = refresh_token.trim().to_string();
        if refresh_token.is_empty() {
            return Err(ProxyError::refresh_failed(PROVIDER_NAME, "missing refresh token"));
        }
        let body = format!(
            "grant_type=refresh_token&refresh_token={}",
            urlencoding::encode(&refresh_token)
        );
        let response = self
            .client_headers(self.http.post(&self.config.refresh_url))
            .header("content-type", "application/x-www-form-urlencoded")
            .header("accept", "*/*")
            .body(body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ProxyError::refresh_failed(
                PROVIDER_NAME,
                format!("warp refresh token failed: HTTP {}", status.as_u16()),
            ));
        }
        let parsed: RefreshResponse = response.json().await.map_err(|e| {
            ProxyError::refresh_failed(PROVIDER_NAME, format!("invalid refresh response: {e}"))
        })?;
        let grant = parsed.into_grant()?;
        linfo!(
            "system",
            LogStage::UpstreamRequest,
            LogComponent::Warp,
            "refresh_token",
            "Warp 令牌已刷新",
            account_id = self.account_id,
            rotated = grant.refresh_token.is_some(),
            refresh_token = %mask_secret(&refresh_token)
        );
        Ok(grant)
    }

    async fn login(&self, ctx: LoginContext) -> Result<()> {
        let response = self
            .client_headers(self.http.post(&self.config.login_url))
            .bearer_auth(&ctx.bearer)
            .header("x-warp-experiment-id", &ctx.experiment_id)
            .header("x-warp-experiment-bucket", &ctx.experiment_bucket)
            .header("accept", "*/*")
            .send()
            .await?;
        if response.status() != StatusCode::NO_CONTENT {
            return Err(ProxyError::refresh_failed(
                PROVIDER_NAME,
                format!("warp login failed: HTTP {}", response.status().as_u16()),
            ));
        }
        Ok(())
    }

    async fn ensure_ready(&self) -> Result<String> {
        let bearer = self
            .session
            .ensure_token(TOKEN_MARGIN, |rt| self.refresh_grant(rt))
            .await?;
        self.session
            .ensure_login(LOGIN_INTERVAL, |ctx| self.login(ctx))
            .await?;
        Ok(bearer)
    }

    async fn dispatch_frame(&self, request_id: &str, data: &str, sink: &EventSink) -> Result<()> {
        let frame = match decode_payload(data).and_then(|bytes| self.codec.decode(&bytes)) {
            Ok(frame) => frame,
            Err(e) => {
                ldebug!(
                    request_id,
                    LogStage::Streaming,
                    LogComponent::Warp,
                    "decode_frame",
                    "跳过无法解析的 Warp 帧",
                    error = %e
                );
                return Ok(());
            }
        };
        for delta in frame.text_deltas {
            sink.text(delta).await?;
        }
        for delta in frame.reasoning_deltas {
            sink.reasoning(delta).await?;
        }
        for (id, name, input) in frame.tool_calls {
            sink.emit(UpstreamEvent::ToolCall { id, name, input }).await?;
        }
        if let Some(usage) = frame.finish {
            let usage = (usage.input_tokens > 0 || usage.output_tokens > 0).then_some(usage);
            sink.emit(UpstreamEvent::Finish {
                reason: sink.default_finish_reason(),
                usage,
            })
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl UpstreamClient for WarpClient {
    fn provider(&self) -> &str {
        PROVIDER_NAME
    }

    async fn send_request(&self, request: &UpstreamRequest, sink: &EventSink) -> Result<()> {
        let payload = build_request_bytes(request, &self.config)?;
        let bearer = self.ensure_ready().await?;

        ldebug!(
            &request.request_id,
            LogStage::UpstreamRequest,
            LogComponent::Warp,
            "send_request",
            "发送 Warp 请求",
            account_id = self.account_id,
            payload_bytes = payload.len()
        );

        let response = self
            .client_headers(self.http.post(&self.config.ai_url))
            .bearer_auth(&bearer)
            .header("accept", "text/event-stream")
            .header("content-type", "application/x-protobuf")
            .header("accept-encoding", "identity")
            .body(payload)
            .send()
            .await?;
        let response = error_for_status(PROVIDER_NAME, response).await?;

        let mut frames = sse_frames(response);
        while let Some(frame) = frames.next().await {
            let event = frame.map_err(|e| ProxyError::network_with_source("warp stream read failed", e))?;
            if event.is_done() || event.data.is_empty() {
                continue;
            }
            self.dispatch_frame(&request.request_id, &event.data, sink).await?;
        }
        sink.finish_if_missing().await
    }

    async fn rotated_refresh_token(&self) -> Option<String> {
        let current = self.session.refresh_token().await;
        (!current.is_empty() && current != self.stored_credential).then_some(current)
    }

    async fn refresh_account(&self) -> Result<RefreshOutcome> {
        let grant = self.session.force_refresh(|rt| self.refresh_grant(rt)).await?;
        Ok(RefreshOutcome {
            bearer: grant.bearer,
            refresh_token: grant.refresh_token,
            expires_at: Some(grant.expires_at),
            rate_limit: None,
        })
    }
}

/// Warp 工厂
pub struct WarpProvider {
    config: Arc<WarpConfig>,
    http: reqwest::Client,
    sessions: Arc<SessionRegistry>,
    codec: Arc<dyn WarpEventCodec>,
}

impl WarpProvider {
    pub fn new(config: WarpConfig, sessions: Arc<SessionRegistry>) -> Result<Self> {
        let http = build_http_client(
            Duration::from_secs(config.request_timeout_secs.max(1)),
            "warp-client",
        )?;
        Ok(Self {
            config: Arc::new(config),
            http,
            sessions,
            codec: Arc::new(ProtoEventCodec),
        })
    }

    /// 替换帧解码器
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn WarpEventCodec>) -> Self {
        self.codec = codec;
        self
    }
}

impl Provider for WarpProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn new_client(&self, account: &Account) -> Arc<dyn UpstreamClient> {
        Arc::new(WarpClient {
            config: Arc::clone(&self.config),
            http: self.http.clone(),
            session: self.sessions.get_or_create(PROVIDER_NAME, account),
            codec: Arc::clone(&self.codec),
            account_id: account.id,
            stored_credential: account.credential().trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn frame(build: impl FnOnce(&mut ProtoEncoder)) -> String {
        let mut enc = ProtoEncoder::new();
        build(&mut enc);
        URL_SAFE_NO_PAD.encode(enc.into_bytes())
    }

    fn config(server: &MockServer) -> WarpConfig {
        WarpConfig {
            ai_url: format!("{}/ai/multi-agent", server.uri()),
            refresh_url: format!("{}/proxy/token", server.uri()),
            login_url: format!("{}/client/login", server.uri()),
            ..WarpConfig::default()
        }
    }

    fn account() -> Account {
        Account {
            id: 11,
            account_type: "warp".into(),
            refresh_token: "rt-original".into(),
            ..Account::default()
        }
    }

    async fn collect(client: &Arc<dyn UpstreamClient>, prompt: &str) -> Result<Vec<UpstreamEvent>> {
        let (sink, mut rx) = EventSink::channel(64);
        let request = UpstreamRequest {
            prompt: prompt.into(),
            model: "claude-sonnet-4-5".into(),
            ..UpstreamRequest::default()
        };
        client.send_request(&request, &sink).await?;
        drop(sink);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        Ok(events)
    }

    #[test]
    fn test_varint_encoding() {
        let mut enc = ProtoEncoder::new();
        enc.write_varint(300);
        assert_eq!(enc.into_bytes(), vec![0xac, 0x02]);
    }

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("", "auto"), "auto");
        assert_eq!(normalize_model("GPT-5", "auto"), "gpt-5");
        assert_eq!(normalize_model("claude-sonnet-4-5-20250929", "auto"), "claude-4-5-sonnet");
        assert_eq!(normalize_model("claude-opus-4-1", "auto"), "claude-4-opus");
        assert_eq!(normalize_model("mystery", "auto"), "auto");
    }

    #[test]
    fn test_request_starts_with_empty_task_context() {
        let cfg = WarpConfig::default();
        let request = UpstreamRequest {
            prompt: "hello".into(),
            ..UpstreamRequest::default()
        };
        let bytes = build_request_bytes(&request, &cfg).unwrap();
        assert_eq!(&bytes[..2], &[0x0a, 0x00]);
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains(cfg.no_tools_prompt.as_str()));
        assert!(text.contains("hello"));
    }

    #[test]
    fn test_empty_prompt_rejected() {
        let err = build_request_bytes(&UpstreamRequest::default(), &WarpConfig::default()).unwrap_err();
        assert!(matches!(err, ProxyError::Validation { .. }));
    }

    #[test]
    fn test_tools_encoded_only_when_enabled() {
        let cfg = WarpConfig {
            disable_tools: false,
            ..WarpConfig::default()
        };
        let request = UpstreamRequest {
            prompt: "hi".into(),
            tools: vec![ToolSpec {
                name: "read_file".into(),
                description: "read".into(),
                input_schema: Some(serde_json::json!({"type": "object"})),
            }],
            ..UpstreamRequest::default()
        };
        let with_tools = build_request_bytes(&request, &cfg).unwrap();
        assert!(String::from_utf8_lossy(&with_tools).contains("read_file"));

        let request = UpstreamRequest {
            no_tools: true,
            ..request
        };
        let without = build_request_bytes(&request, &cfg).unwrap();
        assert!(!String::from_utf8_lossy(&without).contains("read_file"));
    }

    #[test]
    fn test_payload_decoding_is_alphabet_tolerant() {
        let raw = vec![0xfb, 0xff, 0x01];
        assert_eq!(decode_payload(&URL_SAFE_NO_PAD.encode(&raw)).unwrap(), raw);
        assert_eq!(decode_payload(&URL_SAFE.encode(&raw)).unwrap(), raw);
        assert_eq!(decode_payload(&STANDARD.encode(&raw)).unwrap(), raw);
        assert!(decode_payload("").is_err());
    }

    #[test]
    fn test_codec_decodes_all_event_kinds() {
        let mut call = ProtoEncoder::new();
        call.write_string(1, "call-1");
        call.write_string(2, "ls");
        call.write_string(3, r#"{"path":"."}"#);
        let mut fin = ProtoEncoder::new();
        fin.write_uint(1, 12);
        fin.write_uint(2, 34);
        let mut enc = ProtoEncoder::new();
        enc.write_string(1, "hello");
        enc.write_string(2, "thinking");
        enc.write_message(3, &call.into_bytes());
        enc.write_message(4, &fin.into_bytes());
        enc.write_uint(9, 1);

        let frame = ProtoEventCodec.decode(&enc.into_bytes()).unwrap();
        assert_eq!(frame.text_deltas, vec!["hello"]);
        assert_eq!(frame.reasoning_deltas, vec!["thinking"]);
        assert_eq!(frame.tool_calls[0].2["path"], ".");
        assert_eq!(
            frame.finish,
            Some(Usage {
                input_tokens: 12,
                output_tokens: 34
            })
        );
        assert!(ProtoEventCodec.decode(&[0x0a, 0x05, b'x']).is_err());
    }

    #[tokio::test]
    async fn test_stream_with_refresh_login_and_synthesized_finish() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/proxy/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "jwt-1",
                "expires_in": 3600,
                "refresh_token": "rt-rotated"
            })))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/client/login"))
            .and(header("authorization", "Bearer jwt-1"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;
        let body = format!(
            "data: {}\n\n: keepalive\n\ndata: not-base64!!\n\ndata: {}\n\n",
            frame(|e| e.write_string(1, "Hel")),
            frame(|e| e.write_string(1, "lo")),
        );
        Mock::given(method("POST"))
            .and(path("/ai/multi-agent"))
            .and(header("x-warp-client-id", "warp-app"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .expect(2)
            .mount(&server)
            .await;

        let sessions = Arc::new(SessionRegistry::new());
        let provider = WarpProvider::new(config(&server), Arc::clone(&sessions)).unwrap();
        let client = provider.new_client(&account());
        for _ in 0..2 {
            let events = collect(&client, "hi").await.unwrap();
            assert_eq!(
                events,
                vec![
                    UpstreamEvent::TextDelta("Hel".into()),
                    UpstreamEvent::TextDelta("lo".into()),
                    UpstreamEvent::Finish {
                        reason: crate::provider::FinishReason::EndTurn,
                        usage: None
                    },
                ]
            );
        }
        let session = sessions.get_or_create(PROVIDER_NAME, &account());
        assert_eq!(session.refresh_token().await, "rt-rotated");
        assert_eq!(client.rotated_refresh_token().await.as_deref(), Some("rt-rotated"));

        // 账号已写回新凭据后不再报告轮换
        let synced = Account {
            refresh_token: "rt-rotated".into(),
            ..account()
        };
        assert!(sessions.rekey(PROVIDER_NAME, synced.id, "rt-original", "rt-rotated"));
        let client = provider.new_client(&synced);
        assert_eq!(client.rotated_refresh_token().await, None);
    }

    #[tokio::test]
    async fn test_explicit_finish_is_not_duplicated() {
        let server = MockServer::start().await;
        Mock::given(path("/proxy/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "idToken": "jwt", "expiresIn": "3600"
            })))
            .mount(&server)
            .await;
        Mock::given(path("/client/login"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        let mut fin = ProtoEncoder::new();
        fin.write_uint(2, 5);
        let fin = fin.into_bytes();
        let body = format!(
            "data: {}\n\ndata: {}\n\n",
            frame(|e| {
                let mut call = ProtoEncoder::new();
                call.write_string(1, "c1");
                call.write_string(2, "ls");
                e.write_message(3, &call.into_bytes());
            }),
            frame(|e| e.write_message(4, &fin)),
        );
        Mock::given(path("/ai/multi-agent"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
            .mount(&server)
            .await;

        let provider = WarpProvider::new(config(&server), Arc::new(SessionRegistry::new())).unwrap();
        let events = collect(&provider.new_client(&account()), "hi").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            UpstreamEvent::Finish {
                reason: crate::provider::FinishReason::ToolUse,
                usage: Some(Usage {
                    input_tokens: 0,
                    output_tokens: 5
                })
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_failure_is_typed() {
        let server = MockServer::start().await;
        Mock::given(path("/proxy/token"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let provider = WarpProvider::new(config(&server), Arc::new(SessionRegistry::new())).unwrap();
        let err = provider
            .new_client(&account())
            .refresh_account()
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::RefreshFailed { .. }));
        assert!(err.to_string().contains("HTTP 401"));
    }

    #[tokio::test]
    async fn test_upstream_429_surfaces_status() {
        let server = MockServer::start().await;
        Mock::given(path("/proxy/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"access_token": "jwt"})))
            .mount(&server)
            .await;
        Mock::given(path("/client/login"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;
        Mock::given(path("/ai/multi-agent"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;
        let provider = WarpProvider::new(config(&server), Arc::new(SessionRegistry::new())).unwrap();
        let err = collect(&provider.new_client(&account()), "hi").await.unwrap_err();
        assert_eq!(err.upstream_status(), Some(429));
    }
}
