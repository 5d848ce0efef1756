//! # Orchids 上游
//!
//! 以 Clerk 会话换取短期 JWT，再以 JSON 请求体调用 agent 接口，响应为 SSE。
//! 每个 `data:` 是一个带 `type` 的 JSON 事件。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::config::OrchidsConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{Account, RateLimitInfo};
use crate::utils::{jwt::jwt_expiry, random_hex};
use crate::{ldebug, linfo};

use super::session::{AccountSession, SessionRegistry, TokenGrant};
use super::{
    EventSink, FinishReason, Provider, RefreshOutcome, UpstreamClient, UpstreamEvent,
    UpstreamRequest, Usage, build_http_client, error_for_status, ratelimit, sse_frames,
};

pub const PROVIDER_NAME: &str = "orchids";

/// Clerk JWT 寿命很短，只留一分钟余量
const TOKEN_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_TTL_SECS: i64 = 60;
const CLERK_JS_VERSION: &str = "5.114.0";

const MODELS: [&str; 5] = [
    "claude-sonnet-4-5",
    "claude-opus-4-5",
    "claude-haiku-4-5",
    "gemini-3-flash",
    "gpt-5.2",
];
const DEFAULT_MODEL: &str = "claude-sonnet-4-5";

/// 映射到 Orchids 的 agentMode
#[must_use]
pub fn normalize_model(model: &str) -> &'static str {
    let model = model.trim();
    if model == "claude-haiku-4-5" {
        return DEFAULT_MODEL;
    }
    MODELS
        .iter()
        .copied()
        .find(|m| *m == model)
        .unwrap_or(DEFAULT_MODEL)
}

/// 构造请求体
#[must_use]
pub fn build_payload(request: &UpstreamRequest, account: &Account) -> Value {
    let system = request.system.trim();
    let prompt = if system.is_empty() {
        request.prompt.trim().to_string()
    } else {
        format!("{system}\n\n{}", request.prompt.trim())
    };
    let history: Vec<Value> = request
        .messages
        .iter()
        .take(request.messages.len().saturating_sub(1))
        .map(|m| json!({"role": m.role, "content": m.content}))
        .collect();

    let project_id = (!account.project_id.is_empty()).then_some(account.project_id.as_str());
    let email = if account.email.is_empty() {
        "bridge@localhost"
    } else {
        account.email.as_str()
    };
    let user_id = if account.user_id.is_empty() {
        "local_user"
    } else {
        account.user_id.as_str()
    };
    let chat_session_id = if request.conversation_id.is_empty() {
        format!("chat_{}", random_hex(6))
    } else {
        request.conversation_id.clone()
    };
    let mut payload = json!({
        "projectId": project_id,
        "chatSessionId": chat_session_id,
        "prompt": prompt,
        "agentMode": normalize_model(&request.model),
        "mode": "agent",
        "chatHistory": history,
        "email": email,
        "userId": user_id,
        "isFixingErrors": false,
    });
    if !request.no_tools && !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.input_schema.clone().unwrap_or_else(|| json!({"type": "object"})),
                })
            })
            .collect();
        payload["tools"] = Value::Array(tools);
    }
    payload
}

#[derive(Debug, Default, Deserialize)]
struct ClerkTokenResponse {
    #[serde(default)]
    jwt: String,
}

/// 解析一条 SSE 事件
fn parse_event(raw: &Value) -> Option<ParsedEvent> {
    let kind = raw.get("type").and_then(Value::as_str)?;
    let kind = kind.strip_prefix("model.").unwrap_or(kind);
    let text = |key: &str| raw.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    match kind {
        "text-delta" => Some(ParsedEvent::Text(text("delta"))),
        "reasoning-delta" => Some(ParsedEvent::Reasoning(text("delta"))),
        "tool-call" => {
            let input = match raw.get("input") {
                Some(Value::String(s)) => serde_json::from_str(s).unwrap_or_else(|_| json!({})),
                Some(v) if !v.is_null() => v.clone(),
                _ => json!({}),
            };
            Some(ParsedEvent::ToolCall {
                id: text("toolCallId"),
                name: text("toolName"),
                input,
            })
        }
        "finish" => {
            let usage = raw.get("usage").map(|u| Usage {
                input_tokens: u.get("inputTokens").and_then(Value::as_u64).unwrap_or_default(),
                output_tokens: u.get("outputTokens").and_then(Value::as_u64).unwrap_or_default(),
            });
            let reason = match raw.get("finishReason").and_then(Value::as_str) {
                Some("tool-calls" | "tool_calls" | "tool_use") => Some(FinishReason::ToolUse),
                Some(_) => Some(FinishReason::EndTurn),
                None => None,
            };
            Some(ParsedEvent::Finish { reason, usage })
        }
        "error" => Some(ParsedEvent::Error(text("message"))),
        _ => None,
    }
}

#[derive(Debug, PartialEq)]
enum ParsedEvent {
    Text(String),
    Reasoning(String),
    ToolCall { id: String, name: String, input: Value },
    Finish { reason: Option<FinishReason>, usage: Option<Usage> },
    Error(String),
}

/// Orchids 上游客户端
pub struct OrchidsClient {
    config: Arc<OrchidsConfig>,
    http: reqwest::Client,
    session: Arc<AccountSession>,
    account: Account,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl std::fmt::Debug for OrchidsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchidsClient")
            .field("account_id", &self.account.id)
            .finish_non_exhaustive()
    }
}

impl OrchidsClient {
    async fn clerk_refresh(&self, client_cookie: String) -> Result<TokenGrant> {
        let session_id = self.account.session_id.trim();
        if session_id.is_empty() {
            return Err(ProxyError::refresh_failed(
                PROVIDER_NAME,
                "no session id available for refresh",
            ));
        }
        if client_cookie.trim().is_empty() {
            return Err(ProxyError::refresh_failed(PROVIDER_NAME, "missing client cookie"));
        }
        let url = format!(
            "{}?_clerk_js_version={CLERK_JS_VERSION}",
            self.config.clerk_token_url.replace("{session_id}", session_id)
        );
        let response = self
            .http
            .post(url)
            .header("cookie", format!("__client={}", client_cookie.trim()))
            .header("origin", &self.config.origin)
            .header("content-type", "application/x-www-form-urlencoded")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(256).collect();
            return Err(ProxyError::refresh_failed(
                PROVIDER_NAME,
                format!("token refresh failed {}: {snippet}", status.as_u16()),
            ));
        }
        let parsed: ClerkTokenResponse = response.json().await.map_err(|e| {
            ProxyError::refresh_failed(PROVIDER_NAME, format!("invalid clerk response: {e}"))
        })?;
        if parsed.jwt.is_empty() {
            return Err(ProxyError::refresh_failed(PROVIDER_NAME, "empty jwt in refresh response"));
        }
        let expires_at = jwt_expiry(&parsed.jwt)
            .unwrap_or_else(|| Utc::now() + chrono::Duration::seconds(DEFAULT_TOKEN_TTL_SECS));
        linfo!(
            "system",
            LogStage::UpstreamRequest,
            LogComponent::Orchids,
            "clerk_refresh",
            "Orchids 令牌已刷新",
            account_id = self.account.id,
            expires_at = %expires_at
        );
        Ok(TokenGrant {
            bearer: parsed.jwt,
            expires_at,
            refresh_token: None,
        })
    }

    async fn dispatch(&self, request_id: &str, data: &str, sink: &EventSink) -> Result<()> {
        let Ok(raw) = serde_json::from_str::<Value>(data) else {
            ldebug!(
                request_id,
                LogStage::Streaming,
                LogComponent::Orchids,
                "decode_event",
                "跳过无法解析的 Orchids 事件"
            );
            return Ok(());
        };
        match parse_event(&raw) {
            Some(ParsedEvent::Text(delta)) => sink.text(delta).await,
            Some(ParsedEvent::Reasoning(delta)) => sink.reasoning(delta).await,
            Some(ParsedEvent::ToolCall { id, name, input }) => {
                sink.emit(UpstreamEvent::ToolCall { id, name, input }).await
            }
            Some(ParsedEvent::Finish { reason, usage }) => {
                let reason = match reason {
                    Some(FinishReason::ToolUse) => FinishReason::ToolUse,
                    _ => sink.default_finish_reason(),
                };
                sink.emit(UpstreamEvent::Finish { reason, usage }).await
            }
            Some(ParsedEvent::Error(message)) => {
                Err(ProxyError::upstream(PROVIDER_NAME, 502, format!("orchids stream error: {message}")))
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl UpstreamClient for OrchidsClient {
    fn provider(&self) -> &str {
        PROVIDER_NAME
    }

    async fn send_request(&self, request: &UpstreamRequest, sink: &EventSink) -> Result<()> {
        if request.prompt.trim().is_empty() {
            return Err(ProxyError::validation("empty prompt"));
        }
        let bearer = self
            .session
            .ensure_token(TOKEN_MARGIN, |cookie| self.clerk_refresh(cookie))
            .await?;
        let payload = build_payload(request, &self.account);

        ldebug!(
            &request.request_id,
            LogStage::UpstreamRequest,
            LogComponent::Orchids,
            "send_request",
            "发送 Orchids 请求",
            account_id = self.account.id,
            agent_mode = payload["agentMode"].as_str().unwrap_or_default()
        );

        let response = self
            .http
            .post(&self.config.api_url)
            .bearer_auth(&bearer)
            .header("origin", &self.config.origin)
            .header("accept", "text/event-stream")
            .json(&payload)
            .send()
            .await?;
        let info = ratelimit::from_headers(response.headers(), Utc::now());
        if !info.is_empty() {
            *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
        }
        let response = error_for_status(PROVIDER_NAME, response).await?;

        let mut frames = sse_frames(response);
        while let Some(frame) = frames.next().await {
            let event =
                frame.map_err(|e| ProxyError::network_with_source("orchids stream read failed", e))?;
            if event.is_done() || event.data.is_empty() {
                continue;
            }
            self.dispatch(&request.request_id, &event.data, sink).await?;
        }
        sink.finish_if_missing().await
    }

    async fn refresh_account(&self) -> Result<RefreshOutcome> {
        let grant = self
            .session
            .force_refresh(|cookie| self.clerk_refresh(cookie))
            .await?;
        Ok(RefreshOutcome {
            bearer: grant.bearer,
            refresh_token: None,
            expires_at: Some(grant.expires_at),
            rate_limit: self.rate_limit(),
        })
    }

    fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Orchids 工厂
pub struct OrchidsProvider {
    config: Arc<OrchidsConfig>,
    http: reqwest::Client,
    sessions: Arc<SessionRegistry>,
}

impl OrchidsProvider {
    pub fn new(config: OrchidsConfig, sessions: Arc<SessionRegistry>) -> Result<Self> {
        let http = build_http_client(
            Duration::from_secs(config.request_timeout_secs.max(1)),
            &config.user_agent,
        )?;
        Ok(Self {
            config: Arc::new(config),
            http,
            sessions,
        })
    }
}

impl Provider for OrchidsProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn new_client(&self, account: &Account) -> Arc<dyn UpstreamClient> {
        Arc::new(OrchidsClient {
            config: Arc::clone(&self.config),
            http: self.http.clone(),
            session: self.sessions.get_or_create(PROVIDER_NAME, account),
            account: account.clone(),
            rate_limit: Mutex::new(None),
        })
    }
}
