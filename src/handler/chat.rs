//! # 对话接口
//!
//! `POST /{provider}/v1/chat/completions` 与 `POST /{provider}/v1/messages`。
//! 上游调用在独立任务中运行，事件经通道转给编码器。首个事件到达之前失败的请求
//! 返回普通错误响应；之后的失败以流内错误帧结束。

use std::convert::Infallible;
use std::time::Instant;

use axum::{
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use super::dispatch::{DispatchError, Dispatched, resolve_model, with_account_switch};
use super::request::{ApiFormat, ParsedChat, parse_chat};
use super::transcode::{Collected, encoder_for};
use super::{HandlerState, client_ip, request_id, user_agent};
use crate::auth::bearer_token;
use crate::ephemeral::{AuditEvent, DedupGuard, duplicate_response, fingerprint};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::provider::{EventSink, UpstreamEvent, UpstreamRequest};
use crate::token_cache::estimate_request;
use crate::{ldebug, linfo, lwarn};

/// 上游事件通道容量
const EVENT_BUFFER: usize = 64;

type DispatchHandle = JoinHandle<std::result::Result<Dispatched<()>, DispatchError>>;

/// 一次对话请求的上下文，贯穿分派、转码与审计
struct ChatCall {
    state: HandlerState,
    request_id: String,
    format: ApiFormat,
    channel: String,
    model: String,
    conversation_key: String,
    conversation_id: String,
    workdir: String,
    input_tokens: u64,
    client_ip: String,
    user_agent: String,
    started: Instant,
}

impl ChatCall {
    async fn finish(&self, outcome: &std::result::Result<Dispatched<()>, DispatchError>) {
        let mut event = AuditEvent::new("chat", if outcome.is_ok() { "success" } else { "error" });
        event.model.clone_from(&self.model);
        event.channel.clone_from(&self.channel);
        event.client_ip.clone_from(&self.client_ip);
        event.user_agent.clone_from(&self.user_agent);
        event.duration_ms = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        match outcome {
            Ok(done) => {
                event.account_id = done.account.id;
                self.remember_conversation().await;
            }
            Err(err) => {
                event.account_id = err.account.as_ref().map_or(0, |a| a.id);
                event.error = err.error.public_message();
            }
        }
        self.state.audit.log(event);
    }

    async fn remember_conversation(&self) {
        if self.conversation_key.is_empty() {
            return;
        }
        let store = &self.state.conversations;
        store.set_conv_id(&self.conversation_key, &self.conversation_id).await;
        if !self.workdir.is_empty() {
            store.set_workdir(&self.conversation_key, &self.workdir).await;
        }
        store.touch(&self.conversation_key).await;
    }
}

fn spawn_dispatch(call: &ChatCall, upstream: UpstreamRequest, sink: EventSink) -> DispatchHandle {
    let state = call.state.clone();
    let request_id = call.request_id.clone();
    let channel = call.channel.clone();
    tokio::spawn(async move {
        let probe = sink.clone();
        with_account_switch(
            &state,
            &request_id,
            &channel,
            move || probe.emitted() == 0,
            |client, _account| {
                let sink = sink.clone();
                let upstream = upstream.clone();
                async move { client.send_request(&upstream, &sink).await }
            },
        )
        .await
    })
}

async fn join_dispatch(handle: DispatchHandle) -> std::result::Result<Dispatched<()>, DispatchError> {
    handle.await.unwrap_or_else(|e| {
        Err(DispatchError {
            error: ProxyError::internal(format!("dispatch task failed: {e}")),
            account: None,
        })
    })
}

/// 会话记忆：补全 workdir，沿用或新建上游会话 ID
async fn apply_conversation(state: &HandlerState, parsed: &mut ParsedChat) -> String {
    if parsed.conversation_key.is_empty() {
        return String::new();
    }
    let remembered = state.conversations.get(&parsed.conversation_key).await.unwrap_or_default();
    if parsed.workdir.is_empty() {
        parsed.workdir = remembered.workdir;
    }
    if remembered.conv_id.is_empty() {
        uuid::Uuid::new_v4().to_string()
    } else {
        remembered.conv_id
    }
}

async fn register_dedup(
    state: &HandlerState,
    headers: &HeaderMap,
    path: &str,
    body: &[u8],
) -> std::result::Result<Option<DedupGuard>, Response> {
    let Some(store) = state.dedup.clone() else {
        return Ok(None);
    };
    let user = bearer_token(headers).map_or_else(|| client_ip(headers), str::to_string);
    let fp = fingerprint("POST", path, body, &user);
    DedupGuard::register(store, fp)
        .await
        .map_err(|_| duplicate_response())
}

/// 对话请求入口
pub async fn handle_chat(
    state: HandlerState,
    format: ApiFormat,
    provider: &str,
    path: &str,
    headers: &HeaderMap,
    body: &Bytes,
) -> Result<Response> {
    let rid = request_id(headers);
    let channel = provider.trim().to_lowercase();
    if !state.providers.contains(&channel) {
        return Err(ProxyError::not_found(format!("unknown provider: {provider}")));
    }
    let raw: Value = serde_json::from_slice(body)
        .map_err(|e| ProxyError::validation(format!("invalid json body: {e}")))?;
    let mut parsed = parse_chat(format, &raw)?;

    let guard = match register_dedup(&state, headers, path, body).await {
        Ok(guard) => guard,
        Err(response) => {
            lwarn!(&rid, LogStage::Authentication, LogComponent::Dedup, "dedup", "重复请求仍在处理中");
            return Ok(response);
        }
    };

    let model = resolve_model(&state, &channel, &parsed.model).await?;
    let conversation_id = apply_conversation(&state, &mut parsed).await;
    let input_tokens = estimate_request(&parsed.system, &parsed.messages, &parsed.tools).total;

    let mut upstream = parsed.to_upstream(&rid, &model.model_id);
    upstream.conversation_id.clone_from(&conversation_id);

    linfo!(
        &rid,
        LogStage::UpstreamRequest,
        LogComponent::Router,
        "chat",
        "开始处理对话请求",
        format = format.as_str(),
        channel = %channel,
        model = %model.model_id,
        stream = parsed.stream,
        messages = parsed.messages.len()
    );

    let call = ChatCall {
        state: state.clone(),
        request_id: rid,
        format,
        channel,
        model: model.model_id.clone(),
        conversation_key: parsed.conversation_key.clone(),
        conversation_id,
        workdir: parsed.workdir.clone(),
        input_tokens,
        client_ip: client_ip(headers),
        user_agent: user_agent(headers),
        started: Instant::now(),
    };

    let (sink, mut rx) = EventSink::channel(EVENT_BUFFER);
    let handle = spawn_dispatch(&call, upstream, sink);

    // 首个事件到达前的失败按普通错误返回
    let Some(first) = rx.recv().await else {
        let outcome = join_dispatch(handle).await;
        call.finish(&outcome).await;
        if let Some(guard) = &guard {
            guard.finish().await;
        }
        return match outcome {
            Ok(_) => Err(ProxyError::network("upstream closed without events")),
            Err(err) => Err(err.into()),
        };
    };

    if parsed.stream {
        Ok(stream_response(call, first, rx, handle, guard))
    } else {
        let result = collect_response(&call, first, rx, handle).await;
        if let Some(guard) = &guard {
            guard.finish().await;
        }
        result
    }
}

async fn collect_response(
    call: &ChatCall,
    first: UpstreamEvent,
    mut rx: mpsc::Receiver<UpstreamEvent>,
    handle: DispatchHandle,
) -> Result<Response> {
    let mut collected = Collected::default();
    collected.push(first);
    let mut count = 1u64;
    while let Some(event) = rx.recv().await {
        collected.push(event);
        count += 1;
    }
    call.state.metrics.record_stream_events(count);
    let outcome = join_dispatch(handle).await;
    call.finish(&outcome).await;
    outcome.map_err(ProxyError::from)?;
    let body = collected.render(call.format, &call.model, call.input_tokens);
    Ok((StatusCode::OK, axum::Json(body)).into_response())
}

fn stream_response(
    call: ChatCall,
    first: UpstreamEvent,
    mut rx: mpsc::Receiver<UpstreamEvent>,
    handle: DispatchHandle,
    guard: Option<DedupGuard>,
) -> Response {
    let (out_tx, out_rx) = mpsc::channel::<std::result::Result<Bytes, Infallible>>(EVENT_BUFFER);
    tokio::spawn(async move {
        let mut encoder = encoder_for(call.format, &call.model, call.input_tokens);
        let mut frames = encoder.start();
        frames.extend(encoder.encode(&first));
        let mut count = 1u64;
        let mut connected = send_all(&out_tx, frames).await;
        while connected {
            let Some(event) = rx.recv().await else {
                break;
            };
            count += 1;
            connected = send_all(&out_tx, encoder.encode(&event)).await;
        }
        // 下游断开后丢弃接收端，上游推送随即返回取消错误
        drop(rx);
        call.state.metrics.record_stream_events(count);

        let outcome = join_dispatch(handle).await;
        if connected {
            let mut tail = Vec::new();
            if let Err(err) = &outcome {
                tail.extend(encoder.error(&err.error.public_message()));
            }
            tail.extend(encoder.end());
            send_all(&out_tx, tail).await;
        } else {
            ldebug!(
                &call.request_id,
                LogStage::Streaming,
                LogComponent::Router,
                "stream",
                "客户端已断开",
                events = count
            );
        }
        call.finish(&outcome).await;
        if let Some(guard) = guard {
            guard.finish().await;
        }
    });

    let mut response = Response::new(Body::from_stream(ReceiverStream::new(out_rx)));
    let headers = response.headers_mut();
    headers.insert(header::CONTENT_TYPE, header::HeaderValue::from_static("text/event-stream"));
    headers.insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-cache"));
    headers.insert(header::CONNECTION, header::HeaderValue::from_static("keep-alive"));
    headers.insert("x-accel-buffering", header::HeaderValue::from_static("no"));
    response
}

async fn send_all(
    tx: &mpsc::Sender<std::result::Result<Bytes, Infallible>>,
    frames: Vec<Bytes>,
) -> bool {
    for frame in frames {
        if tx.send(Ok(frame)).await.is_err() {
            return false;
        }
    }
    true
}

/// `POST /{provider}/v1/chat/completions`
pub async fn chat_completions(
    State(state): State<HandlerState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = format!("/{provider}/v1/chat/completions");
    handle_chat(state, ApiFormat::OpenAi, &provider, &path, &headers, &body).await
}

/// `POST /{provider}/v1/messages`
pub async fn messages(
    State(state): State<HandlerState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = format!("/{provider}/v1/messages");
    handle_chat(state, ApiFormat::Anthropic, &provider, &path, &headers, &body).await
}
