//! # Imagine 连续出图
//!
//! `start` 登记一个带 TTL 的会话并返回 `task_id`；随后 SSE 或 WebSocket
//! 连接按会话的提示词循环出图，每批 6 张，直到会话被 `stop`、连接断开或服务停机。

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::{
    Json,
    body::{Body, Bytes},
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::HandlerState;
use super::dispatch::with_account_switch;
use super::files::MediaType;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::provider::ImageRequest;
use crate::provider::grok::{DEFAULT_IMAGE_MODEL, PROVIDER_NAME as GROK, resolve_aspect_ratio};
use crate::utils::random_hex;
use crate::{ldebug, lwarn};

/// 会话有效期
pub const IMAGINE_SESSION_TTL: Duration = Duration::from_secs(10 * 60);

/// 每批图片数
pub const IMAGINE_BATCH_SIZE: usize = 6;

/// 出图失败后的等待
const ERROR_BACKOFF: Duration = Duration::from_millis(1500);

const EVENT_BUFFER: usize = 16;

/// 一个 imagine 会话
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagineSession {
    pub prompt: String,
    pub aspect_ratio: String,
    created_at: Instant,
}

/// 会话表；访问时惰性过期
#[derive(Debug, Default)]
pub struct ImagineSessions {
    sessions: DashMap<String, ImagineSession>,
}

impl ImagineSessions {
    pub fn create(&self, prompt: &str, aspect_ratio: &str) -> String {
        self.sweep();
        let id = random_hex(16);
        self.sessions.insert(
            id.clone(),
            ImagineSession {
                prompt: prompt.trim().to_string(),
                aspect_ratio: resolve_aspect_ratio(aspect_ratio).to_string(),
                created_at: Instant::now(),
            },
        );
        id
    }

    #[must_use]
    pub fn get(&self, task_id: &str) -> Option<ImagineSession> {
        let id = task_id.trim();
        if id.is_empty() {
            return None;
        }
        let session = self.sessions.get(id).map(|s| s.clone())?;
        if session.created_at.elapsed() <= IMAGINE_SESSION_TTL {
            return Some(session);
        }
        self.sessions.remove(id);
        None
    }

    pub fn delete(&self, task_id: &str) -> bool {
        self.sessions.remove(task_id.trim()).is_some()
    }

    /// 删除多个会话，返回实际删除的数量
    pub fn delete_many(&self, task_ids: &[String]) -> usize {
        task_ids.iter().filter(|id| self.delete(id)).count()
    }

    /// 清理过期会话
    pub fn sweep(&self) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, s| s.created_at.elapsed() <= IMAGINE_SESSION_TTL);
        before.saturating_sub(self.sessions.len())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StartBody {
    prompt: String,
    aspect_ratio: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct StopBody {
    task_ids: Vec<String>,
}

/// `POST imagine/start`
pub async fn start(State(state): State<HandlerState>, Json(body): Json<StartBody>) -> Result<Json<Value>> {
    let prompt = body.prompt.trim();
    if prompt.is_empty() {
        return Err(ProxyError::validation("prompt cannot be empty"));
    }
    let ratio = resolve_aspect_ratio(&body.aspect_ratio);
    let task_id = state.imagine.create(prompt, ratio);
    // 流式端点凭 task_id 直接放行
    state.auth.grants().insert(&task_id);
    Ok(Json(json!({ "task_id": task_id, "aspect_ratio": ratio })))
}

/// `POST imagine/stop`
pub async fn stop(State(state): State<HandlerState>, Json(body): Json<StopBody>) -> Json<Value> {
    let removed = state.imagine.delete_many(&body.task_ids);
    for id in &body.task_ids {
        state.auth.grants().revoke(id);
    }
    Json(json!({ "status": "success", "removed": removed }))
}

/// `GET /v1/public/imagine/config`
pub async fn public_config(State(state): State<HandlerState>) -> Json<Value> {
    let grok = state.config.get_config().await.grok;
    Json(json!({
        "final_min_bytes": grok.imagine_final_min_bytes,
        "medium_min_bytes": grok.imagine_medium_min_bytes,
        "nsfw": grok.imagine_nsfw,
    }))
}

/// 一张可展示的图
struct ImagineImage {
    b64: String,
    file_url: String,
}

/// 出一批图：同一账号生成并下载，下载失败的单张跳过
async fn generate_batch(
    state: &HandlerState,
    request_id: &str,
    prompt: &str,
    aspect_ratio: &str,
) -> Result<(Vec<ImagineImage>, u64)> {
    let started = Instant::now();
    let request = ImageRequest {
        model: DEFAULT_IMAGE_MODEL.to_string(),
        prompt: prompt.to_string(),
        n: IMAGINE_BATCH_SIZE,
        aspect_ratio: aspect_ratio.to_string(),
    };
    let request = &request;
    let files = state.files.as_ref();
    let done = with_account_switch(state, request_id, GROK, || true, move |client, _account| async move {
        let output = client.generate_images(request).await?;
        let mut images = Vec::with_capacity(output.urls.len());
        for url in &output.urls {
            let (data, mime) = match client.download_asset(url).await {
                Ok(asset) if !asset.0.is_empty() => asset,
                Ok(_) => continue,
                Err(e) => {
                    lwarn!(
                        request_id,
                        LogStage::Response,
                        LogComponent::Grok,
                        "imagine_download",
                        "imagine 图片下载失败",
                        url = %url,
                        error = %e
                    );
                    continue;
                }
            };
            let file_url = files
                .store(MediaType::Image, url, &data, &mime)
                .await
                .map(|name| format!("/v1/files/image/{name}"))
                .unwrap_or_default();
            images.push(ImagineImage {
                b64: STANDARD.encode(&data),
                file_url,
            });
        }
        if images.is_empty() {
            return Err(ProxyError::upstream(GROK, 502, "no usable image generated"));
        }
        Ok(images)
    })
    .await?;
    let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    Ok((done.value, elapsed))
}

/// 出图循环；事件写入 `events`，接收端关闭或令牌取消即退出
async fn run_loop(
    state: HandlerState,
    prompt: String,
    aspect_ratio: String,
    task_id: Option<String>,
    token: CancellationToken,
    events: mpsc::Sender<Value>,
) {
    let run_id = random_hex(12);
    // 取消后不再阻塞在满的通道上
    let emit = |event: Value| {
        let events = events.clone();
        let token = token.clone();
        async move {
            tokio::select! {
                () = token.cancelled() => false,
                sent = events.send(event) => sent.is_ok(),
            }
        }
    };
    if !emit(json!({
        "type": "status",
        "status": "running",
        "prompt": prompt,
        "aspect_ratio": aspect_ratio,
        "run_id": run_id,
    }))
    .await
    {
        return;
    }

    let mut sequence = 0u64;
    loop {
        if token.is_cancelled() {
            break;
        }
        if let Some(id) = &task_id {
            if state.imagine.get(id).is_none() {
                break;
            }
        }
        let batch = tokio::select! {
            () = token.cancelled() => break,
            batch = generate_batch(&state, &run_id, &prompt, &aspect_ratio) => batch,
        };
        match batch {
            Ok((images, elapsed_ms)) => {
                let created_at = chrono::Utc::now().timestamp_millis();
                for image in images {
                    sequence += 1;
                    let event = json!({
                        "type": "image",
                        "b64_json": image.b64,
                        "file_url": image.file_url,
                        "sequence": sequence,
                        "created_at": created_at,
                        "elapsed_ms": elapsed_ms,
                        "aspect_ratio": aspect_ratio,
                        "run_id": run_id,
                    });
                    if !emit(event).await {
                        return;
                    }
                }
            }
            Err(e) => {
                let event = json!({
                    "type": "error",
                    "message": e.public_message(),
                    "code": "internal_error",
                });
                if !emit(event).await {
                    return;
                }
                tokio::select! {
                    () = token.cancelled() => break,
                    () = tokio::time::sleep(ERROR_BACKOFF) => {}
                }
            }
        }
    }
    ldebug!(
        &run_id,
        LogStage::Streaming,
        LogComponent::Grok,
        "imagine_loop",
        "imagine 循环结束",
        images = sequence
    );
    let _ = events.try_send(json!({ "type": "status", "status": "stopped", "run_id": run_id }));
}

fn sse_frame(event: &Value) -> Bytes {
    Bytes::from(format!("data: {event}\n\n"))
}

/// `GET imagine/sse?task_id=…` 或 `?prompt=…&aspect_ratio=…`
pub async fn sse(
    State(state): State<HandlerState>,
    Query(query): Query<HashMap<String, String>>,
) -> Result<Response> {
    let task_id = query
        .get("task_id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    let (prompt, ratio) = match &task_id {
        Some(id) => {
            let session = state
                .imagine
                .get(id)
                .ok_or_else(|| ProxyError::not_found("task not found"))?;
            (session.prompt, session.aspect_ratio)
        }
        None => (
            query.get("prompt").map(|s| s.trim().to_string()).unwrap_or_default(),
            query.get("aspect_ratio").cloned().unwrap_or_default(),
        ),
    };
    if prompt.is_empty() {
        return Err(ProxyError::validation("prompt cannot be empty"));
    }
    let ratio = resolve_aspect_ratio(&ratio).to_string();

    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let token = state.shutdown.child_token();
    let loop_state = state.clone();
    let loop_task = task_id.clone();
    tokio::spawn(async move {
        run_loop(loop_state.clone(), prompt, ratio, loop_task.clone(), token, tx).await;
        if let Some(id) = loop_task {
            loop_state.imagine.delete(&id);
        }
    });

    let stream = ReceiverStream::new(rx).map(|event| Ok::<_, Infallible>(sse_frame(&event)));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// `GET imagine/ws`
pub async fn ws(
    State(state): State<HandlerState>,
    Query(query): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Result<Response> {
    let task_id = query
        .get("task_id")
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    if let Some(id) = &task_id {
        if state.imagine.get(id).is_none() {
            return Err(ProxyError::not_found("task not found"));
        }
    }
    Ok(upgrade.on_upgrade(move |socket| handle_socket(socket, state, task_id)))
}

/// 当前运行中的循环
struct ActiveRun {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

async fn stop_run(run: &mut Option<ActiveRun>) {
    if let Some(active) = run.take() {
        active.token.cancel();
        let _ = active.handle.await;
    }
}

/// 客户端命令：`start` / `stop` / `ping`
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Command {
    #[serde(rename = "type")]
    kind: String,
    prompt: String,
    aspect_ratio: String,
}

fn command_error(message: &str, code: &str) -> Value {
    json!({ "type": "error", "message": message, "code": code })
}

async fn handle_socket(mut socket: WebSocket, state: HandlerState, task_id: Option<String>) {
    let (tx, mut rx) = mpsc::channel::<Value>(EVENT_BUFFER);
    let mut run: Option<ActiveRun> = None;

    loop {
        tokio::select! {
            incoming = socket.recv() => {
                let command: Command = match incoming {
                    Some(Ok(Message::Text(text))) => serde_json::from_str(text.as_str()).unwrap_or_default(),
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                };
                let reply = match command.kind.trim().to_ascii_lowercase().as_str() {
                    "start" => {
                        let mut prompt = command.prompt.trim().to_string();
                        let mut ratio = command.aspect_ratio.trim().to_string();
                        if let Some(session) = task_id.as_deref().and_then(|id| state.imagine.get(id)) {
                            if prompt.is_empty() {
                                prompt = session.prompt;
                            }
                            if ratio.is_empty() {
                                ratio = session.aspect_ratio;
                            }
                        }
                        if prompt.is_empty() {
                            Some(command_error("prompt cannot be empty", "empty_prompt"))
                        } else {
                            stop_run(&mut run).await;
                            let token = state.shutdown.child_token();
                            let handle = tokio::spawn(run_loop(
                                state.clone(),
                                prompt,
                                resolve_aspect_ratio(&ratio).to_string(),
                                task_id.clone(),
                                token.clone(),
                                tx.clone(),
                            ));
                            run = Some(ActiveRun { token, handle });
                            None
                        }
                    }
                    "stop" => {
                        stop_run(&mut run).await;
                        None
                    }
                    "ping" => Some(json!({ "type": "pong" })),
                    _ => Some(command_error("unknown command", "unknown_command")),
                };
                if let Some(reply) = reply {
                    if socket.send(Message::Text(reply.to_string().into())).await.is_err() {
                        break;
                    }
                }
            }
            Some(event) = rx.recv() => {
                if socket.send(Message::Text(event.to_string().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(active) = run.take() {
        // 循环可能正阻塞在发送上，先取消再排空
        active.token.cancel();
        drop(rx);
        let _ = active.handle.await;
    }
    if let Some(id) = task_id {
        state.imagine.delete(&id);
    }
}
