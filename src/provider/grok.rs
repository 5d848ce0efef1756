//! # Grok 上游
//!
//! 以 sso cookie 认证；对话与图片生成共用同一个会话接口，响应为 JSON 行。
//! 图片编辑需要先以当前账号上传参考图。

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{Value, json};

use crate::config::GrokConfig;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::store::{Account, RateLimitInfo};
use crate::{ldebug, linfo, lwarn};

use super::images::{asset_to_url, extract_image_urls, extract_image_urls_from_text, normalize_image_urls};
use super::{
    EventSink, ImageEditRequest, ImageOutput, ImageRequest, Provider, RefreshOutcome,
    UpstreamClient, UpstreamRequest, build_http_client, error_for_status, json_line_frames,
    ratelimit,
};

pub const PROVIDER_NAME: &str = "grok";

pub const MAX_IMAGES_PER_REQUEST: usize = 10;
pub const MAX_EDIT_REFERENCES: usize = 16;

/// 对外模型到上游字段的映射
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrokModel {
    pub id: &'static str,
    pub name: &'static str,
    pub upstream_model: &'static str,
    pub model_mode: &'static str,
    pub is_image: bool,
}

const fn chat(id: &'static str, name: &'static str, upstream_model: &'static str, model_mode: &'static str) -> GrokModel {
    GrokModel {
        id,
        name,
        upstream_model,
        model_mode,
        is_image: false,
    }
}

pub const SUPPORTED_MODELS: [GrokModel; 16] = [
    chat("grok-3", "Grok 3", "grok-3", "MODEL_MODE_GROK_3"),
    chat("grok-3-mini", "Grok 3 Mini", "grok-3", "MODEL_MODE_GROK_3_MINI_THINKING"),
    chat("grok-3-thinking", "Grok 3 Thinking", "grok-3", "MODEL_MODE_GROK_3_THINKING"),
    chat("grok-3-fast", "Grok 3 Fast", "grok-3", "MODEL_MODE_FAST"),
    chat("grok-4", "Grok 4", "grok-4", "MODEL_MODE_GROK_4"),
    chat("grok-4-mini", "Grok 4 Mini", "grok-4-mini", "MODEL_MODE_GROK_4_MINI_THINKING"),
    chat("grok-4-thinking", "Grok 4 Thinking", "grok-4", "MODEL_MODE_GROK_4_THINKING"),
    chat("grok-4-fast", "Grok 4 Fast", "grok-4", "MODEL_MODE_FAST"),
    chat("grok-4-heavy", "Grok 4 Heavy", "grok-4", "MODEL_MODE_HEAVY"),
    chat("grok-4.1-mini", "Grok 4.1 Mini", "grok-4-1-thinking-1129", "MODEL_MODE_GROK_4_1_MINI_THINKING"),
    chat("grok-4.1-fast", "Grok 4.1 Fast", "grok-4-1-thinking-1129", "MODEL_MODE_FAST"),
    chat("grok-4.1-expert", "Grok 4.1 Expert", "grok-4-1-thinking-1129", "MODEL_MODE_EXPERT"),
    chat("grok-4.1-thinking", "Grok 4.1 Thinking", "grok-4-1-thinking-1129", "MODEL_MODE_GROK_4_1_THINKING"),
    chat("grok-4.1", "Grok 4.1", "grok-4-1-thinking-1129", "MODEL_MODE_GROK_4_1_MINI_THINKING"),
    GrokModel {
        id: "grok-imagine-1.0",
        name: "Grok Imagine 1.0",
        upstream_model: "grok-3",
        model_mode: "MODEL_MODE_FAST",
        is_image: true,
    },
    GrokModel {
        id: "grok-imagine-1.0-edit",
        name: "Grok Imagine 1.0 Edit",
        upstream_model: "imagine-image-edit",
        model_mode: "MODEL_MODE_FAST",
        is_image: true,
    },
];

pub const DEFAULT_IMAGE_MODEL: &str = "grok-imagine-1.0";

/// 按模型 ID 查找；兼容常见拼写 `gork-*`
#[must_use]
pub fn resolve_model(model: &str) -> Option<GrokModel> {
    let mut id = model.trim().to_lowercase();
    if let Some(rest) = id.strip_prefix("gork-") {
        id = format!("grok-{rest}");
    }
    SUPPORTED_MODELS.iter().copied().find(|m| m.id == id)
}

/// 组装 Cookie 头；已经是完整 cookie 串时原样使用
#[must_use]
pub fn sso_cookie(token: &str) -> String {
    let token = token.trim();
    if token.contains("sso=") {
        return token.to_string();
    }
    format!("sso={token}; sso-rw={token}")
}

fn base_payload(model: GrokModel, message: &str) -> Value {
    json!({
        "temporary": true,
        "modelName": model.upstream_model,
        "modelMode": model.model_mode,
        "message": message.trim(),
        "fileAttachments": [],
        "imageAttachments": [],
        "disableSearch": false,
        "enableImageGeneration": false,
        "returnImageBytes": false,
        "returnRawGrokInXaiRequest": false,
        "enableImageStreaming": false,
        "imageGenerationCount": 0,
        "forceConcise": false,
        "toolOverrides": {"imageGen": false},
        "enableSideBySide": true,
        "sendFinalMetadata": true,
        "isReasoning": false,
        "disableTextFollowUps": true,
        "disableMemory": false,
        "forceSideBySide": false,
    })
}

/// 纯文本对话请求体
#[must_use]
pub fn chat_payload(model: GrokModel, message: &str) -> Value {
    base_payload(model, message)
}

/// 图片生成请求体
#[must_use]
pub fn image_payload(model: GrokModel, prompt: &str, n: usize) -> Value {
    let mut payload = base_payload(model, prompt);
    payload["enableImageGeneration"] = json!(true);
    payload["enableImageStreaming"] = json!(true);
    payload["imageGenerationCount"] = json!(n.max(2));
    payload["toolOverrides"] = json!({"imageGen": true});
    payload
}

/// 支持的画幅比例
pub const ASPECT_RATIOS: [&str; 5] = ["1:1", "2:3", "3:2", "16:9", "9:16"];
pub const DEFAULT_ASPECT_RATIO: &str = "2:3";

/// 规范化画幅比例：接受 `W:H` 或 `WxH` 尺寸，取最接近的支持比例，无法识别时为 `2:3`
#[must_use]
pub fn resolve_aspect_ratio(raw: &str) -> &'static str {
    let raw = raw.trim().to_lowercase();
    if let Some(known) = ASPECT_RATIOS.iter().find(|r| **r == raw) {
        return known;
    }
    let Some((w, h)) = raw.split_once(['x', ':', '*']) else {
        return DEFAULT_ASPECT_RATIO;
    };
    let (Ok(w), Ok(h)) = (w.trim().parse::<f64>(), h.trim().parse::<f64>()) else {
        return DEFAULT_ASPECT_RATIO;
    };
    if w <= 0.0 || h <= 0.0 {
        return DEFAULT_ASPECT_RATIO;
    }
    let target = w / h;
    ASPECT_RATIOS
        .iter()
        .copied()
        .min_by(|a, b| ratio_distance(a, target).total_cmp(&ratio_distance(b, target)))
        .unwrap_or(DEFAULT_ASPECT_RATIO)
}

fn ratio_distance(ratio: &str, target: f64) -> f64 {
    let (w, h) = ratio.split_once(':').unwrap_or(("2", "3"));
    let value = w.parse::<f64>().unwrap_or(2.0) / h.parse::<f64>().unwrap_or(3.0);
    (value.ln() - target.ln()).abs()
}

/// 在请求体中写入画幅比例
pub fn with_aspect_ratio(payload: &mut Value, ratio: &str) {
    payload["responseMetadata"]["modelConfigOverride"]["modelMap"]["imageGenModelConfig"] =
        json!({"aspectRatio": resolve_aspect_ratio(ratio)});
}

/// 图片编辑请求体；`references` 为已上传的参考图链接
#[must_use]
pub fn image_edit_payload(model: GrokModel, prompt: &str, references: &[String]) -> Value {
    let mut payload = image_payload(model, prompt, 2);
    payload["responseMetadata"] = json!({
        "modelConfigOverride": {
            "modelMap": {
                "imageEditModel": "imagine",
                "imageEditModelConfig": {"imageReferences": references},
            }
        }
    });
    payload
}

fn check_image_count(n: usize) -> Result<usize> {
    let n = if n == 0 { 1 } else { n };
    if n > MAX_IMAGES_PER_REQUEST {
        return Err(ProxyError::validation(format!(
            "n must be between 1 and {MAX_IMAGES_PER_REQUEST}"
        )));
    }
    Ok(n)
}

/// 一行 JSON 的解析结果
#[derive(Debug, Default, PartialEq)]
struct LineParts {
    token: String,
    thinking: bool,
    final_message: Option<String>,
    image_urls: Vec<String>,
    error: Option<String>,
}

fn parse_line(line: &Value) -> LineParts {
    let mut parts = LineParts::default();
    if let Some(err) = line.get("error") {
        let message = err
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| err.to_string(), str::to_string);
        parts.error = Some(message);
        return parts;
    }
    let Some(response) = line.get("result").and_then(|r| r.get("response")) else {
        return parts;
    };
    if let Some(token) = response.get("token").and_then(Value::as_str) {
        parts.token = token.to_string();
    }
    parts.thinking = response.get("isThinking").and_then(Value::as_bool).unwrap_or(false);
    parts.image_urls.extend(extract_image_urls(response));
    if let Some(progress) = response.get("streamingImageGenerationResponse") {
        if let Some(url) = progress.get("imageUrl").and_then(Value::as_str) {
            parts.image_urls.push(asset_to_url(url));
        }
    }
    if let Some(model_response) = response.get("modelResponse") {
        parts.image_urls.extend(extract_image_urls(model_response));
        if let Some(message) = model_response.get("message").and_then(Value::as_str) {
            parts.final_message = Some(message.to_string());
        }
    }
    parts
}

/// Grok 上游客户端
pub struct GrokClient {
    config: Arc<GrokConfig>,
    http: reqwest::Client,
    account: Account,
    rate_limit: Mutex<Option<RateLimitInfo>>,
}

impl std::fmt::Debug for GrokClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrokClient")
            .field("account_id", &self.account.id)
            .finish_non_exhaustive()
    }
}

impl GrokClient {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn post(&self, path: &str) -> Result<reqwest::RequestBuilder> {
        let token = self.account.credential();
        if token.trim().is_empty() {
            return Err(ProxyError::auth("grok account has no sso token"));
        }
        Ok(self
            .http
            .post(self.url(path))
            .header("cookie", sso_cookie(token))
            .header("origin", self.config.base_url.trim_end_matches('/'))
            .header("referer", format!("{}/", self.config.base_url.trim_end_matches('/'))))
    }

    fn remember_rate_limit(&self, headers: &reqwest::header::HeaderMap) {
        let info = ratelimit::from_headers(headers, Utc::now());
        if !info.is_empty() {
            *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner) = Some(info);
        }
    }

    async fn open_chat(&self, payload: &Value) -> Result<reqwest::Response> {
        let response = self.post(&self.config.chat_path)?.json(payload).send().await?;
        self.remember_rate_limit(response.headers());
        error_for_status(PROVIDER_NAME, response).await
    }

    /// 读完整个会话响应，收集图片链接与最终文本
    async fn collect_images(&self, request_id: &str, payload: &Value, n: usize) -> Result<ImageOutput> {
        let timeout = Duration::from_secs(self.config.image_timeout_secs.max(1));
        let run = async {
            let response = self.open_chat(payload).await?;
            let mut lines = json_line_frames(response);
            let mut urls = Vec::new();
            let mut text = String::new();
            while let Some(line) = lines.next().await {
                let line = line.map_err(|e| ProxyError::network_with_source("grok stream read failed", e))?;
                let parts = parse_line(&line);
                if let Some(message) = parts.error {
                    return Err(ProxyError::upstream(PROVIDER_NAME, 502, message));
                }
                urls.extend(parts.image_urls);
                if let Some(message) = parts.final_message {
                    text = message;
                }
            }
            urls.extend(extract_image_urls_from_text(&text));
            Ok(normalize_image_urls(&urls, n, true))
        };
        let urls = tokio::time::timeout(timeout, run).await.map_err(|_| {
            ProxyError::upstream_timeout(
                PROVIDER_NAME,
                u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            )
        })??;
        if urls.is_empty() {
            return Err(ProxyError::upstream(PROVIDER_NAME, 502, "no image generated"));
        }
        ldebug!(
            request_id,
            LogStage::Response,
            LogComponent::Grok,
            "collect_images",
            "Grok 图片生成完成",
            account_id = self.account.id,
            count = urls.len()
        );
        Ok(ImageOutput { urls })
    }

    /// 上传一张参考图，返回可引用的链接
    async fn upload_image(&self, mime: &str, data: &[u8]) -> Result<String> {
        let ext = mime.rsplit('/').next().unwrap_or("png");
        let body = json!({
            "fileName": format!("image.{ext}"),
            "fileMimeType": mime,
            "content": STANDARD.encode(data),
        });
        let response = self.post(&self.config.upload_path)?.json(&body).send().await?;
        let response = error_for_status(PROVIDER_NAME, response).await?;
        let value: Value = response.json().await?;
        let uri = value
            .get("fileUri")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();
        if uri.is_empty() {
            return Err(ProxyError::upstream(PROVIDER_NAME, 502, "image upload failed: empty file uri"));
        }
        let lower = uri.to_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            Ok(uri)
        } else {
            Ok(format!("https://assets.grok.com/{}", uri.trim_start_matches('/')))
        }
    }
}

#[async_trait]
impl UpstreamClient for GrokClient {
    fn provider(&self) -> &str {
        PROVIDER_NAME
    }

    async fn send_request(&self, request: &UpstreamRequest, sink: &EventSink) -> Result<()> {
        let model = resolve_model(&request.model)
            .filter(|m| !m.is_image)
            .or_else(|| resolve_model("grok-4"))
            .ok_or_else(|| ProxyError::validation(format!("unknown grok model: {}", request.model)))?;
        let message = if request.system.trim().is_empty() {
            request.transcript()
        } else {
            format!("{}\n\n{}", request.system.trim(), request.transcript())
        };
        if message.trim().is_empty() {
            return Err(ProxyError::validation("empty prompt"));
        }

        ldebug!(
            &request.request_id,
            LogStage::UpstreamRequest,
            LogComponent::Grok,
            "send_request",
            "发送 Grok 请求",
            account_id = self.account.id,
            model = model.upstream_model
        );

        let response = self.open_chat(&chat_payload(model, &message)).await?;
        let mut lines = json_line_frames(response);
        let mut streamed_text = false;
        let mut final_message = None;
        let mut images = Vec::new();
        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| ProxyError::network_with_source("grok stream read failed", e))?;
            let parts = parse_line(&line);
            if let Some(message) = parts.error {
                return Err(ProxyError::upstream(PROVIDER_NAME, 502, message));
            }
            if !parts.token.is_empty() {
                if parts.thinking {
                    sink.reasoning(parts.token).await?;
                } else {
                    streamed_text = true;
                    sink.text(parts.token).await?;
                }
            }
            images.extend(parts.image_urls);
            if parts.final_message.is_some() {
                final_message = parts.final_message;
            }
        }
        if !streamed_text {
            if let Some(message) = final_message {
                sink.text(message).await?;
            }
        }
        for url in normalize_image_urls(&images, 0, true) {
            sink.text(format!("\n![image]({url})")).await?;
        }
        sink.finish_if_missing().await
    }

    /// 查询限额；sso 没有可刷新的 bearer，成功即视为凭据有效
    async fn refresh_account(&self) -> Result<RefreshOutcome> {
        let body = json!({"requestKind": "DEFAULT", "modelName": "grok-4"});
        let response = self.post(&self.config.rate_limits_path)?.json(&body).send().await?;
        let response = error_for_status(PROVIDER_NAME, response).await?;
        let value: Value = response.json().await?;
        let info = ratelimit::from_grok_body(&value, Utc::now());
        *self.rate_limit.lock().unwrap_or_else(PoisonError::into_inner) = Some(info.clone());
        Ok(RefreshOutcome {
            bearer: String::new(),
            refresh_token: None,
            expires_at: None,
            rate_limit: Some(info),
        })
    }

    fn rate_limit(&self) -> Option<RateLimitInfo> {
        self.rate_limit
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn generate_images(&self, request: &ImageRequest) -> Result<ImageOutput> {
        let n = check_image_count(request.n)?;
        if request.prompt.trim().is_empty() {
            return Err(ProxyError::validation("prompt is required"));
        }
        let model = resolve_model(if request.model.trim().is_empty() {
            DEFAULT_IMAGE_MODEL
        } else {
            request.model.as_str()
        })
        .filter(|m| m.is_image)
        .ok_or_else(|| ProxyError::validation(format!("model {} does not support images", request.model)))?;
        let mut payload = image_payload(model, &request.prompt, n);
        if !request.aspect_ratio.trim().is_empty() {
            with_aspect_ratio(&mut payload, &request.aspect_ratio);
        }
        self.collect_images("images", &payload, n).await
    }

    async fn edit_images(&self, request: &ImageEditRequest) -> Result<ImageOutput> {
        let n = check_image_count(request.n)?;
        if request.images.is_empty() {
            return Err(ProxyError::validation("image is required for image edits"));
        }
        if request.images.len() > MAX_EDIT_REFERENCES {
            return Err(ProxyError::validation(format!(
                "too many images. maximum is {MAX_EDIT_REFERENCES}"
            )));
        }
        let model = resolve_model("grok-imagine-1.0-edit")
            .ok_or_else(|| ProxyError::internal("image edit model missing"))?;
        let mut references = Vec::with_capacity(request.images.len());
        for (mime, data) in &request.images {
            references.push(self.upload_image(mime, data).await?);
        }
        self.collect_images(
            "image_edits",
            &image_edit_payload(model, &request.prompt, &references),
            n,
        )
        .await
    }

    async fn enable_nsfw(&self) -> Result<()> {
        let body = json!({"preferences": {"enableNsfw": true, "safeSearch": false}});
        let response = self.post(&self.config.nsfw_path)?.json(&body).send().await?;
        if let Err(e) = error_for_status(PROVIDER_NAME, response).await {
            lwarn!(
                "system",
                LogStage::UpstreamRequest,
                LogComponent::Grok,
                "enable_nsfw",
                "开启 NSFW 失败",
                account_id = self.account.id,
                error = %e
            );
            return Err(e);
        }
        linfo!(
            "system",
            LogStage::UpstreamRequest,
            LogComponent::Grok,
            "enable_nsfw",
            "已开启 NSFW",
            account_id = self.account.id
        );
        Ok(())
    }

    async fn download_asset(&self, url: &str) -> Result<(Vec<u8>, String)> {
        let url = asset_to_url(url);
        let token = self.account.credential();
        let mut builder = self.http.get(&url);
        if !token.trim().is_empty() {
            builder = builder.header("cookie", sso_cookie(token));
        }
        let response = error_for_status(PROVIDER_NAME, builder.send().await?).await?;
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), mime))
    }
}

/// Grok 工厂
pub struct GrokProvider {
    config: Arc<GrokConfig>,
    http: reqwest::Client,
}

impl GrokProvider {
    pub fn new(config: GrokConfig) -> Result<Self> {
        let http = build_http_client(
            Duration::from_secs(config.request_timeout_secs.max(config.image_timeout_secs).max(1)),
            &config.user_agent,
        )?;
        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }
}

impl Provider for GrokProvider {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn new_client(&self, account: &Account) -> Arc<dyn UpstreamClient> {
        Arc::new(GrokClient {
            config: Arc::clone(&self.config),
            http: self.http.clone(),
            account: account.clone(),
            rate_limit: Mutex::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{FinishReason, UpstreamEvent};
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn account() -> Account {
        Account {
            id: 9,
            account_type: "grok".into(),
            client_cookie: "sso-token".into(),
            ..Account::default()
        }
    }

    fn provider(server: &MockServer) -> GrokProvider {
        GrokProvider::new(GrokConfig {
            base_url: server.uri(),
            ..GrokConfig::default()
        })
        .unwrap()
    }

    fn line(response: &Value) -> String {
        format!("{}\n", json!({"result": {"response": response}}))
    }

    #[test]
    fn test_resolve_model_accepts_typo() {
        assert_eq!(resolve_model("GORK-4").unwrap().id, "grok-4");
        assert!(resolve_model("grok-imagine-1.0").unwrap().is_image);
        assert!(resolve_model("grok-99").is_none());
    }

    #[test]
    fn test_cookie_format() {
        assert_eq!(sso_cookie("abc"), "sso=abc; sso-rw=abc");
        assert_eq!(sso_cookie("sso=abc; other=1"), "sso=abc; other=1");
    }

    #[test]
    fn test_image_count_bounds() {
        assert_eq!(check_image_count(0).unwrap(), 1);
        assert_eq!(check_image_count(10).unwrap(), 10);
        assert!(check_image_count(11).is_err());
    }

    #[test]
    fn test_edit_payload_carries_references() {
        let model = resolve_model("grok-imagine-1.0-edit").unwrap();
        let payload = image_edit_payload(model, "make it blue", &["https://assets.grok.com/a.png".into()]);
        assert_eq!(payload["modelName"], "imagine-image-edit");
        assert_eq!(
            payload["responseMetadata"]["modelConfigOverride"]["modelMap"]["imageEditModelConfig"]["imageReferences"][0],
            "https://assets.grok.com/a.png"
        );
        assert_eq!(payload["toolOverrides"]["imageGen"], true);
    }

    #[tokio::test]
    async fn test_chat_stream_splits_thinking_and_text() {
        let server = MockServer::start().await;
        let body = [
            line(&json!({"token": "plan", "isThinking": true})),
            line(&json!({"token": "Hi", "isThinking": false})),
            line(&json!({"token": " there"})),
            line(&json!({"modelResponse": {"message": "Hi there"}})),
        ]
        .concat();
        Mock::given(method("POST"))
            .and(path("/rest/app-chat/conversations/new"))
            .and(header("cookie", "sso=sso-token; sso-rw=sso-token"))
            .and(body_partial_json(json!({"modelName": "grok-4", "message": "hello"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let client = provider(&server).new_client(&account());
        let (sink, mut rx) = EventSink::channel(16);
        let request = UpstreamRequest {
            model: "grok-4".into(),
            prompt: "hello".into(),
            ..UpstreamRequest::default()
        };
        client.send_request(&request, &sink).await.unwrap();
        drop(sink);
        let mut events = Vec::new();
        while let Some(ev) = rx.recv().await {
            events.push(ev);
        }
        assert_eq!(
            events,
            vec![
                UpstreamEvent::ReasoningDelta("plan".into()),
                UpstreamEvent::TextDelta("Hi".into()),
                UpstreamEvent::TextDelta(" there".into()),
                UpstreamEvent::Finish {
                    reason: FinishReason::EndTurn,
                    usage: None
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_images_normalizes_urls() {
        let server = MockServer::start().await;
        let body = [
            line(&json!({"streamingImageGenerationResponse": {"imageUrl": "users/u/generated/a-part-0/image.jpg", "progress": 50}})),
            line(&json!({"modelResponse": {"generatedImageUrls": [
                "users/u/generated/a/image.jpg",
                "users/u/generated/b/image.jpg"
            ]}})),
        ]
        .concat();
        Mock::given(path("/rest/app-chat/conversations/new"))
            .and(body_partial_json(json!({"enableImageGeneration": true})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let out = provider(&server)
            .new_client(&account())
            .generate_images(&ImageRequest {
                model: String::new(),
                prompt: "a cat".into(),
                n: 2,
                ..ImageRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(
            out.urls,
            vec![
                "https://assets.grok.com/users/u/generated/a/image.jpg".to_string(),
                "https://assets.grok.com/users/u/generated/b/image.jpg".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_edit_uploads_references_first() {
        let server = MockServer::start().await;
        Mock::given(path("/rest/app-chat/upload-file"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"fileUri": "users/u/up/1.png"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(path("/rest/app-chat/conversations/new"))
            .and(body_partial_json(json!({"modelName": "imagine-image-edit"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(line(
                &json!({"modelResponse": {"generatedImageUrls": ["users/u/generated/e/image.png"]}}),
            )))
            .mount(&server)
            .await;

        let out = provider(&server)
            .new_client(&account())
            .edit_images(&ImageEditRequest {
                model: "grok-imagine-1.0-edit".into(),
                prompt: "blue".into(),
                n: 1,
                images: vec![("image/png".into(), vec![1, 2, 3])],
            })
            .await
            .unwrap();
        assert_eq!(out.urls.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_reads_rate_limits() {
        let server = MockServer::start().await;
        Mock::given(path("/rest/rate-limits"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "remainingQueries": 7, "totalQueries": 20, "windowSizeSeconds": 3600
            })))
            .mount(&server)
            .await;
        let client = provider(&server).new_client(&account());
        let outcome = client.refresh_account().await.unwrap();
        let info = outcome.rate_limit.unwrap();
        assert_eq!(info.remaining, Some(7.0));
        assert_eq!(info.limit, Some(20.0));
        assert_eq!(client.rate_limit().unwrap().remaining, Some(7.0));
    }

    #[tokio::test]
    async fn test_upstream_error_line() {
        let server = MockServer::start().await;
        Mock::given(path("/rest/app-chat/conversations/new"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{}\n",
                json!({"error": {"code": 8, "message": "Too many requests"}})
            )))
            .mount(&server)
            .await;
        let (sink, _rx) = EventSink::channel(4);
        let request = UpstreamRequest {
            prompt: "x".into(),
            ..UpstreamRequest::default()
        };
        let err = provider(&server)
            .new_client(&account())
            .send_request(&request, &sink)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Too many requests"));
    }

    #[test]
    fn test_resolve_aspect_ratio() {
        assert_eq!(resolve_aspect_ratio("1024x1024"), "1:1");
        assert_eq!(resolve_aspect_ratio("16:9"), "16:9");
        assert_eq!(resolve_aspect_ratio("1792x1024"), "16:9");
        assert_eq!(resolve_aspect_ratio("unknown"), "2:3");
        let mut payload = json!({});
        with_aspect_ratio(&mut payload, "3:2");
        assert_eq!(
            payload["responseMetadata"]["modelConfigOverride"]["modelMap"]["imageGenModelConfig"]["aspectRatio"],
            "3:2"
        );
    }
}
