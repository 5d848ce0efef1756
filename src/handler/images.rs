//! # 图片接口
//!
//! `POST /{provider}/v1/images/generations` 与 `POST /{provider}/v1/images/edits`。
//! 结果以 `url`（本地缓存后的文件地址）或 `b64_json` 返回。

use std::time::Instant;

use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::HeaderMap,
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use serde_json::{Value, json};

use super::dispatch::with_account_switch;
use super::files::{FileCache, MediaType};
use super::{HandlerState, client_ip, request_id, user_agent};
use crate::ephemeral::AuditEvent;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::provider::grok::MAX_IMAGES_PER_REQUEST;
use crate::provider::{ImageEditRequest, ImageOutput, ImageRequest, UpstreamClient};
use crate::{linfo, lwarn};

/// 单张参考图上限
pub const MAX_EDIT_IMAGE_BYTES: usize = 50 * 1024 * 1024;

const ALLOWED_EDIT_MIME: [&str; 3] = ["image/png", "image/jpeg", "image/webp"];

/// 返回格式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFormat {
    Url,
    B64Json,
}

impl ResponseFormat {
    /// 未知取值按 `url` 处理
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "b64_json" | "base64" => Self::B64Json,
            _ => Self::Url,
        }
    }

    #[must_use]
    pub const fn field(self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::B64Json => "b64_json",
        }
    }
}

/// 文件地址前缀：优先配置的 `public_base_url`，其次按请求头推断，都没有时用相对路径
#[must_use]
pub fn public_base_url(configured: &str, headers: &HeaderMap) -> String {
    let configured = configured.trim().trim_end_matches('/');
    if !configured.is_empty() {
        return configured.to_string();
    }
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .unwrap_or_default()
            .to_string()
    };
    let host = header("x-forwarded-host");
    let host = if host.is_empty() { header("host") } else { host };
    if host.is_empty() {
        return String::new();
    }
    let proto = header("x-forwarded-proto");
    let proto = if proto.is_empty() { "http".to_string() } else { proto };
    format!("{proto}://{host}")
}

fn check_count(n: Option<i64>) -> Result<usize> {
    let n = n.unwrap_or(1);
    match usize::try_from(n) {
        Ok(n) if (1..=MAX_IMAGES_PER_REQUEST).contains(&n) => Ok(n),
        _ => Err(ProxyError::validation(format!(
            "n must be between 1 and {MAX_IMAGES_PER_REQUEST}"
        ))),
    }
}

fn usage() -> Value {
    json!({
        "total_tokens": 0,
        "input_tokens": 0,
        "output_tokens": 0,
        "input_tokens_details": {"text_tokens": 0, "image_tokens": 0}
    })
}

/// 把一个上游链接转换为输出值；下载失败时 `url` 退回原链接，`b64_json` 退回空串
async fn output_value(
    client: &dyn UpstreamClient,
    files: &FileCache,
    url: &str,
    format: ResponseFormat,
    base: &str,
) -> Result<String> {
    let (bytes, mime) = client.download_asset(url).await?;
    match format {
        ResponseFormat::B64Json => Ok(STANDARD.encode(bytes)),
        ResponseFormat::Url => {
            let name = files.store(MediaType::Image, url, &bytes, &mime).await?;
            Ok(format!("{base}/v1/files/image/{name}"))
        }
    }
}

/// 以生成图片的同一账号下载并渲染结果
pub async fn render_images(
    request_id: &str,
    client: &dyn UpstreamClient,
    files: &FileCache,
    output: &ImageOutput,
    format: ResponseFormat,
    base: &str,
) -> Vec<Value> {
    let mut data = Vec::with_capacity(output.urls.len());
    for url in &output.urls {
        let value = match output_value(client, files, url, format, base).await {
            Ok(value) => value,
            Err(e) => {
                lwarn!(
                    request_id,
                    LogStage::Response,
                    LogComponent::Grok,
                    "render_image",
                    "图片转换失败",
                    url = %url,
                    error = %e
                );
                match format {
                    ResponseFormat::Url => url.clone(),
                    ResponseFormat::B64Json => String::new(),
                }
            }
        };
        let mut item = serde_json::Map::new();
        item.insert(format.field().to_string(), Value::String(value));
        data.push(Value::Object(item));
    }
    data
}

/// 生成请求体
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct GenerationBody {
    model: String,
    prompt: String,
    n: Option<i64>,
    response_format: String,
    size: String,
    aspect_ratio: String,
}

/// 一次图片请求的公共部分
struct ImageCall {
    state: HandlerState,
    request_id: String,
    channel: String,
    format: ResponseFormat,
    base: String,
    started: Instant,
    client_ip: String,
    user_agent: String,
}

impl ImageCall {
    async fn new(state: HandlerState, provider: &str, headers: &HeaderMap, format: &str) -> Result<Self> {
        let channel = provider.trim().to_lowercase();
        if !state.providers.contains(&channel) {
            return Err(ProxyError::not_found(format!("unknown provider: {provider}")));
        }
        let configured = state.config.get_config().await.server.public_base_url;
        Ok(Self {
            request_id: request_id(headers),
            channel,
            format: ResponseFormat::parse(format),
            base: public_base_url(&configured, headers),
            started: Instant::now(),
            client_ip: client_ip(headers),
            user_agent: user_agent(headers),
            state,
        })
    }

    async fn run<F, Fut>(self, action: &str, model: &str, op: F) -> Result<Json<Value>>
    where
        F: Fn(std::sync::Arc<dyn UpstreamClient>) -> Fut,
        Fut: std::future::Future<Output = Result<ImageOutput>>,
    {
        let state = &self.state;
        let format = self.format;
        let base = self.base.as_str();
        let rid = self.request_id.as_str();
        let files = state.files.as_ref();
        let op = &op;
        let outcome = with_account_switch(state, rid, &self.channel, || true, move |client, _account| async move {
            let output = op(std::sync::Arc::clone(&client)).await?;
            if output.urls.is_empty() {
                return Err(ProxyError::upstream(client.provider(), 502, "no image generated"));
            }
            Ok(render_images(rid, client.as_ref(), files, &output, format, base).await)
        })
        .await;

        let mut event = AuditEvent::new(action, if outcome.is_ok() { "success" } else { "error" });
        event.model = model.to_string();
        event.channel.clone_from(&self.channel);
        event.client_ip.clone_from(&self.client_ip);
        event.user_agent.clone_from(&self.user_agent);
        event.duration_ms = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        match &outcome {
            Ok(done) => event.account_id = done.account.id,
            Err(err) => {
                event.account_id = err.account.as_ref().map_or(0, |a| a.id);
                event.error = err.error.public_message();
            }
        }
        state.audit.log(event);

        let done = outcome?;
        linfo!(
            rid,
            LogStage::Response,
            LogComponent::Grok,
            action,
            "图片请求完成",
            images = done.value.len(),
            attempts = done.attempts
        );
        Ok(Json(json!({
            "created": chrono::Utc::now().timestamp(),
            "data": done.value,
            "usage": usage(),
        })))
    }
}

/// `POST /{provider}/v1/images/generations`
pub async fn generations(
    State(state): State<HandlerState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    Json(body): Json<GenerationBody>,
) -> Result<Json<Value>> {
    let prompt = body.prompt.trim().to_string();
    if prompt.is_empty() {
        return Err(ProxyError::validation("prompt is required"));
    }
    let n = check_count(body.n)?;
    let ratio = if body.aspect_ratio.trim().is_empty() {
        body.size
    } else {
        body.aspect_ratio
    };
    let request = ImageRequest {
        model: body.model.trim().to_string(),
        prompt,
        n,
        aspect_ratio: ratio.trim().to_string(),
    };
    let call = ImageCall::new(state, &provider, &headers, &body.response_format).await?;
    call.run("image_generation", &request.model.clone(), |client| {
        let request = request.clone();
        async move { client.generate_images(&request).await }
    })
    .await
}

/// `POST /{provider}/v1/images/edits`（multipart）
pub async fn edits(
    State(state): State<HandlerState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<Value>> {
    let mut request = ImageEditRequest::default();
    let mut n = None;
    let mut format = String::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ProxyError::validation(format!("invalid multipart body: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" | "image[]" => {
                let mime = field
                    .content_type()
                    .map(|m| m.trim().to_ascii_lowercase())
                    .unwrap_or_default();
                let mime = if mime == "image/jpg" { "image/jpeg".to_string() } else { mime };
                if !ALLOWED_EDIT_MIME.contains(&mime.as_str()) {
                    return Err(ProxyError::validation(format!(
                        "unsupported image type: {mime}; supported: png, jpeg, webp"
                    )));
                }
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ProxyError::validation(format!("invalid image upload: {e}")))?;
                if data.is_empty() {
                    return Err(ProxyError::validation("image file is empty"));
                }
                if data.len() > MAX_EDIT_IMAGE_BYTES {
                    return Err(ProxyError::validation("image file too large. maximum is 50MB"));
                }
                request.images.push((mime, data.to_vec()));
            }
            _ => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ProxyError::validation(format!("invalid form field {name}: {e}")))?;
                match name.as_str() {
                    "prompt" => request.prompt = text.trim().to_string(),
                    "model" => request.model = text.trim().to_string(),
                    "response_format" => format = text,
                    "n" => {
                        n = Some(text.trim().parse::<i64>().map_err(|_| {
                            ProxyError::validation("n must be an integer")
                        })?);
                    }
                    _ => {}
                }
            }
        }
    }
    if request.prompt.is_empty() {
        return Err(ProxyError::validation("prompt is required"));
    }
    if request.images.is_empty() {
        return Err(ProxyError::validation("image is required"));
    }
    request.n = check_count(n)?;

    let call = ImageCall::new(state, &provider, &headers, &format).await?;
    call.run("image_edit", &request.model.clone(), |client| {
        let request = request.clone();
        async move { client.edit_images(&request).await }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use rstest::rstest;

    #[rstest]
    #[case("", ResponseFormat::Url)]
    #[case("URL", ResponseFormat::Url)]
    #[case("b64_json", ResponseFormat::B64Json)]
    #[case("base64", ResponseFormat::B64Json)]
    #[case("png", ResponseFormat::Url)]
    fn test_response_format(#[case] raw: &str, #[case] expected: ResponseFormat) {
        assert_eq!(ResponseFormat::parse(raw), expected);
    }

    #[test]
    fn test_image_count_bounds() {
        assert_eq!(check_count(None).unwrap(), 1);
        assert_eq!(check_count(Some(10)).unwrap(), 10);
        assert!(check_count(Some(0)).is_err());
        assert!(check_count(Some(11)).is_err());
        assert!(check_count(Some(-1)).is_err());
    }

    #[test]
    fn test_public_base_url() {
        let mut headers = HeaderMap::new();
        assert_eq!(public_base_url("https://relay.example.com/", &headers), "https://relay.example.com");
        assert_eq!(public_base_url("", &headers), "");
        headers.insert("host", HeaderValue::from_static("127.0.0.1:8080"));
        assert_eq!(public_base_url("", &headers), "http://127.0.0.1:8080");
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("img.example.com"));
        assert_eq!(public_base_url("", &headers), "https://img.example.com");
    }
}
