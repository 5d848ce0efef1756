//! 本地缓存管理：token 缓存与图片/视频文件缓存

use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::response;
use crate::error::{ProxyError, Result};
use crate::handler::HandlerState;
use crate::handler::files::MediaType;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};

/// 清理目标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheKind {
    Token,
    Image,
    Video,
}

#[derive(Debug, Deserialize)]
pub struct ClearBody {
    #[serde(rename = "type")]
    pub kind: CacheKind,
}

async fn token_stats(state: &HandlerState) -> Result<Value> {
    match &state.token_cache {
        Some(cache) => Ok(serde_json::to_value(cache.stats().await?)?),
        None => Ok(Value::Null),
    }
}

/// `GET /admin/cache`
pub async fn stats(State(state): State<HandlerState>) -> Response {
    let result = async {
        Ok(json!({
            "token": token_stats(&state).await?,
            "image": state.files.stats(MediaType::Image).await?,
            "video": state.files.stats(MediaType::Video).await?,
        }))
    }
    .await;
    response::respond(result)
}

/// `POST /admin/cache/clear`
pub async fn clear(State(state): State<HandlerState>, Json(body): Json<ClearBody>) -> Response {
    let result = async {
        let removed = match body.kind {
            CacheKind::Token => match &state.token_cache {
                Some(cache) => cache.clear().await?,
                None => 0,
            },
            CacheKind::Image => state.files.clear(MediaType::Image).await?.count,
            CacheKind::Video => state.files.clear(MediaType::Video).await?.count,
        };
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::TokenCache,
            "clear_cache",
            "本地缓存已清理",
            kind = ?body.kind,
            removed = removed
        );
        Ok(json!({ "removed": removed }))
    }
    .await;
    response::respond(result)
}

/// `DELETE /admin/cache/{media}/{name}`
pub async fn delete_item(
    State(state): State<HandlerState>,
    Path((media, name)): Path<(String, String)>,
) -> Response {
    let result = async {
        let media = MediaType::parse(&media)
            .ok_or_else(|| ProxyError::validation(format!("unknown media type: {media}")))?;
        if !state.files.delete(media, &name).await? {
            return Err(ProxyError::not_found("file not found"));
        }
        Ok(json!({ "deleted": name }))
    }
    .await;
    response::respond(result)
}
