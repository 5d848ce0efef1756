//! API Key 管理；明文只在创建时返回一次

use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::json;

use super::response;
use crate::error::{ProxyError, Result};
use crate::handler::HandlerState;
use crate::store::ApiKey;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CreateKeyBody {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct ToggleBody {
    pub enabled: bool,
}

/// `GET /admin/keys`
pub async fn list(State(state): State<HandlerState>) -> Response {
    let result: Result<Vec<ApiKey>> = async {
        let keys = state.store.list_api_keys().await?;
        Ok(keys.into_iter().map(ApiKey::redacted).collect())
    }
    .await;
    response::respond(result)
}

/// `POST /admin/keys`
pub async fn create(State(state): State<HandlerState>, Json(body): Json<CreateKeyBody>) -> Response {
    let name = body.name.trim();
    if name.is_empty() {
        return response::app_error(ProxyError::validation("name is required"));
    }
    match state.store.create_api_key(name).await {
        Ok((key, plaintext)) => response::success_with_message(
            json!({ "key": key.redacted(), "plaintext": plaintext }),
            "请妥善保存，明文不会再次显示",
        ),
        Err(e) => response::app_error(e),
    }
}

/// `PUT /admin/keys/{id}`
pub async fn toggle(
    State(state): State<HandlerState>,
    Path(id): Path<i64>,
    Json(body): Json<ToggleBody>,
) -> Response {
    let result = state
        .store
        .set_api_key_enabled(id, body.enabled)
        .await
        .map(ApiKey::redacted);
    response::respond(result)
}

/// `DELETE /admin/keys/{id}`
pub async fn delete(State(state): State<HandlerState>, Path(id): Path<i64>) -> Response {
    match state.store.delete_api_key(id).await {
        Ok(()) => response::success_without_data("API Key 已删除"),
        Err(e) => response::app_error(e),
    }
}
