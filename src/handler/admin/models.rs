//! 模型管理

use axum::{
    Json,
    extract::{Path, State},
    response::Response,
};
use serde_json::Value;

use super::{apply_patch, response};
use crate::error::{ProxyError, Result};
use crate::handler::HandlerState;
use crate::store::Model;

fn validate(state: &HandlerState, model: &Model) -> Result<()> {
    if model.model_id.trim().is_empty() {
        return Err(ProxyError::validation("model_id is required"));
    }
    if !state.providers.contains(&model.channel) {
        return Err(ProxyError::validation(format!("unknown channel: {}", model.channel)));
    }
    Ok(())
}

/// `GET /admin/models`
pub async fn list(State(state): State<HandlerState>) -> Response {
    response::respond(state.store.list_models().await)
}

/// `POST /admin/models`
pub async fn create(State(state): State<HandlerState>, Json(mut model): Json<Model>) -> Response {
    let result = async {
        model.channel = model.channel.trim().to_lowercase();
        validate(&state, &model)?;
        state.store.create_model(&mut model).await?;
        Ok(model)
    }
    .await;
    response::respond(result)
}

/// `PUT /admin/models/{id}`
pub async fn update(
    State(state): State<HandlerState>,
    Path(id): Path<String>,
    Json(patch): Json<Value>,
) -> Response {
    let result = async {
        let existing = state.store.get_model(&id).await?;
        let mut updated: Model = apply_patch(&existing, &patch)?;
        updated.id = existing.id.clone();
        updated.created_at = existing.created_at;
        updated.channel = updated.channel.trim().to_lowercase();
        validate(&state, &updated)?;
        state.store.update_model(&updated).await?;
        state.store.get_model(&id).await
    }
    .await;
    response::respond(result)
}

/// `POST /admin/models/{id}/default`
pub async fn set_default(State(state): State<HandlerState>, Path(id): Path<String>) -> Response {
    let result = async {
        state.store.set_default_model(&id).await?;
        state.store.get_model(&id).await
    }
    .await;
    response::respond(result)
}

/// `DELETE /admin/models/{id}`
pub async fn delete(State(state): State<HandlerState>, Path(id): Path<String>) -> Response {
    match state.store.delete_model(&id).await {
        Ok(()) => response::success_without_data("模型已删除"),
        Err(e) => response::app_error(e),
    }
}
