//! 模型列表（OpenAI `list` 结构）

use axum::{
    Json,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::HandlerState;
use crate::error::{ProxyError, Result};
use crate::store::Model;

fn model_list(models: &[Model]) -> Value {
    let data: Vec<Value> = models
        .iter()
        .filter(|m| m.status.is_enabled())
        .map(|m| {
            json!({
                "id": m.model_id,
                "object": "model",
                "created": m.created_at.timestamp(),
                "owned_by": m.channel,
                "name": m.name,
                "is_default": m.is_default,
            })
        })
        .collect();
    json!({ "object": "list", "data": data })
}

/// `GET /v1/models`
pub async fn list_models(State(state): State<HandlerState>) -> Result<Json<Value>> {
    let models = state.store.list_models().await?;
    Ok(Json(model_list(&models)))
}

/// `GET /{provider}/v1/models`
pub async fn list_provider_models(
    State(state): State<HandlerState>,
    Path(provider): Path<String>,
) -> Result<Json<Value>> {
    let channel = provider.trim().to_lowercase();
    if !state.providers.contains(&channel) {
        return Err(ProxyError::not_found(format!("unknown provider: {provider}")));
    }
    let models = state.store.list_channel_models(&channel).await?;
    Ok(Json(model_list(&models)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ModelStatus;

    #[test]
    fn test_model_list_skips_disabled() {
        let mut disabled = Model::new("grok", "grok-3", "Grok 3", false, 1);
        disabled.status = ModelStatus::Disabled;
        let models = vec![Model::new("grok", "grok-4", "Grok 4", true, 0), disabled];
        let list = model_list(&models);
        assert_eq!(list["object"], "list");
        let data = list["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["id"], "grok-4");
        assert_eq!(data[0]["owned_by"], "grok");
    }
}
