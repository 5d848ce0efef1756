//! `POST /{provider}/v1/messages/count_tokens`

use axum::{
    Json,
    body::Bytes,
    extract::{Path, State},
};
use serde_json::{Value, json};

use super::HandlerState;
use super::request::{ApiFormat, ParsedChat, parse_chat};
use crate::error::{ProxyError, Result};
use crate::token_cache::{CacheStrategy, cache_key, estimate_request};

/// 参与计数的全部文本，也是缓存键的输入
fn counted_text(parsed: &ParsedChat) -> String {
    let mut text = String::with_capacity(parsed.system.len() + 256);
    text.push_str(&parsed.system);
    for message in &parsed.messages {
        text.push('\n');
        text.push_str(&message.role);
        text.push(':');
        text.push_str(&message.content);
    }
    for tool in &parsed.tools {
        text.push('\n');
        text.push_str(&tool.name);
        text.push(':');
        text.push_str(&tool.description);
        if let Some(schema) = &tool.input_schema {
            text.push_str(&schema.to_string());
        }
    }
    text
}

pub async fn count_tokens(
    State(state): State<HandlerState>,
    Path(provider): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    if !state.providers.contains(&provider.trim().to_lowercase()) {
        return Err(ProxyError::not_found(format!("unknown provider: {provider}")));
    }
    let raw: Value = serde_json::from_slice(&body)
        .map_err(|e| ProxyError::validation(format!("invalid json body: {e}")))?;
    let parsed = parse_chat(ApiFormat::Anthropic, &raw)?;

    let Some(cache) = state.token_cache.as_ref() else {
        let total = estimate_request(&parsed.system, &parsed.messages, &parsed.tools).total;
        return Ok(Json(json!({ "input_tokens": total })));
    };

    let strategy = CacheStrategy::parse(&state.config.get_config().await.token_cache.strategy);
    let key = cache_key(strategy, &parsed.model, &counted_text(&parsed));
    if let Some(total) = cache.get(&key).await {
        return Ok(Json(json!({ "input_tokens": total })));
    }
    let total = estimate_request(&parsed.system, &parsed.messages, &parsed.tools).total;
    cache.put(&key, total).await;
    Ok(Json(json!({ "input_tokens": total })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counted_text_covers_tools() {
        let raw = json!({
            "model": "claude-sonnet-4-5",
            "system": "be brief",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [{"name": "ls", "description": "list", "input_schema": {"type": "object"}}]
        });
        let parsed = parse_chat(ApiFormat::Anthropic, &raw).unwrap();
        let text = counted_text(&parsed);
        assert!(text.starts_with("be brief"));
        assert!(text.contains("user:hi"));
        assert!(text.contains("ls:list{\"type\":\"object\"}"));
    }
}
