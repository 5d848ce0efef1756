//! 运行时配置读取与补丁
//!
//! 输出时密钥类字段被脱敏；补丁里原样回传的脱敏值会被忽略，避免把掩码写回配置。

use std::time::Duration;

use axum::{Json, extract::State, response::Response};
use serde_json::Value;

use super::response;
use crate::config::{AppConfig, CONFIG_SETTING_KEY};
use crate::error::Result;
use crate::handler::HandlerState;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::utils::secure::mask_secret;

const SECRET_FIELDS: &[(&str, &str)] = &[
    ("auth", "admin_pass"),
    ("auth", "admin_token"),
    ("auth", "public_key"),
    ("redis", "password"),
];

fn redacted(config: &AppConfig) -> Result<Value> {
    let mut value = serde_json::to_value(config)?;
    for (section, field) in SECRET_FIELDS {
        if let Some(slot) = value.get_mut(*section).and_then(|s| s.get_mut(*field)) {
            let masked = slot.as_str().map(mask_secret).unwrap_or_default();
            *slot = Value::String(masked);
        }
    }
    Ok(value)
}

/// 去掉补丁中与当前掩码相同的密钥字段
fn strip_masked(patch: &mut Value, current: &AppConfig) -> Result<()> {
    let current = serde_json::to_value(current)?;
    for (section, field) in SECRET_FIELDS {
        let masked = current
            .get(*section)
            .and_then(|s| s.get(*field))
            .and_then(Value::as_str)
            .map(mask_secret)
            .unwrap_or_default();
        if let Some(obj) = patch.get_mut(*section).and_then(Value::as_object_mut) {
            if !masked.is_empty() && obj.get(*field).and_then(Value::as_str) == Some(masked.as_str()) {
                obj.remove(*field);
            }
        }
    }
    Ok(())
}

/// `GET /admin/config`
pub async fn get_config(State(state): State<HandlerState>) -> Response {
    response::respond(redacted(&state.config.get_config().await))
}

/// `PATCH /admin/config`：合并补丁、校验、持久化
pub async fn patch_config(State(state): State<HandlerState>, Json(mut patch): Json<Value>) -> Response {
    let result = async {
        let before = state.config.get_config().await;
        strip_masked(&mut patch, &before)?;
        let updated = state.config.patch(&patch).await?;
        state
            .store
            .set_setting(CONFIG_SETTING_KEY, &serde_json::to_string(&updated)?)
            .await?;

        if updated.token_cache.ttl_secs != before.token_cache.ttl_secs {
            if let Some(cache) = &state.token_cache {
                cache.set_ttl(Duration::from_secs(updated.token_cache.ttl_secs));
            }
        }
        if updated.balancer != before.balancer {
            state.balancer.invalidate();
        }
        linfo!(
            "system",
            LogStage::Background,
            LogComponent::Config,
            "patch_config",
            "运行时配置已更新并持久化"
        );
        redacted(&updated)
    }
    .await;
    response::respond(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redacted_masks_secrets() {
        let mut config = AppConfig::default();
        config.auth.admin_pass = "super-secret-password-1234".to_string();
        let value = redacted(&config).unwrap();
        let shown = value["auth"]["admin_pass"].as_str().unwrap();
        assert_ne!(shown, "super-secret-password-1234");
        assert_eq!(value["auth"]["admin_user"], "admin");
    }

    #[test]
    fn test_strip_masked_keeps_new_values() {
        let mut config = AppConfig::default();
        config.auth.admin_pass = "super-secret-password-1234".to_string();
        let masked = mask_secret(&config.auth.admin_pass);

        let mut patch = json!({"auth": {"admin_pass": masked, "public_key": "pk-new"}});
        strip_masked(&mut patch, &config).unwrap();
        assert!(patch["auth"].get("admin_pass").is_none());
        assert_eq!(patch["auth"]["public_key"], "pk-new");
    }
}
