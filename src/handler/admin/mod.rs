//! # 管理端接口
//!
//! 挂载在 `/api/v1/admin` 与 `/v1/admin` 下，统一经过管理员鉴权。

pub mod accounts;
pub mod cache;
pub mod jobs;
pub mod keys;
pub mod models;
pub mod response;
pub mod settings;
pub mod system;

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::config::merge_json;
use crate::error::{ProxyError, Result};

/// 对记录应用 JSON 合并补丁
pub(crate) fn apply_patch<T>(current: &T, patch: &Value) -> Result<T>
where
    T: Serialize + DeserializeOwned,
{
    if !patch.is_object() {
        return Err(ProxyError::validation("patch body must be a JSON object"));
    }
    let mut value = serde_json::to_value(current)?;
    merge_json(&mut value, patch);
    serde_json::from_value(value).map_err(|e| ProxyError::validation(format!("invalid field: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Account;
    use serde_json::json;

    #[test]
    fn test_apply_patch_merges_fields() {
        let account = Account {
            id: 3,
            name: "old".to_string(),
            weight: 2,
            ..Account::default()
        };
        let patched: Account = apply_patch(&account, &json!({"name": "new", "enabled": false})).unwrap();
        assert_eq!(patched.name, "new");
        assert!(!patched.enabled);
        assert_eq!(patched.weight, 2);

        assert!(apply_patch(&account, &json!([1, 2])).is_err());
        assert!(apply_patch(&account, &json!({"weight": "heavy"})).is_err());
    }
}
