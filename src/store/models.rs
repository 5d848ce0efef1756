//! 持久化实体定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 未指定类型的账号按 Orchids 处理
pub const DEFAULT_ACCOUNT_TYPE: &str = "orchids";

pub use crate::error::classify::{STATUS_QUOTA_EXCEEDED, STATUS_RATE_LIMITED};

/// 上游账号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Account {
    pub id: i64,
    pub name: String,
    /// 上游类型：orchids / warp / grok
    pub account_type: String,
    pub agent_mode: String,
    /// Orchids 的 Clerk `__client` JWT，或 Grok 的 sso cookie
    pub client_cookie: String,
    /// Warp 的 refresh token
    pub refresh_token: String,
    pub session_id: String,
    pub client_uat: String,
    pub project_id: String,
    pub user_id: String,
    pub email: String,
    pub weight: i64,
    pub enabled: bool,
    pub subscription: String,
    pub usage_limit: f64,
    pub usage_current: f64,
    pub quota_reset_at: Option<DateTime<Utc>>,
    /// 由独立计数器维护，读取时合并
    pub request_count: i64,
    pub last_attempt: Option<DateTime<Utc>>,
    /// 空 / "429" / "quota_exceeded" / HTTP 状态码
    pub status_code: String,
    pub nsfw_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Account {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: String::new(),
            account_type: String::new(),
            agent_mode: String::new(),
            client_cookie: String::new(),
            refresh_token: String::new(),
            session_id: String::new(),
            client_uat: String::new(),
            project_id: String::new(),
            user_id: String::new(),
            email: String::new(),
            weight: 1,
            enabled: true,
            subscription: String::new(),
            usage_limit: 0.0,
            usage_current: 0.0,
            quota_reset_at: None,
            request_count: 0,
            last_attempt: None,
            status_code: String::new(),
            nsfw_enabled: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Account {
    /// 规范化后的账号类型（小写，空值视为 orchids）
    #[must_use]
    pub fn channel(&self) -> String {
        let kind = self.account_type.trim();
        if kind.is_empty() {
            DEFAULT_ACCOUNT_TYPE.to_string()
        } else {
            kind.to_lowercase()
        }
    }

    /// 渠道匹配：账号类型或 agent_mode 任一与渠道相同（忽略大小写）
    #[must_use]
    pub fn matches_channel(&self, channel: &str) -> bool {
        let channel = channel.trim();
        if channel.is_empty() {
            return true;
        }
        self.channel().eq_ignore_ascii_case(channel)
            || self.agent_mode.trim().eq_ignore_ascii_case(channel)
    }

    /// 权重下限为 1
    #[must_use]
    pub fn effective_weight(&self) -> i64 {
        self.weight.max(1)
    }

    /// 会话缓存用的凭据指纹来源
    #[must_use]
    pub fn credential(&self) -> &str {
        if self.refresh_token.is_empty() {
            &self.client_cookie
        } else {
            &self.refresh_token
        }
    }

    /// 清除状态码以及相关时间戳
    pub fn clear_status(&mut self) {
        self.status_code.clear();
        self.last_attempt = None;
        self.quota_reset_at = None;
    }
}

/// 模型状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    #[default]
    Enabled,
    Disabled,
}

impl ModelStatus {
    #[must_use]
    pub const fn is_enabled(self) -> bool {
        matches!(self, Self::Enabled)
    }
}

/// 对外暴露的模型别名
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Model {
    pub id: String,
    pub channel: String,
    pub model_id: String,
    pub name: String,
    pub status: ModelStatus,
    pub is_default: bool,
    pub sort_order: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Model {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            channel: String::new(),
            model_id: String::new(),
            name: String::new(),
            status: ModelStatus::Enabled,
            is_default: false,
            sort_order: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Model {
    /// 便于种子数据和测试构造
    #[must_use]
    pub fn new(channel: &str, model_id: &str, name: &str, is_default: bool, sort_order: i64) -> Self {
        Self {
            channel: channel.to_string(),
            model_id: model_id.to_string(),
            name: name.to_string(),
            is_default,
            sort_order,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_channel(&self, channel: &str) -> bool {
        self.channel.trim().eq_ignore_ascii_case(channel.trim())
    }
}

/// API Key 记录；明文只在创建时返回一次
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub key_hash: String,
    pub key_prefix: String,
    pub key_suffix: String,
    pub enabled: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Default for ApiKey {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            key_hash: String::new(),
            key_prefix: String::new(),
            key_suffix: String::new(),
            enabled: true,
            last_used_at: None,
            created_at: Utc::now(),
        }
    }
}

impl ApiKey {
    /// 去掉哈希后用于接口输出
    #[must_use]
    pub fn redacted(mut self) -> Self {
        self.key_hash.clear();
        self
    }
}

/// 从上游响应头解析出的限额信息
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: Option<f64>,
    pub remaining: Option<f64>,
    pub reset_at: Option<DateTime<Utc>>,
}

impl RateLimitInfo {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.limit.is_none() && self.remaining.is_none() && self.reset_at.is_none()
    }
}

/// 导入结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_defaults_to_orchids() {
        let acc = Account::default();
        assert_eq!(acc.channel(), "orchids");
        assert!(acc.matches_channel("Orchids"));
        assert!(acc.matches_channel(""));
        assert!(!acc.matches_channel("warp"));
    }

    #[test]
    fn test_agent_mode_matches_channel() {
        let acc = Account {
            account_type: "orchids".into(),
            agent_mode: "Warp".into(),
            ..Account::default()
        };
        assert!(acc.matches_channel("warp"));
    }

    #[test]
    fn test_account_round_trip() {
        let acc = Account {
            id: 7,
            name: "primary".into(),
            account_type: "grok".into(),
            weight: 3,
            status_code: STATUS_QUOTA_EXCEEDED.into(),
            quota_reset_at: Some(Utc::now()),
            usage_current: 12.5,
            ..Account::default()
        };
        let encoded = serde_json::to_string(&acc).unwrap();
        let decoded: Account = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, acc);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }

    #[test]
    fn test_api_key_redacted_hides_hash() {
        let key = ApiKey {
            key_hash: "abc".into(),
            ..ApiKey::default()
        };
        let json = serde_json::to_value(key.redacted()).unwrap();
        assert!(json.get("key_hash").is_none());
    }
}
