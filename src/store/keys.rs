//! KV 键命名空间
//!
//! 所有键都以 `{prefix}:` 开头，多实例共享同一前缀即可共享状态。

/// 键空间
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    #[must_use]
    pub fn new(prefix: &str) -> Self {
        let prefix = prefix.trim().trim_end_matches(':');
        Self {
            prefix: if prefix.is_empty() {
                "relay".to_string()
            } else {
                prefix.to_string()
            },
        }
    }

    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    #[must_use]
    pub fn account(&self, id: i64) -> String {
        format!("{}:accounts:id:{id}", self.prefix)
    }

    #[must_use]
    pub fn account_record_prefix(&self) -> String {
        format!("{}:accounts:id:", self.prefix)
    }

    #[must_use]
    pub fn accounts_index(&self) -> String {
        format!("{}:accounts:index", self.prefix)
    }

    #[must_use]
    pub fn accounts_seq(&self) -> String {
        format!("{}:accounts:seq", self.prefix)
    }

    #[must_use]
    pub fn account_requests(&self, id: i64) -> String {
        format!("{}:accounts:reqs:{id}", self.prefix)
    }

    #[must_use]
    pub fn model(&self, id: &str) -> String {
        format!("{}:models:id:{id}", self.prefix)
    }

    #[must_use]
    pub fn model_record_prefix(&self) -> String {
        format!("{}:models:id:", self.prefix)
    }

    #[must_use]
    pub fn models_index(&self) -> String {
        format!("{}:models:index", self.prefix)
    }

    #[must_use]
    pub fn models_seq(&self) -> String {
        format!("{}:models:seq", self.prefix)
    }

    #[must_use]
    pub fn setting(&self, key: &str) -> String {
        format!("{}:settings:{key}", self.prefix)
    }

    #[must_use]
    pub fn api_key(&self, id: i64) -> String {
        format!("{}:apikeys:id:{id}", self.prefix)
    }

    #[must_use]
    pub fn api_key_by_hash(&self, hash: &str) -> String {
        format!("{}:apikeys:hash:{hash}", self.prefix)
    }

    #[must_use]
    pub fn api_keys_index(&self) -> String {
        format!("{}:apikeys:index", self.prefix)
    }

    #[must_use]
    pub fn api_keys_seq(&self) -> String {
        format!("{}:apikeys:seq", self.prefix)
    }

    /// 连接计数器前缀，启动时整体清理
    #[must_use]
    pub fn conns_prefix(&self) -> String {
        format!("{}:conns:", self.prefix)
    }

    #[must_use]
    pub fn conn(&self, id: i64) -> String {
        format!("{}:conns:{id}", self.prefix)
    }

    #[must_use]
    pub fn dedup(&self, fingerprint: &str) -> String {
        format!("{}:dedup:{fingerprint}", self.prefix)
    }

    #[must_use]
    pub fn session(&self, key: &str) -> String {
        format!("{}:sessions:{key}", self.prefix)
    }

    #[must_use]
    pub fn sessions_prefix(&self) -> String {
        format!("{}:sessions:", self.prefix)
    }

    #[must_use]
    pub fn token_cache(&self, key: &str) -> String {
        format!("{}:tokencache:{key}", self.prefix)
    }

    #[must_use]
    pub fn token_cache_prefix(&self) -> String {
        format!("{}:tokencache:", self.prefix)
    }

    #[must_use]
    pub fn audit_log(&self) -> String {
        format!("{}:audit:log", self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::new("relay:");
        assert_eq!(keys.account(3), "relay:accounts:id:3");
        assert_eq!(keys.accounts_index(), "relay:accounts:index");
        assert_eq!(keys.setting("config"), "relay:settings:config");
        assert_eq!(keys.conn(9), "relay:conns:9");
        assert!(keys.conn(9).starts_with(&keys.conns_prefix()));
        assert_eq!(keys.dedup("abc"), "relay:dedup:abc");
    }

    #[test]
    fn test_empty_prefix_falls_back() {
        assert_eq!(KeySpace::new("  ").prefix(), "relay");
    }
}
