//! 管理端登录会话与 `task_id` 临时授权
//!
//! 两者都是带 TTL 的令牌表：访问时惰性过期，后台定期清理。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::utils::random_hex;

/// 登录会话 cookie 名
pub const SESSION_COOKIE: &str = "session_token";

/// 带过期时间的令牌表
#[derive(Debug)]
pub struct TokenTable {
    ttl: Duration,
    entries: Mutex<HashMap<String, Instant>>,
}

impl TokenTable {
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Instant>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记一个已知令牌
    pub fn insert(&self, token: &str) {
        let token = token.trim();
        if token.is_empty() {
            return;
        }
        self.lock().insert(token.to_string(), Instant::now() + self.ttl);
    }

    /// 生成并登记一个新令牌
    pub fn issue(&self) -> String {
        let token = random_hex(32);
        self.insert(&token);
        token
    }

    /// 令牌有效；过期的顺手删除
    #[must_use]
    pub fn contains(&self, token: &str) -> bool {
        let token = token.trim();
        if token.is_empty() {
            return false;
        }
        let mut entries = self.lock();
        match entries.get(token) {
            Some(expires_at) if *expires_at > Instant::now() => true,
            Some(_) => {
                entries.remove(token);
                false
            }
            None => false,
        }
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.lock().remove(token.trim()).is_some()
    }

    /// 删除所有过期令牌，返回删除数量
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, expires_at| *expires_at > now);
        before - entries.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_issue_and_expire() {
        let table = TokenTable::new(Duration::from_secs(60));
        let token = table.issue();
        assert_eq!(token.len(), 64);
        assert!(table.contains(&token));
        assert!(!table.contains("other"));
        assert!(!table.contains(""));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!table.contains(&token));
        assert!(table.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_and_revoke() {
        let table = TokenTable::new(Duration::from_secs(10));
        table.insert("a");
        let b = table.issue();
        assert!(table.revoke(&b));
        assert!(!table.revoke(&b));
        tokio::time::advance(Duration::from_secs(11)).await;
        table.insert("c");
        assert_eq!(table.sweep(), 1);
        assert_eq!(table.len(), 1);
    }
}
