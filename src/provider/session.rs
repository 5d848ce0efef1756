//! # 账号会话
//!
//! 按 `(provider, account_id, 凭据指纹)` 复用的认证状态：当前 bearer、过期时间、
//! refresh token、登录标记以及会话级随机标识。刷新在会话锁内串行执行，
//! 同一账号的并发请求只会触发一次刷新。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::error::{ProxyError, Result};
use crate::store::Account;
use crate::utils::{random_hex, sha256_hex};

/// 一次刷新换来的凭据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub bearer: String,
    pub expires_at: DateTime<Utc>,
    /// 上游轮换了 refresh token 时给出
    pub refresh_token: Option<String>,
}

/// 登录信标需要的会话信息
#[derive(Debug, Clone)]
pub struct LoginContext {
    pub bearer: String,
    pub experiment_id: String,
    pub experiment_bucket: String,
}

#[derive(Debug, Default)]
struct SessionState {
    bearer: String,
    expires_at: Option<DateTime<Utc>>,
    refresh_token: String,
    logged_in: bool,
    last_login: Option<DateTime<Utc>>,
    experiment_id: String,
    experiment_bucket: String,
}

impl SessionState {
    fn token_valid(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        let Some(expires_at) = self.expires_at else {
            return false;
        };
        if self.bearer.is_empty() {
            return false;
        }
        let margin = chrono::Duration::from_std(margin).unwrap_or(chrono::Duration::zero());
        now + margin < expires_at
    }
}

/// 单个账号的会话
#[derive(Debug)]
pub struct AccountSession {
    key: String,
    state: Mutex<SessionState>,
}

impl AccountSession {
    fn new(key: String, refresh_token: &str) -> Self {
        Self {
            key,
            state: Mutex::new(SessionState {
                refresh_token: refresh_token.trim().to_string(),
                ..SessionState::default()
            }),
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 确保 bearer 在 `margin` 之后仍然有效，否则用 `refresh` 换一个新的
    ///
    /// `refresh` 收到当前 refresh token。锁在刷新期间一直持有。
    pub async fn ensure_token<F, Fut>(&self, margin: Duration, refresh: F) -> Result<String>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenGrant>>,
    {
        let mut state = self.state.lock().await;
        if state.token_valid(margin, Utc::now()) {
            return Ok(state.bearer.clone());
        }
        let grant = refresh(state.refresh_token.clone()).await?;
        Self::apply_grant(&mut state, grant);
        Ok(state.bearer.clone())
    }

    /// 无条件刷新
    pub async fn force_refresh<F, Fut>(&self, refresh: F) -> Result<TokenGrant>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenGrant>>,
    {
        let mut state = self.state.lock().await;
        let grant = refresh(state.refresh_token.clone()).await?;
        Self::apply_grant(&mut state, grant.clone());
        Ok(TokenGrant {
            refresh_token: Some(state.refresh_token.clone()),
            ..grant
        })
    }

    fn apply_grant(state: &mut SessionState, grant: TokenGrant) {
        if grant.bearer.is_empty() {
            return;
        }
        state.bearer = grant.bearer;
        state.expires_at = Some(grant.expires_at);
        if let Some(rotated) = grant.refresh_token.filter(|t| !t.trim().is_empty()) {
            state.refresh_token = rotated;
        }
    }

    /// 每 `interval` 至多发送一次登录信标；`login` 成功后记录登录时间
    pub async fn ensure_login<F, Fut>(&self, interval: Duration, login: F) -> Result<()>
    where
        F: FnOnce(LoginContext) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let interval = chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::zero());
        if state.logged_in && state.last_login.is_some_and(|last| now - last < interval) {
            return Ok(());
        }
        if state.bearer.is_empty() {
            return Err(ProxyError::refresh_failed(self.provider(), "missing jwt"));
        }
        if state.experiment_id.is_empty() {
            state.experiment_id = uuid::Uuid::new_v4().to_string();
        }
        if state.experiment_bucket.is_empty() {
            state.experiment_bucket = sha256_hex(random_hex(32).as_bytes());
        }
        let context = LoginContext {
            bearer: state.bearer.clone(),
            experiment_id: state.experiment_id.clone(),
            experiment_bucket: state.experiment_bucket.clone(),
        };
        login(context).await?;
        state.logged_in = true;
        state.last_login = Some(Utc::now());
        Ok(())
    }

    /// bearer 已签发且会在 `margin` 内过期
    pub async fn expiring_within(&self, margin: Duration) -> bool {
        let state = self.state.lock().await;
        !state.bearer.is_empty() && !state.token_valid(margin, Utc::now())
    }

    /// 当前 bearer 快照
    pub async fn bearer(&self) -> String {
        self.state.lock().await.bearer.clone()
    }

    pub async fn refresh_token(&self) -> String {
        self.state.lock().await.refresh_token.clone()
    }

    /// 让下一次请求重新换取 bearer 并重新登录
    pub async fn invalidate(&self) {
        let mut state = self.state.lock().await;
        state.bearer.clear();
        state.expires_at = None;
        state.logged_in = false;
    }

    fn provider(&self) -> &str {
        self.key.split(':').next().unwrap_or_default()
    }
}

/// 会话注册表
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<AccountSession>>,
}

impl SessionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 会话键：`{provider}:{account_id}:{凭据 sha256 前 16 位}`
    #[must_use]
    pub fn session_key(provider: &str, account_id: i64, credential: &str) -> String {
        let credential = credential.trim();
        let fingerprint = if credential.is_empty() {
            "anon".to_string()
        } else {
            sha256_hex(credential.as_bytes())[..16].to_string()
        };
        format!("{provider}:{account_id}:{fingerprint}")
    }

    /// 取出或创建账号会话；新建时清掉该账号旧凭据留下的会话
    pub fn get_or_create(&self, provider: &str, account: &Account) -> Arc<AccountSession> {
        let credential = account.credential();
        let key = Self::session_key(provider, account.id, credential);
        if let Some(session) = self.sessions.get(&key) {
            return Arc::clone(session.value());
        }
        self.evict_others(provider, account.id, &key);
        Arc::clone(
            self.sessions
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AccountSession::new(key, credential)))
                .value(),
        )
    }

    /// 凭据写回账号后，把现有会话挂到新凭据的键下
    pub fn rekey(&self, provider: &str, account_id: i64, from: &str, to: &str) -> bool {
        let old = Self::session_key(provider, account_id, from);
        let Some((_, session)) = self.sessions.remove(&old) else {
            return false;
        };
        let new = Self::session_key(provider, account_id, to);
        self.evict_others(provider, account_id, &new);
        self.sessions.insert(new, session);
        true
    }

    /// 删除某账号的全部会话（凭据变更或账号删除后）
    pub fn remove_account(&self, provider: &str, account_id: i64) -> usize {
        let prefix = format!("{provider}:{account_id}:");
        let before = self.sessions.len();
        self.sessions.retain(|key, _| !key.starts_with(&prefix));
        before - self.sessions.len()
    }

    fn evict_others(&self, provider: &str, account_id: i64, keep: &str) -> usize {
        let prefix = format!("{provider}:{account_id}:");
        let before = self.sessions.len();
        self.sessions
            .retain(|key, _| key == keep || !key.starts_with(&prefix));
        before - self.sessions.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
