//! # 认证模块
//!
//! 管理端与公共 API 的认证中间件、管理员登录会话，以及流式端点使用的
//! `task_id` 临时授权。认证配置每次从 `ConfigManager` 读取，运行时修改立即生效。

pub mod login;
pub mod middleware;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use crate::config::{AuthConfig, ConfigManager};
use crate::logging::{LogComponent, LogStage};
use crate::lwarn;
use crate::store::Store;
use crate::utils::constant_time_eq;

pub use login::{LoginRequest, login_handler, logout_handler};
pub use middleware::{admin_auth, bearer_token, cookie_value, has_admin_credentials, public_auth, public_stream_auth};
pub use session::{SESSION_COOKIE, TokenTable};

/// 认证中间件共享的状态
pub struct AuthGate {
    config: Arc<ConfigManager>,
    store: Store,
    sessions: TokenTable,
    grants: TokenTable,
    session_ttl: Duration,
}

impl std::fmt::Debug for AuthGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGate")
            .field("sessions", &self.sessions.len())
            .field("grants", &self.grants.len())
            .finish_non_exhaustive()
    }
}

impl AuthGate {
    #[must_use]
    pub fn new(config: Arc<ConfigManager>, store: Store, auth: &AuthConfig) -> Self {
        let session_ttl = Duration::from_secs(auth.session_ttl_secs.max(60));
        Self {
            config,
            store,
            sessions: TokenTable::new(session_ttl),
            grants: TokenTable::new(Duration::from_secs(auth.task_grant_ttl_secs.max(1))),
            session_ttl,
        }
    }

    pub async fn auth_config(&self) -> AuthConfig {
        self.config.get_config().await.auth
    }

    /// 管理员登录会话
    /// 公共 API 凭据：等于 `public_key`，或是一个启用中的 API Key
    pub async fn accepts_public_token(&self, public_key: &str, token: &str) -> bool {
        if constant_time_eq(token, public_key) {
            return true;
        }
        match self.store.validate_api_key(token).await {
            Ok(found) => found.is_some(),
            Err(e) => {
                lwarn!(
                    "system",
                    LogStage::Authentication,
                    LogComponent::Auth,
                    "validate_api_key",
                    "API Key 校验失败",
                    error = %e
                );
                false
            }
        }
    }

    #[must_use]
    pub const fn sessions(&self) -> &TokenTable {
        &self.sessions
    }

    /// `task_id` 临时授权
    #[must_use]
    pub const fn grants(&self) -> &TokenTable {
        &self.grants
    }

    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        self.session_ttl
    }

    /// 清理过期的会话与授权
    pub fn sweep(&self) -> usize {
        self.sessions.sweep() + self.grants.sweep()
    }
}
