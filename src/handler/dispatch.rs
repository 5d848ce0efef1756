//! # 请求分派
//!
//! 模型解析、账号选择与自动换号。一次分派最多尝试两个账号：
//! 首次失败且属于 403/429 或瞬时网络错误、并且尚未向下游写出任何事件时，
//! 标记账号状态、释放连接、排除该账号后重试一次。

use std::future::Future;
use std::sync::Arc;

use crate::app::AppContext;
use crate::error::classify::{error_chain_text, is_retryable, should_switch_account};
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::provider::UpstreamClient;
use crate::store::{Account, Model};
use crate::tracker::AccountLease;
use crate::utils::mask_secret;
use crate::{ldebug, linfo, lwarn};

/// 总尝试次数（首次 + 一次换号）
pub const MAX_ATTEMPTS: usize = 2;

/// 在渠道的启用模型中解析请求模型；空模型取渠道默认
pub async fn resolve_model(state: &AppContext, channel: &str, requested: &str) -> Result<Model> {
    let models = state.store.list_channel_models(channel).await?;
    let requested = requested.trim();
    if requested.is_empty() {
        return models
            .iter()
            .filter(|m| m.status.is_enabled())
            .find(|m| m.is_default)
            .or_else(|| models.iter().find(|m| m.status.is_enabled()))
            .cloned()
            .ok_or_else(|| ProxyError::validation("model not found"));
    }
    models
        .into_iter()
        .find(|m| m.status.is_enabled() && m.model_id.eq_ignore_ascii_case(requested))
        .ok_or_else(|| ProxyError::validation(format!("model not found: {requested}")))
}

/// 该错误是否值得换号重试
#[must_use]
pub fn should_retry_elsewhere(err: &ProxyError) -> bool {
    if matches!(err.root(), ProxyError::CircuitOpen { .. } | ProxyError::Cancelled { .. }) {
        return false;
    }
    should_switch_account(err) || is_retryable(err)
}

/// 一次成功分派的结果
#[derive(Debug)]
pub struct Dispatched<T> {
    pub value: T,
    pub account: Account,
    pub attempts: usize,
}

/// 失败时携带最后使用的账号，供审计记录
#[derive(Debug)]
pub struct DispatchError {
    pub error: ProxyError,
    pub account: Option<Account>,
}

impl From<DispatchError> for ProxyError {
    fn from(err: DispatchError) -> Self {
        err.error
    }
}

/// 选号、占用连接、经熔断器调用 `op`，失败时按策略换号重试一次
///
/// `can_retry` 在失败后调用，流式场景用它检查是否已经向下游写出内容。
pub async fn with_account_switch<T, F, Fut, R>(
    state: &AppContext,
    request_id: &str,
    channel: &str,
    can_retry: R,
    mut op: F,
) -> std::result::Result<Dispatched<T>, DispatchError>
where
    F: FnMut(Arc<dyn UpstreamClient>, Account) -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn() -> bool,
{
    let mut excluded: Vec<i64> = Vec::new();
    let mut last_account: Option<Account> = None;
    for attempt in 1..=MAX_ATTEMPTS {
        let account = match state.balancer.next_account(request_id, &excluded, channel).await {
            Ok(account) => account,
            Err(error) => {
                return Err(DispatchError {
                    error,
                    account: last_account,
                });
            }
        };
        let lease = AccountLease::acquire(state.balancer.tracker(), account.id).await;
        let client = match state.providers.client_for(&account) {
            Ok(client) => client,
            Err(error) => {
                lease.release().await;
                return Err(DispatchError {
                    error,
                    account: Some(account),
                });
            }
        };
        let provider = client.provider().to_string();
        let breaker = state.breakers.get(&provider);
        let result = breaker
            .call(|| op(Arc::clone(&client), account.clone()))
            .await;
        record_usage(state, request_id, client.as_ref(), &account).await;
        sync_rotated_token(state, request_id, client.as_ref(), &account).await;
        lease.release().await;

        let error = match result {
            Ok(value) => {
                return Ok(Dispatched {
                    value,
                    account,
                    attempts: attempt,
                });
            }
            Err(error) => error,
        };

        state.metrics.record_upstream_error(&provider);
        state
            .balancer
            .mark_account_status(request_id, &account, &error_chain_text(&error))
            .await;

        let retry = attempt < MAX_ATTEMPTS && can_retry() && should_retry_elsewhere(&error);
        if !retry {
            return Err(DispatchError {
                error,
                account: Some(account),
            });
        }
        lwarn!(
            request_id,
            LogStage::UpstreamRequest,
            LogComponent::Balancer,
            "account_switch",
            "上游失败，切换账号重试",
            account_id = account.id,
            provider = %provider,
            error = %error
        );
        state.metrics.record_switch();
        excluded.push(account.id);
        last_account = Some(account);
    }
    Err(DispatchError {
        error: ProxyError::no_available_account("account switch exhausted"),
        account: last_account,
    })
}

/// 把上游响应头里的限额写回账号；失败只记日志
async fn record_usage(state: &AppContext, request_id: &str, client: &dyn UpstreamClient, account: &Account) {
    let Some(info) = client.rate_limit() else {
        return;
    };
    if info.is_empty() {
        return;
    }
    if let Err(e) = state.store.update_account_usage(account.id, &info).await {
        ldebug!(
            request_id,
            LogStage::Response,
            LogComponent::Store,
            "update_account_usage",
            "账号用量写入失败",
            account_id = account.id,
            error = %e
        );
    }
}

/// 请求途中轮换的 refresh token 写回账号，并把会话挂到新凭据下
async fn sync_rotated_token(state: &AppContext, request_id: &str, client: &dyn UpstreamClient, account: &Account) {
    let Some(token) = client.rotated_refresh_token().await else {
        return;
    };
    let persisted = async {
        let mut current = state.store.get_account(account.id).await?;
        if current.refresh_token == token {
            return Ok(false);
        }
        current.refresh_token.clone_from(&token);
        state.store.update_account(&current).await?;
        Ok::<_, ProxyError>(true)
    }
    .await;
    match persisted {
        Ok(true) => {
            state
                .sessions
                .rekey(&account.channel(), account.id, account.credential(), &token);
            state.balancer.invalidate();
            linfo!(
                request_id,
                LogStage::Response,
                LogComponent::Store,
                "sync_refresh_token",
                "已写回轮换后的 refresh token",
                account_id = account.id,
                refresh_token = %mask_secret(&token)
            );
        }
        Ok(false) => {}
        Err(e) => {
            lwarn!(
                request_id,
                LogStage::Response,
                LogComponent::Store,
                "sync_refresh_token",
                "轮换后的 refresh token 写回失败",
                account_id = account.id,
                error = %e
            );
        }
    }
}
