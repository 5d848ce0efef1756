//! # 管理端异步批量任务
//!
//! 令牌刷新、NSFW 开启与在线缓存清理都以批量任务运行：请求立即返回 `task_id`，
//! 进度通过 `GET /admin/batch/{task_id}/stream` 订阅，`POST .../cancel` 取消。

use std::future::Future;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};

use super::response;
use crate::batch::{ItemOutcome, mask_token, normalize_concurrency, progress_sse, run_pool};
use crate::error::{ProxyError, Result};
use crate::handler::HandlerState;
use crate::logging::{LogComponent, LogStage};
use crate::provider::grok::PROVIDER_NAME as GROK;
use crate::store::Account;
use crate::{linfo, lwarn};

/// 可刷新凭据的渠道
const REFRESHABLE: &[&str] = &["grok", "warp"];

/// 批量任务请求体；`account_ids` 为空表示全部匹配账号
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct JobBody {
    pub account_ids: Vec<i64>,
    pub concurrency: Option<usize>,
}

/// 结果表中的键
fn item_key(account: &Account) -> String {
    let credential = account.credential().trim();
    if credential.is_empty() {
        format!("account-{}", account.id)
    } else {
        mask_token(credential)
    }
}

/// 按渠道与 id 过滤出目标账号；`channels` 为空时不限渠道
async fn target_accounts(state: &HandlerState, ids: &[i64], channels: &[&str]) -> Result<Vec<Account>> {
    let accounts = state.store.list_accounts().await?;
    let targets: Vec<Account> = accounts
        .into_iter()
        .filter(|a| channels.is_empty() || channels.iter().any(|c| a.matches_channel(c)))
        .filter(|a| if ids.is_empty() { a.enabled } else { ids.contains(&a.id) })
        .collect();
    if targets.is_empty() {
        return Err(ProxyError::validation("no matching accounts"));
    }
    Ok(targets)
}

/// 启动批量任务并返回 `{task_id, total}`
///
/// `task_id` 同时登记为临时授权，公共流接口可凭它订阅进度。
async fn start_job<W, Fut>(
    state: &HandlerState,
    action: &'static str,
    accounts: Vec<Account>,
    concurrency: Option<usize>,
    worker: W,
) -> Result<Value>
where
    W: Fn(HandlerState, Account) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ItemOutcome> + Send + 'static,
{
    let cfg = state.config.get_config().await;
    let concurrency = normalize_concurrency(
        concurrency,
        cfg.batch.default_concurrency,
        cfg.batch.max_concurrency,
    );
    let total = accounts.len();
    let job_state = Arc::clone(state);
    let task = state.batches.spawn(total, move |task| async move {
        run_pool(&task, accounts, concurrency, |account, _token| {
            worker(Arc::clone(&job_state), account)
        })
        .await;
        let snapshot = task.snapshot();
        linfo!(
            task.id(),
            LogStage::Batch,
            LogComponent::Batch,
            action,
            "批量任务执行结束",
            processed = snapshot.processed,
            ok = snapshot.ok,
            fail = snapshot.fail
        );
        Ok(None)
    });
    state.auth.grants().insert(task.id());
    linfo!(
        task.id(),
        LogStage::Batch,
        LogComponent::Batch,
        action,
        "批量任务已创建",
        total = total,
        concurrency = concurrency
    );
    Ok(json!({ "task_id": task.id(), "total": total }))
}

/// 刷新单个账号并写回轮换后的凭据与限额
pub(crate) async fn refresh_one(state: &HandlerState, account: &Account) -> Result<Value> {
    let client = state.providers.client_for(account)?;
    let outcome = client.refresh_account().await?;

    let mut updated = state.store.get_account(account.id).await?;
    let rotated = match outcome.refresh_token {
        Some(token) if !token.is_empty() && token != updated.refresh_token => {
            updated.refresh_token = token;
            true
        }
        _ => false,
    };
    updated.clear_status();
    state.store.update_account(&updated).await?;
    if let Some(info) = &outcome.rate_limit {
        state.store.update_account_usage(account.id, info).await?;
    }
    if rotated {
        state.sessions.remove_account(&account.channel(), account.id);
    }
    state.balancer.invalidate();
    Ok(json!({
        "account_id": account.id,
        "expires_at": outcome.expires_at,
        "remaining": outcome.rate_limit.and_then(|r| r.remaining),
        "rotated": rotated,
    }))
}

/// 失败时按错误文本标记账号状态
async fn item_failed(state: &HandlerState, action: &str, account: &Account, err: &ProxyError) -> ItemOutcome {
    lwarn!(
        "system",
        LogStage::Batch,
        LogComponent::Batch,
        action,
        "批量任务条目失败",
        account_id = account.id,
        error = %err
    );
    state
        .balancer
        .mark_account_status("system", account, &err.to_string())
        .await;
    ItemOutcome::fail(item_key(account), json!({ "error": err.public_message() }))
}

/// `POST /admin/tokens/refresh/async`
pub async fn refresh_tokens(State(state): State<HandlerState>, Json(body): Json<JobBody>) -> Response {
    let result = async {
        let accounts = target_accounts(&state, &body.account_ids, REFRESHABLE).await?;
        start_job(&state, "refresh_tokens", accounts, body.concurrency, |state, account| async move {
            match refresh_one(&state, &account).await {
                Ok(payload) => ItemOutcome::ok(item_key(&account), payload),
                Err(e) => item_failed(&state, "refresh_tokens", &account, &e).await,
            }
        })
        .await
    }
    .await;
    response::respond(result)
}

async fn enable_nsfw_one(state: &HandlerState, account: &Account) -> Result<Value> {
    let client = state.providers.client_for(account)?;
    client.enable_nsfw().await?;
    let mut updated = state.store.get_account(account.id).await?;
    updated.nsfw_enabled = true;
    state.store.update_account(&updated).await?;
    Ok(json!({ "account_id": account.id, "nsfw_enabled": true }))
}

/// `POST /admin/tokens/nsfw/enable/async`
pub async fn enable_nsfw(State(state): State<HandlerState>, Json(body): Json<JobBody>) -> Response {
    let result = async {
        let accounts = target_accounts(&state, &body.account_ids, &[GROK]).await?;
        start_job(&state, "enable_nsfw", accounts, body.concurrency, |state, account| async move {
            match enable_nsfw_one(&state, &account).await {
                Ok(payload) => ItemOutcome::ok(item_key(&account), payload),
                Err(e) => item_failed(&state, "enable_nsfw", &account, &e).await,
            }
        })
        .await
    }
    .await;
    response::respond(result)
}

/// `POST /admin/cache/online/clear/async`
///
/// 逐个丢弃账号的上游会话（缓存的 bearer），全部完成后清空 token 缓存。
pub async fn clear_online(State(state): State<HandlerState>, Json(body): Json<JobBody>) -> Response {
    let result = async {
        let accounts = target_accounts(&state, &body.account_ids, &[]).await?;
        let total = accounts.len();
        let cfg = state.config.get_config().await;
        let concurrency = normalize_concurrency(
            body.concurrency,
            cfg.batch.default_concurrency,
            cfg.batch.max_concurrency,
        );
        let job_state = Arc::clone(&state);
        let task = state.batches.spawn(total, move |task| async move {
            run_pool(&task, accounts, concurrency, |account, _token| {
                let state = Arc::clone(&job_state);
                async move {
                    let removed = state.sessions.remove_account(&account.channel(), account.id);
                    ItemOutcome::ok(
                        item_key(&account),
                        json!({ "account_id": account.id, "sessions": removed }),
                    )
                }
            })
            .await;
            if task.cancel_token().is_cancelled() {
                return Ok(None);
            }
            let cleared = match &job_state.token_cache {
                Some(cache) => cache.clear().await?,
                None => 0,
            };
            Ok(Some(json!({ "token_cache_cleared": cleared })))
        });
        state.auth.grants().insert(task.id());
        Ok(json!({ "task_id": task.id(), "total": total }))
    }
    .await;
    response::respond(result)
}

/// `GET /admin/batch/{task_id}/stream`
pub async fn stream(State(state): State<HandlerState>, Path(task_id): Path<String>) -> Response {
    match state.batches.get(&task_id) {
        Some(task) => progress_sse(task).into_response(),
        None => response::app_error(ProxyError::not_found("task not found")),
    }
}

/// `GET /admin/batch/{task_id}`
pub async fn snapshot(State(state): State<HandlerState>, Path(task_id): Path<String>) -> Response {
    match state.batches.get(&task_id) {
        Some(task) => response::success(task.snapshot()),
        None => response::app_error(ProxyError::not_found("task not found")),
    }
}

/// `POST /admin/batch/{task_id}/cancel`
pub async fn cancel(State(state): State<HandlerState>, Path(task_id): Path<String>) -> Response {
    let Some(task) = state.batches.get(&task_id) else {
        return response::app_error(ProxyError::not_found("task not found"));
    };
    task.request_cancel();
    linfo!(
        &task_id,
        LogStage::Batch,
        LogComponent::Batch,
        "cancel",
        "批量任务已请求取消"
    );
    response::success(task.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_key_masks_long_credentials() {
        let mut account = Account {
            id: 7,
            ..Account::default()
        };
        assert_eq!(item_key(&account), "account-7");
        account.refresh_token = "abcdefgh-0123456789-ijklmnop".to_string();
        assert_eq!(item_key(&account), "abcdefgh...ijklmnop");
    }
}
