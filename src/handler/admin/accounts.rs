//! 账号管理：增删改查与导入导出

use axum::{
    Json,
    extract::{Path, Query, State},
    response::Response,
};
use serde::Deserialize;
use serde_json::Value;

use super::{apply_patch, response};
use crate::error::{ProxyError, Result};
use crate::handler::HandlerState;
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::store::{Account, ImportSummary};
use crate::utils::jwt::{is_likely_jwt, jwt_has_rotating_token};

fn validate(account: &Account) -> Result<()> {
    if account.credential().trim().is_empty() {
        return Err(ProxyError::validation("account credential is required"));
    }
    if account.weight < 0 {
        return Err(ProxyError::validation("weight must be positive"));
    }
    // Orchids 需要 Clerk `__client` cookie，会话 JWT 过期后无法续期
    let cookie = account.client_cookie.trim();
    if account.channel() == "orchids" && is_likely_jwt(cookie) && !jwt_has_rotating_token(cookie) {
        return Err(ProxyError::validation(
            "orchids client_cookie must be the Clerk __client token, not a session jwt",
        ));
    }
    Ok(())
}

/// 账号写入后刷新选择缓存并丢弃旧会话
fn after_write(state: &HandlerState, account: &Account) {
    state.balancer.invalidate();
    state.sessions.remove_account(&account.channel(), account.id);
}

/// `GET /admin/accounts`
pub async fn list(State(state): State<HandlerState>) -> Response {
    response::respond(state.store.list_accounts().await)
}

/// `GET /admin/accounts/{id}`
pub async fn get(State(state): State<HandlerState>, Path(id): Path<i64>) -> Response {
    response::respond(state.store.get_account(id).await)
}

/// `POST /admin/accounts`
pub async fn create(State(state): State<HandlerState>, Json(mut account): Json<Account>) -> Response {
    let result = async {
        validate(&account)?;
        account.clear_status();
        state.store.create_account(&mut account).await?;
        state.balancer.invalidate();
        Ok(account)
    }
    .await;
    response::respond(result)
}

/// `PUT /admin/accounts/{id}`：JSON 合并补丁，`id` 与创建时间不可改
pub async fn update(
    State(state): State<HandlerState>,
    Path(id): Path<i64>,
    Json(patch): Json<Value>,
) -> Response {
    let result = async {
        let existing = state.store.get_account(id).await?;
        let mut updated: Account = apply_patch(&existing, &patch)?;
        updated.id = existing.id;
        updated.created_at = existing.created_at;
        updated.request_count = existing.request_count;
        validate(&updated)?;
        // 凭据变化后旧的冷却状态不再有意义
        if updated.credential() != existing.credential() {
            updated.clear_status();
        }
        state.store.update_account(&updated).await?;
        after_write(&state, &existing);
        Ok(updated)
    }
    .await;
    response::respond(result)
}

/// `DELETE /admin/accounts/{id}`
pub async fn delete(State(state): State<HandlerState>, Path(id): Path<i64>) -> Response {
    let result = async {
        let account = state.store.get_account(id).await?;
        state.store.delete_account(id).await?;
        after_write(&state, &account);
        linfo!(
            "system",
            LogStage::Cache,
            LogComponent::Store,
            "delete_account",
            "账号已删除",
            account_id = id
        );
        Ok(())
    }
    .await;
    match result {
        Ok(()) => response::success_without_data("账号已删除"),
        Err(e) => response::app_error(e),
    }
}

/// `POST /admin/accounts/{id}/reset`：清除冷却状态
pub async fn reset_status(State(state): State<HandlerState>, Path(id): Path<i64>) -> Response {
    let result = async {
        let mut account = state.store.get_account(id).await?;
        account.clear_status();
        state.store.update_account(&account).await?;
        state.balancer.invalidate();
        Ok(account)
    }
    .await;
    response::respond(result)
}

/// `GET /admin/accounts/export`
pub async fn export(State(state): State<HandlerState>) -> Response {
    response::respond(state.store.export_accounts().await)
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ImportParams {
    pub overwrite: bool,
}

/// `POST /admin/accounts/import?overwrite=true`
pub async fn import(
    State(state): State<HandlerState>,
    Query(params): Query<ImportParams>,
    Json(accounts): Json<Vec<Account>>,
) -> Response {
    let result: Result<ImportSummary> = async {
        let summary = state.store.import_accounts(accounts, params.overwrite).await?;
        state.balancer.invalidate();
        Ok(summary)
    }
    .await;
    response::respond(result)
}
