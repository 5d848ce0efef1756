//! 运行状态：审计查询、熔断器、限流统计与账号负载

use axum::{
    extract::{Query, State},
    response::Response,
};
use serde_json::{Value, json};

use super::response;
use crate::ephemeral::AuditQuery;
use crate::error::Result;
use crate::handler::HandlerState;

/// 单次审计查询上限
const MAX_AUDIT_LIMIT: usize = 1000;

/// `GET /admin/verify` 与 `GET /public/verify`
pub async fn verify() -> axum::Json<Value> {
    axum::Json(json!({ "status": "success" }))
}

/// `GET /admin/audit?action=&start=&end=&limit=`
pub async fn audit(State(state): State<HandlerState>, Query(mut query): Query<AuditQuery>) -> Response {
    query.limit = Some(query.limit.unwrap_or(100).clamp(1, MAX_AUDIT_LIMIT));
    response::respond(state.audit.query(&query).await)
}

/// `GET /admin/breakers`
pub async fn breakers(State(state): State<HandlerState>) -> Response {
    response::success(state.breakers.states())
}

/// `GET /admin/status`：限流、批量任务与各账号当前连接数
pub async fn status(State(state): State<HandlerState>) -> Response {
    let result: Result<Value> = async {
        let accounts = state.store.list_accounts().await?;
        let ids: Vec<i64> = accounts.iter().map(|a| a.id).collect();
        let counts = state.balancer.tracker().get_counts(&ids).await;
        let load: Vec<Value> = accounts
            .iter()
            .map(|a| {
                json!({
                    "id": a.id,
                    "name": a.name,
                    "channel": a.channel(),
                    "enabled": a.enabled,
                    "weight": a.weight,
                    "status_code": a.status_code,
                    "active": counts.get(&a.id).copied().unwrap_or(0),
                    "request_count": a.request_count,
                })
            })
            .collect();
        Ok(json!({
            "limiter": state.limiter.stats(),
            "batch_tasks": state.batches.len(),
            "sessions": state.sessions.len(),
            "imagine_sessions": state.imagine.len(),
            "providers": state.providers.names(),
            "accounts": load,
        }))
    }
    .await;
    response::respond(result)
}
