use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use tollgate_core::ApiError;
use tollgate_ledger::{TokenBalance, TokenTransaction};
use tollgate_store::audit::{self, AuditFilter};
use tollgate_store::dialogs;
use tollgate_store::types::AuditRecord;

use crate::app::AppState;
use crate::envelope::{Auth, Identity};
use crate::error::{Failure, HandlerResult};
use crate::http::dialogs::PageQuery;

#[derive(Serialize)]
pub struct UserStats {
    pub user_id: i64,
    pub dialog_count: i64,
    pub total_tokens_used: i64,
    pub balance: i64,
    pub limit: Option<i64>,
}

#[derive(Serialize)]
pub struct UserDetails {
    #[serde(flatten)]
    pub stats: UserStats,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct SetLimitRequest {
    /// `null` clears the limit.
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct AdjustTokensRequest {
    /// Positive tops up, negative deducts.
    pub amount: i64,
}

#[derive(Serialize)]
pub struct AdjustTokensResponse {
    pub balance: TokenBalance,
    pub transaction: TokenTransaction,
}

fn require_admin(identity: &Identity) -> Result<(), Failure> {
    if !identity.is_admin {
        return Err(Failure(ApiError::Forbidden(
            "Admin access required".to_string(),
        )));
    }
    Ok(())
}

fn user_stats(state: &AppState, balance: &TokenBalance) -> Result<UserStats, Failure> {
    let dialog_count = state
        .db
        .with_conn(|conn| dialogs::count_by_user(conn, balance.user_id))?;
    let total_used = state.ledger.total_used(balance.user_id)?;
    Ok(UserStats {
        user_id: balance.user_id,
        dialog_count,
        total_tokens_used: total_used,
        balance: balance.balance,
        limit: balance.limit,
    })
}

/// GET /api/v1/admin/users — every known user with usage aggregates.
pub async fn list_users(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Query(page): Query<PageQuery>,
) -> HandlerResult<Json<Vec<UserStats>>> {
    require_admin(&identity)?;

    let page_num = page.page.max(1);
    let page_size = page.page_size.clamp(1, 100);
    let balances = state
        .ledger
        .list_balances((page_num - 1) * page_size, page_size)?;

    let mut users = Vec::with_capacity(balances.len());
    for balance in &balances {
        users.push(user_stats(&state, balance)?);
    }
    Ok(Json(users))
}

/// GET /api/v1/admin/users/{id}
pub async fn user_details(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(user_id): Path<i64>,
) -> HandlerResult<Json<UserDetails>> {
    require_admin(&identity)?;

    let balance = state
        .ledger
        .balance_if_exists(user_id)?
        .ok_or_else(|| Failure(ApiError::NotFound(format!("User {user_id} not found"))))?;

    let stats = user_stats(&state, &balance)?;
    let last_activity = state
        .db
        .with_conn(|conn| dialogs::last_activity(conn, user_id))?;

    Ok(Json(UserDetails {
        stats,
        last_activity,
    }))
}

/// PATCH /api/v1/admin/users/{id}/limits
pub async fn set_limit(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(user_id): Path<i64>,
    Json(req): Json<SetLimitRequest>,
) -> HandlerResult<Json<TokenBalance>> {
    require_admin(&identity)?;
    let balance = state
        .ledger
        .set_limit(user_id, req.limit, identity.user_id)?;
    Ok(Json(balance))
}

/// POST /api/v1/admin/users/{id}/tokens — top-up (+) or deduct (−).
pub async fn adjust_tokens(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(user_id): Path<i64>,
    Json(req): Json<AdjustTokensRequest>,
) -> HandlerResult<Json<AdjustTokensResponse>> {
    require_admin(&identity)?;
    let (balance, transaction) = state
        .ledger
        .credit(user_id, req.amount, identity.user_id)?;
    Ok(Json(AdjustTokensResponse {
        balance,
        transaction,
    }))
}

#[derive(Deserialize)]
pub struct AuditQuery {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
    /// Inclusive lower bound, `YYYY-MM-DD`.
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    /// Exclusive upper bound, `YYYY-MM-DD`.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_audit_limit")]
    pub limit: usize,
}

fn default_audit_limit() -> usize {
    100
}

fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc())
        .unwrap_or_default()
}

/// GET /api/v1/admin/audit — browse the audit trail with optional filters.
pub async fn audit_logs(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Query(query): Query<AuditQuery>,
) -> HandlerResult<Json<Vec<AuditRecord>>> {
    require_admin(&identity)?;

    let filter = AuditFilter {
        user_id: query.user_id,
        action: query.action,
        resource_type: query.resource_type,
        since: query.start_date.map(midnight_utc),
        until: query.end_date.map(midnight_utc),
    };
    let records = state
        .db
        .with_conn(|conn| audit::list(conn, &filter, query.skip, query.limit.clamp(1, 1000)))?;
    Ok(Json(records))
}

/// GET /api/v1/admin/users/{id}/tokens/history
pub async fn token_history(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(user_id): Path<i64>,
    Query(page): Query<PageQuery>,
) -> HandlerResult<Json<Vec<TokenTransaction>>> {
    require_admin(&identity)?;

    if state.ledger.balance_if_exists(user_id)?.is_none() {
        return Err(Failure(ApiError::NotFound(format!(
            "User {user_id} not found"
        ))));
    }

    let page_num = page.page.max(1);
    let page_size = page.page_size.clamp(1, 100);
    let history = state
        .ledger
        .history(user_id, (page_num - 1) * page_size, page_size)?;
    Ok(Json(history))
}
