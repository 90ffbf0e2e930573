use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use tollgate_ledger::TokenStats;

use crate::app::AppState;
use crate::envelope::Auth;
use crate::error::HandlerResult;

/// GET /api/v1/users/me/tokens — balance, lifetime usage, and limit.
pub async fn my_tokens(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
) -> HandlerResult<Json<TokenStats>> {
    let stats = state.ledger.stats(identity.user_id)?;
    Ok(Json(stats))
}
