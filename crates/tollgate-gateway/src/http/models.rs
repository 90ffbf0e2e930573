use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;

use tollgate_store::types::ModelInfo;

use crate::app::AppState;
use crate::envelope::Auth;
use crate::error::HandlerResult;

/// GET /api/v1/models — the enabled catalog.
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    Auth(_identity): Auth,
) -> HandlerResult<Json<Vec<ModelInfo>>> {
    Ok(Json(state.registry.all().into_iter().cloned().collect()))
}

/// GET /api/v1/models/{name} — one catalog entry; unknown names are a
/// validation error listing the valid choices.
pub async fn get_model(
    State(state): State<Arc<AppState>>,
    Auth(_identity): Auth,
    Path(name): Path<String>,
) -> HandlerResult<Json<ModelInfo>> {
    let model = state.registry.validate(&name)?;
    Ok(Json(model.clone()))
}
