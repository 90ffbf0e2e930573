use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tollgate_core::types::AgentConfig;
use tollgate_core::ApiError;
use tollgate_store::types::Dialog;
use tollgate_store::{dialogs, StoreError};

use crate::app::AppState;
use crate::envelope::Auth;
use crate::error::{Failure, HandlerResult};

#[derive(Deserialize)]
pub struct CreateDialogRequest {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub agent_config: Option<AgentConfig>,
}

#[derive(Serialize)]
pub struct DialogList {
    pub items: Vec<Dialog>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub has_next: bool,
}

#[derive(Deserialize)]
pub struct PageQuery {
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}
fn default_page_size() -> usize {
    20
}

/// POST /api/v1/dialogs
pub async fn create_dialog(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Json(req): Json<CreateDialogRequest>,
) -> HandlerResult<(StatusCode, Json<Dialog>)> {
    let model_name = match req.model_name {
        Some(name) => name,
        None => default_model(&state)?,
    };
    let model = state.registry.validate(&model_name)?;

    if let Some(ref config) = req.agent_config {
        config.validate(Some(model.context_window))?;
    }

    let dialog = state.db.with_conn(|conn| {
        dialogs::insert(
            conn,
            &dialogs::NewDialog {
                user_id: identity.user_id,
                title: req.title,
                system_prompt: req.system_prompt,
                model_name,
                agent_config: req.agent_config,
            },
        )
    })?;

    Ok((StatusCode::CREATED, Json(dialog)))
}

/// The configured default when it is in the catalog, else the first
/// enabled model.
fn default_model(state: &AppState) -> Result<String, Failure> {
    let preferred = &state.config.llm.default_model;
    if state.registry.exists(preferred) {
        return Ok(preferred.clone());
    }
    state
        .registry
        .all()
        .first()
        .map(|m| m.name.clone())
        .ok_or_else(|| Failure(ApiError::Validation("No models available".to_string())))
}

/// GET /api/v1/dialogs
pub async fn list_dialogs(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Query(page): Query<PageQuery>,
) -> HandlerResult<Json<DialogList>> {
    let page_num = page.page.max(1);
    let page_size = if page.page_size == 0 || page.page_size > 100 {
        default_page_size()
    } else {
        page.page_size
    };
    let skip = (page_num - 1) * page_size;

    // fetch one extra row to detect another page without a COUNT
    let mut items = state
        .db
        .with_conn(|conn| dialogs::list_by_user(conn, identity.user_id, skip, page_size + 1))?;
    let has_next = items.len() > page_size;
    items.truncate(page_size);

    let total = skip + items.len() + usize::from(has_next);
    Ok(Json(DialogList {
        total,
        page: page_num,
        page_size,
        has_next,
        items,
    }))
}

/// GET /api/v1/dialogs/{id}
pub async fn get_dialog(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(id): Path<Uuid>,
) -> HandlerResult<Json<Dialog>> {
    let dialog = state
        .db
        .with_conn(|conn| dialogs::get(conn, id))
        .map_err(|e| match e {
            StoreError::NotFound { .. } => {
                Failure(ApiError::NotFound(format!("Dialog {id} not found")))
            }
            other => Failure::from(other),
        })?;

    if !identity.is_admin && dialog.user_id != identity.user_id {
        return Err(Failure(ApiError::Forbidden(format!(
            "Access denied to dialog {id}"
        ))));
    }
    Ok(Json(dialog))
}
