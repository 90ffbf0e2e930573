//! Dialog backup and restore in JSON. Export walks every dialog the caller
//! owns; import creates fresh dialogs (it never updates existing ones) and
//! collects per-dialog errors instead of aborting the batch.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_core::types::{AgentConfig, Role};
use tollgate_store::{dialogs, messages, StoreError};

use crate::app::AppState;
use crate::envelope::Auth;
use crate::error::HandlerResult;

#[derive(Serialize)]
pub struct ExportResponse {
    pub exported_at: DateTime<Utc>,
    pub user_id: i64,
    pub dialog_count: usize,
    pub message_count: usize,
    pub dialogs: Vec<DialogExport>,
}

#[derive(Serialize)]
pub struct DialogExport {
    pub id: Uuid,
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    pub model_name: String,
    pub agent_config: Option<AgentConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub messages: Vec<MessageExport>,
}

#[derive(Serialize, Deserialize)]
pub struct MessageExport {
    pub role: Role,
    pub content: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct ImportRequest {
    pub dialogs: Vec<DialogImport>,
}

#[derive(Deserialize)]
pub struct DialogImport {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub agent_config: Option<AgentConfig>,
    #[serde(default)]
    pub messages: Vec<MessageExport>,
}

#[derive(Serialize)]
pub struct ImportResult {
    pub dialogs_imported: usize,
    pub messages_imported: usize,
    pub errors: Vec<String>,
}

/// GET /api/v1/export — every dialog the caller owns, with full message
/// history.
pub async fn export_dialogs(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
) -> HandlerResult<Json<ExportResponse>> {
    let exports = state
        .db
        .with_conn(|conn| -> Result<Vec<DialogExport>, StoreError> {
            let owned = dialogs::all_by_user(conn, identity.user_id)?;
            let mut exports = Vec::with_capacity(owned.len());
            for dialog in owned {
                let history = messages::all_by_dialog(conn, dialog.id)?;
                exports.push(DialogExport {
                    id: dialog.id,
                    title: dialog.title,
                    system_prompt: dialog.system_prompt,
                    model_name: dialog.model_name,
                    agent_config: dialog.agent_config,
                    created_at: dialog.created_at,
                    updated_at: dialog.updated_at,
                    messages: history
                        .into_iter()
                        .map(|m| MessageExport {
                            role: m.role,
                            content: m.content,
                            prompt_tokens: m.prompt_tokens,
                            completion_tokens: m.completion_tokens,
                            created_at: Some(m.created_at),
                        })
                        .collect(),
                });
            }
            Ok(exports)
        })?;

    let message_count = exports.iter().map(|d| d.messages.len()).sum();
    info!(
        user_id = identity.user_id,
        dialogs = exports.len(),
        messages = message_count,
        "dialogs exported"
    );

    Ok(Json(ExportResponse {
        exported_at: Utc::now(),
        user_id: identity.user_id,
        dialog_count: exports.len(),
        message_count,
        dialogs: exports,
    }))
}

/// POST /api/v1/export/import — restore dialogs from an export. Each dialog
/// imports in its own transaction; one bad dialog is reported and skipped.
pub async fn import_dialogs(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Json(req): Json<ImportRequest>,
) -> HandlerResult<Json<ImportResult>> {
    let mut dialogs_imported = 0;
    let mut messages_imported = 0;
    let mut errors = Vec::new();

    for (index, dialog_data) in req.dialogs.into_iter().enumerate() {
        let model_name = dialog_data
            .model_name
            .unwrap_or_else(|| state.config.llm.default_model.clone());

        let imported = state
            .db
            .with_tx(|tx| -> Result<usize, StoreError> {
                let dialog = dialogs::insert(
                    tx,
                    &dialogs::NewDialog {
                        user_id: identity.user_id,
                        title: dialog_data.title.clone(),
                        system_prompt: dialog_data.system_prompt.clone(),
                        model_name: model_name.clone(),
                        agent_config: dialog_data.agent_config.clone(),
                    },
                )?;
                for message in &dialog_data.messages {
                    messages::insert(
                        tx,
                        Uuid::new_v4(),
                        dialog.id,
                        message.role,
                        &message.content,
                        message.prompt_tokens,
                        message.completion_tokens,
                    )?;
                }
                Ok(dialog_data.messages.len())
            });

        match imported {
            Ok(count) => {
                dialogs_imported += 1;
                messages_imported += count;
            }
            Err(e) => {
                warn!(index, error = %e, "dialog import failed");
                errors.push(format!("Dialog {index}: {e}"));
            }
        }
    }

    info!(
        user_id = identity.user_id,
        dialogs = dialogs_imported,
        messages = messages_imported,
        errors = errors.len(),
        "dialogs imported"
    );

    Ok(Json(ImportResult {
        dialogs_imported,
        messages_imported,
        errors,
    }))
}
