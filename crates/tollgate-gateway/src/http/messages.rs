use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use tollgate_chat::{SendRequest, TurnEvent};
use tollgate_core::types::AgentConfig;
use tollgate_core::ApiError;
use tollgate_store::types::StoredMessage;

use crate::app::AppState;
use crate::envelope::Auth;
use crate::error::{Failure, HandlerResult};

#[derive(Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub config: Option<AgentConfig>,
    #[serde(default)]
    pub agent_type: Option<String>,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub skip: usize,
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// One SSE frame. The terminal frame carries the persisted message id and
/// the usage that was debited.
#[derive(Serialize)]
struct StreamFrame {
    content: String,
    done: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    completion_tokens: Option<u32>,
}

fn validate_content(state: &AppState, content: &str) -> Result<(), Failure> {
    if content.trim().is_empty() {
        return Err(Failure(ApiError::Validation(
            "content cannot be empty".to_string(),
        )));
    }
    if content.len() > state.config.gateway.max_content_length {
        return Err(Failure(ApiError::Validation(format!(
            "content exceeds maximum length of {} bytes",
            state.config.gateway.max_content_length
        ))));
    }
    Ok(())
}

/// POST /api/v1/dialogs/{id}/messages — send a turn, stream the reply.
///
/// Failures before the provider produces anything (ownership, admission,
/// validation, immediate upstream errors) come back as plain JSON errors
/// with the right status; once the stream is open, failures terminate it
/// with an `{"error": ..., "done": true}` frame.
pub async fn send_message_stream(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> HandlerResult<impl IntoResponse> {
    validate_content(&state, &req.content)?;

    let mut rx = state
        .chat
        .send_stream(SendRequest {
            dialog_id: id,
            user_id: identity.user_id,
            is_admin: identity.is_admin,
            content: req.content,
            config: req.config,
            agent_type: req.agent_type,
        })
        .await?;

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let frame = match event {
                TurnEvent::Chunk { text } => sse_frame(&StreamFrame {
                    content: text,
                    done: false,
                    message_id: None,
                    prompt_tokens: None,
                    completion_tokens: None,
                }),
                TurnEvent::Final {
                    message_id,
                    prompt_tokens,
                    completion_tokens,
                } => sse_frame(&StreamFrame {
                    content: String::new(),
                    done: true,
                    message_id: Some(message_id),
                    prompt_tokens: Some(prompt_tokens),
                    completion_tokens: Some(completion_tokens),
                }),
                TurnEvent::Error { message } => {
                    Event::default().data(
                        serde_json::json!({"error": message, "done": true}).to_string(),
                    )
                }
            };
            yield Ok::<_, Infallible>(frame);
        }
    };

    let sse = Sse::new(stream).keep_alive(KeepAlive::default());
    Ok((
        [
            ("cache-control", "no-cache"),
            ("connection", "keep-alive"),
            ("x-accel-buffering", "no"),
        ],
        sse,
    ))
}

fn sse_frame(frame: &StreamFrame) -> Event {
    Event::default().data(serde_json::to_string(frame).unwrap_or_default())
}

/// POST /api/v1/dialogs/{id}/messages/sync — send a turn, wait for the
/// full assistant message.
pub async fn send_message_sync(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> HandlerResult<(StatusCode, Json<StoredMessage>)> {
    validate_content(&state, &req.content)?;

    let outcome = state
        .chat
        .send(SendRequest {
            dialog_id: id,
            user_id: identity.user_id,
            is_admin: identity.is_admin,
            content: req.content,
            config: req.config,
            agent_type: req.agent_type,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(outcome.message)))
}

/// GET /api/v1/dialogs/{id}/messages — history, oldest first.
pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Auth(identity): Auth,
    Path(id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> HandlerResult<Json<Vec<StoredMessage>>> {
    let messages = state.chat.history(
        id,
        identity.user_id,
        identity.is_admin,
        query.skip,
        query.limit.min(1000),
    )?;
    Ok(Json(messages))
}
