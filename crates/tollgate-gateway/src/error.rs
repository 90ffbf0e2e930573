use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, warn};

use tollgate_chat::ChatError;
use tollgate_core::ApiError;
use tollgate_ledger::LedgerError;
use tollgate_provider::ProviderError;
use tollgate_store::StoreError;

use crate::envelope::{current_request_id, debug_enabled};

/// Response-side wrapper for [`ApiError`]: renders the
/// `{code, message, request_id, details?}` body with the request id from the
/// envelope's task-local context.
pub struct Failure(pub ApiError);

pub type HandlerResult<T> = std::result::Result<T, Failure>;

impl IntoResponse for Failure {
    fn into_response(self) -> Response {
        let request_id = current_request_id();
        let status =
            StatusCode::from_u16(self.0.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(request_id, code = self.0.code(), error = %self.0, "server error");
        } else {
            warn!(request_id, code = self.0.code(), error = %self.0, "client error");
        }

        let mut body = serde_json::json!({
            "code": self.0.code(),
            "message": self.0.to_string(),
            "request_id": request_id,
        });
        if let Some(details) = self.0.details() {
            // details ride along for client errors; 5xx only when debugging
            if status.as_u16() < 500 || debug_enabled() {
                body["details"] = details;
            }
        }

        (status, Json(body)).into_response()
    }
}

impl From<ApiError> for Failure {
    fn from(err: ApiError) -> Self {
        Failure(err)
    }
}

impl From<ChatError> for Failure {
    fn from(err: ChatError) -> Self {
        let api = match err {
            ChatError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ChatError::Forbidden(_) => ApiError::Forbidden(err.to_string()),
            ChatError::Validation(m) => ApiError::Validation(m),
            ChatError::InsufficientTokens(m) => ApiError::InsufficientTokens(m),
            ChatError::Unconfigured(provider) => {
                ApiError::Llm(format!("LLM provider not configured: {provider}"))
            }
            ChatError::Provider(e) => provider_error(e),
            ChatError::Store(e) => store_error(e),
            ChatError::Ledger(e) => ledger_error(e),
        };
        Failure(api)
    }
}

impl From<StoreError> for Failure {
    fn from(err: StoreError) -> Self {
        Failure(store_error(err))
    }
}

impl From<LedgerError> for Failure {
    fn from(err: LedgerError) -> Self {
        Failure(ledger_error(err))
    }
}

/// Provider failures surface as gateway-side errors. Timeout gets its own
/// status; an upstream credential rejection is an operator problem and maps
/// to 500, never 401.
fn provider_error(err: ProviderError) -> ApiError {
    match err {
        ProviderError::Timeout(m) => ApiError::LlmTimeout(format!("LLM request timed out: {m}")),
        ProviderError::Unauthorized(_) => {
            ApiError::Llm("LLM provider authentication failed - check credentials".to_string())
        }
        other => ApiError::Llm(other.to_string()),
    }
}

fn store_error(err: StoreError) -> ApiError {
    match err {
        StoreError::NotFound { .. } => ApiError::NotFound(err.to_string()),
        other => ApiError::Internal(other.to_string()),
    }
}

fn ledger_error(err: LedgerError) -> ApiError {
    match err {
        LedgerError::InsufficientTokens { .. } => ApiError::InsufficientTokens(err.to_string()),
        LedgerError::UserNotFound(id) => ApiError::NotFound(format!("User {id} not found")),
        other => ApiError::Internal(other.to_string()),
    }
}
