use thiserror::Error;
use uuid::Uuid;

use tollgate_ledger::LedgerError;
use tollgate_provider::ProviderError;
use tollgate_store::StoreError;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Dialog {0} not found")]
    NotFound(Uuid),

    #[error("Access denied to dialog {0}")]
    Forbidden(Uuid),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InsufficientTokens(String),

    #[error("LLM provider not configured: {0}")]
    Unconfigured(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<tollgate_core::ApiError> for ChatError {
    fn from(err: tollgate_core::ApiError) -> Self {
        ChatError::Validation(err.to_string())
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::Store(StoreError::Database(err))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
