use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient tokens: balance={balance}, required={required}")]
    InsufficientTokens { balance: i64, required: i64 },

    #[error("user not found: {0}")]
    UserNotFound(i64),

    #[error(transparent)]
    Store(#[from] tollgate_store::StoreError),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, LedgerError>;
