//! Token accounting: the current balance per user plus an append-only
//! transaction log that must always agree with it. Every mutation commits
//! the balance update and the transaction row in one SQLite transaction, and
//! the `UNIQUE(message_id, reason)` constraint guarantees a completion is
//! never charged twice.

pub mod error;
pub mod ledger;
pub mod ops;
pub mod types;

pub use error::{LedgerError, Result};
pub use ledger::Ledger;
pub use types::{TokenBalance, TokenStats, TokenTransaction, TxReason};
