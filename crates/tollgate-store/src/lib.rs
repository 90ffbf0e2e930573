//! Persistent state for the gateway: dialogs, messages, the model catalog,
//! balances, the transaction log, and audit entries — one SQLite database
//! behind a single [`Db`] handle.
//!
//! Row-level operations take `&Connection` so callers can compose several of
//! them inside one transaction ([`Db::with_tx`]); that is how the message
//! pipeline keeps "persist turn + debit balance" atomic.

pub mod audit;
pub mod db;
pub mod dialogs;
pub mod error;
pub mod messages;
pub mod models;
pub mod types;

pub use db::Db;
pub use error::{Result, StoreError};
