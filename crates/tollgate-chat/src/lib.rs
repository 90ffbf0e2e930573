//! The message orchestrator: one inbound user turn in, one paid assistant
//! turn out. Owns the atomicity contract — the user message, the assistant
//! message, and the balance debit commit together or not at all.

pub mod error;
pub mod pipeline;

pub use error::{ChatError, Result};
pub use pipeline::{Chat, SendOutcome, SendRequest, TurnEvent};
