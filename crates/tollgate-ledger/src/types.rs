use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Current balance row for one user. `limit` is an administrative cap;
/// `None` means unlimited.
#[derive(Debug, Clone, Serialize)]
pub struct TokenBalance {
    pub user_id: i64,
    pub balance: i64,
    pub limit: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

/// Why a transaction exists. Debits are always `LlmUsage`; administrative
/// adjustments are credits with a sign-dependent reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxReason {
    LlmUsage,
    AdminTopUp,
    AdminDeduct,
}

impl TxReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxReason::LlmUsage => "llm_usage",
            TxReason::AdminTopUp => "admin_top_up",
            TxReason::AdminDeduct => "admin_deduct",
        }
    }
}

impl std::str::FromStr for TxReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "llm_usage" => Ok(TxReason::LlmUsage),
            "admin_top_up" => Ok(TxReason::AdminTopUp),
            "admin_deduct" => Ok(TxReason::AdminDeduct),
            other => Err(format!("unknown transaction reason: {other}")),
        }
    }
}

/// One row of the append-only transaction log. Negative amount = debit.
#[derive(Debug, Clone, Serialize)]
pub struct TokenTransaction {
    pub id: i64,
    pub user_id: i64,
    pub amount: i64,
    pub reason: TxReason,
    pub dialog_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
    pub admin_user_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Balance summary returned by `GET /users/me/tokens`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    pub balance: i64,
    pub total_used: i64,
    pub limit: Option<i64>,
}
