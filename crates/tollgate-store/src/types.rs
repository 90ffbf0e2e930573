use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tollgate_core::types::{AgentConfig, Role};
use uuid::Uuid;

/// A persistent conversation thread owned by one user.
#[derive(Debug, Clone, Serialize)]
pub struct Dialog {
    pub id: Uuid,
    pub user_id: i64,
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    pub model_name: String,
    pub agent_config: Option<AgentConfig>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One turn half inside a dialog. Token counts are set on assistant rows
/// only.
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: Uuid,
    pub dialog_id: Uuid,
    pub role: Role,
    pub content: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// Catalog entry for one upstream model.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub provider: String,
    /// Price per 1k prompt tokens.
    pub prompt_price: f64,
    /// Price per 1k completion tokens.
    pub completion_price: f64,
    pub context_window: u32,
    pub enabled: bool,
}

/// A single audit-trail row for admin mutations.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub user_id: Option<i64>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
}

/// A stored audit row as read back for the admin browse endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Timestamps are stored as fixed-width RFC3339 so TEXT comparison matches
/// chronological order.
pub fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}
