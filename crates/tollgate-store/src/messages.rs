use std::str::FromStr;

use rusqlite::Connection;
use tollgate_core::types::Role;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{now_str, parse_ts, StoredMessage};

const MESSAGE_COLUMNS: &str =
    "id, dialog_id, role, content, prompt_tokens, completion_tokens, created_at";

pub(crate) fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let id: String = row.get(0)?;
    let dialog_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let created: String = row.get(6)?;
    Ok(StoredMessage {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        dialog_id: Uuid::parse_str(&dialog_id).unwrap_or_default(),
        role: Role::from_str(&role).unwrap_or(Role::User),
        content: row.get(3)?,
        prompt_tokens: row.get(4)?,
        completion_tokens: row.get(5)?,
        created_at: parse_ts(&created),
    })
}

/// Append a message row. `id` is caller-allocated so the pipeline can emit
/// events referencing the message before the row is committed.
pub fn insert(
    conn: &Connection,
    id: Uuid,
    dialog_id: Uuid,
    role: Role,
    content: &str,
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
) -> Result<StoredMessage> {
    let now = now_str();
    conn.execute(
        "INSERT INTO messages
         (id, dialog_id, role, content, prompt_tokens, completion_tokens, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            id.to_string(),
            dialog_id.to_string(),
            role.as_str(),
            content,
            prompt_tokens,
            completion_tokens,
            now,
        ],
    )?;
    Ok(StoredMessage {
        id,
        dialog_id,
        role,
        content: content.to_string(),
        prompt_tokens,
        completion_tokens,
        created_at: parse_ts(&now),
    })
}

pub fn insert_user(conn: &Connection, dialog_id: Uuid, content: &str) -> Result<StoredMessage> {
    insert(conn, Uuid::new_v4(), dialog_id, Role::User, content, None, None)
}

pub fn insert_assistant(
    conn: &Connection,
    dialog_id: Uuid,
    content: &str,
    prompt_tokens: u32,
    completion_tokens: u32,
) -> Result<StoredMessage> {
    insert(
        conn,
        Uuid::new_v4(),
        dialog_id,
        Role::Assistant,
        content,
        Some(prompt_tokens),
        Some(completion_tokens),
    )
}

/// Dialog history, oldest first. `rowid` breaks ties between rows written in
/// the same transaction.
pub fn list_by_dialog(
    conn: &Connection,
    dialog_id: Uuid,
    skip: usize,
    limit: usize,
) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE dialog_id = ?1
         ORDER BY created_at ASC, rowid ASC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![dialog_id.to_string(), limit as i64, skip as i64],
        row_to_message,
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// The complete message history of one dialog, oldest first. Used by
/// export.
pub fn all_by_dialog(conn: &Connection, dialog_id: Uuid) -> Result<Vec<StoredMessage>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM messages
         WHERE dialog_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt.query_map([dialog_id.to_string()], row_to_message)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn count_by_dialog(conn: &Connection, dialog_id: Uuid) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE dialog_id = ?1",
        [dialog_id.to_string()],
        |row| row.get(0),
    )?)
}
