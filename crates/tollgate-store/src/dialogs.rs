use rusqlite::Connection;
use tollgate_core::types::AgentConfig;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{now_str, parse_ts, Dialog};

const DIALOG_COLUMNS: &str =
    "id, user_id, title, system_prompt, model_name, agent_config, created_at, updated_at";

/// Map a SELECT row (column order from DIALOG_COLUMNS) to a Dialog.
pub(crate) fn row_to_dialog(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dialog> {
    let id: String = row.get(0)?;
    let config_json: Option<String> = row.get(5)?;
    let created: String = row.get(6)?;
    let updated: String = row.get(7)?;
    Ok(Dialog {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        user_id: row.get(1)?,
        title: row.get(2)?,
        system_prompt: row.get(3)?,
        model_name: row.get(4)?,
        agent_config: config_json.and_then(|j| serde_json::from_str::<AgentConfig>(&j).ok()),
        created_at: parse_ts(&created),
        updated_at: parse_ts(&updated),
    })
}

pub struct NewDialog {
    pub user_id: i64,
    pub title: Option<String>,
    pub system_prompt: Option<String>,
    pub model_name: String,
    pub agent_config: Option<AgentConfig>,
}

pub fn insert(conn: &Connection, new: &NewDialog) -> Result<Dialog> {
    let id = Uuid::new_v4();
    let now = now_str();
    let config_json = new
        .agent_config
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    conn.execute(
        "INSERT INTO dialogs
         (id, user_id, title, system_prompt, model_name, agent_config, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        rusqlite::params![
            id.to_string(),
            new.user_id,
            new.title,
            new.system_prompt,
            new.model_name,
            config_json,
            now,
        ],
    )?;

    get(conn, id)
}

pub fn get(conn: &Connection, id: Uuid) -> Result<Dialog> {
    conn.query_row(
        &format!("SELECT {DIALOG_COLUMNS} FROM dialogs WHERE id = ?1"),
        [id.to_string()],
        row_to_dialog,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => crate::StoreError::not_found("dialog", id),
        other => other.into(),
    })
}

/// Newest first.
pub fn list_by_user(
    conn: &Connection,
    user_id: i64,
    skip: usize,
    limit: usize,
) -> Result<Vec<Dialog>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DIALOG_COLUMNS} FROM dialogs
         WHERE user_id = ?1
         ORDER BY created_at DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![user_id, limit as i64, skip as i64],
        row_to_dialog,
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// Every dialog a user owns, oldest first. Used by export.
pub fn all_by_user(conn: &Connection, user_id: i64) -> Result<Vec<Dialog>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {DIALOG_COLUMNS} FROM dialogs
         WHERE user_id = ?1
         ORDER BY created_at ASC"
    ))?;
    let rows = stmt.query_map([user_id], row_to_dialog)?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn count_by_user(conn: &Connection, user_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM dialogs WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?)
}

/// Most recent dialog creation for a user, if any.
pub fn last_activity(
    conn: &Connection,
    user_id: i64,
) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    let ts: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM dialogs WHERE user_id = ?1",
        [user_id],
        |row| row.get(0),
    )?;
    Ok(ts.map(|s| parse_ts(&s)))
}

pub fn touch(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE dialogs SET updated_at = ?1 WHERE id = ?2",
        rusqlite::params![now_str(), id.to_string()],
    )?;
    Ok(())
}

/// Delete a dialog. Messages cascade; transaction references go NULL.
pub fn delete(conn: &Connection, id: Uuid) -> Result<()> {
    let changed = conn.execute("DELETE FROM dialogs WHERE id = ?1", [id.to_string()])?;
    if changed == 0 {
        return Err(crate::StoreError::not_found("dialog", id));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Db;

    fn new_dialog(user_id: i64) -> NewDialog {
        NewDialog {
            user_id,
            title: Some("test".to_string()),
            system_prompt: None,
            model_name: "gpt-3.5-turbo".to_string(),
            agent_config: None,
        }
    }

    #[test]
    fn insert_and_get_round_trip() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            let dialog = insert(
                conn,
                &NewDialog {
                    agent_config: Some(AgentConfig {
                        temperature: Some(0.3),
                        ..AgentConfig::default()
                    }),
                    system_prompt: Some("be terse".to_string()),
                    ..new_dialog(42)
                },
            )?;
            let fetched = get(conn, dialog.id)?;
            assert_eq!(fetched.user_id, 42);
            assert_eq!(fetched.system_prompt.as_deref(), Some("be terse"));
            assert_eq!(
                fetched.agent_config.as_ref().and_then(|c| c.temperature),
                Some(0.3)
            );
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn get_missing_is_not_found() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            let err = get(conn, Uuid::new_v4()).unwrap_err();
            assert!(matches!(err, crate::StoreError::NotFound { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn list_is_scoped_to_user() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            insert(conn, &new_dialog(1))?;
            insert(conn, &new_dialog(1))?;
            insert(conn, &new_dialog(2))?;
            assert_eq!(list_by_user(conn, 1, 0, 10)?.len(), 2);
            assert_eq!(list_by_user(conn, 2, 0, 10)?.len(), 1);
            assert_eq!(count_by_user(conn, 1)?, 2);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn delete_cascades_messages_and_nulls_transactions() {
        let db = Db::open_in_memory().unwrap();
        db.with_conn(|conn| -> Result<()> {
            let dialog = insert(conn, &new_dialog(1))?;
            let msg = crate::messages::insert_assistant(conn, dialog.id, "hi", 10, 5)?;
            conn.execute(
                "INSERT INTO token_transactions
                 (user_id, amount, reason, dialog_id, message_id, created_at)
                 VALUES (1, -15, 'llm_usage', ?1, ?2, ?3)",
                rusqlite::params![dialog.id.to_string(), msg.id.to_string(), now_str()],
            )?;

            delete(conn, dialog.id)?;

            let messages: i64 =
                conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
            assert_eq!(messages, 0);

            let (count, message_id): (i64, Option<String>) = conn.query_row(
                "SELECT COUNT(*), MAX(message_id) FROM token_transactions",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            assert_eq!(count, 1);
            assert!(message_id.is_none());
            Ok(())
        })
        .unwrap();
    }
}
