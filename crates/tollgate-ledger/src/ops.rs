//! Row-level ledger operations over `&Connection`. Callers compose these
//! inside a transaction; [`crate::Ledger`] wraps them for the common case.

use std::str::FromStr;

use rusqlite::Connection;
use tollgate_store::types::now_str;
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::types::{TokenBalance, TokenTransaction, TxReason};

const TX_COLUMNS: &str =
    "id, user_id, amount, reason, dialog_id, message_id, admin_user_id, created_at";

fn row_to_balance(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenBalance> {
    let updated: String = row.get(3)?;
    Ok(TokenBalance {
        user_id: row.get(0)?,
        balance: row.get(1)?,
        limit: row.get(2)?,
        updated_at: chrono::DateTime::parse_from_rfc3339(&updated)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_default(),
    })
}

fn row_to_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<TokenTransaction> {
    let reason: String = row.get(3)?;
    let dialog_id: Option<String> = row.get(4)?;
    let message_id: Option<String> = row.get(5)?;
    let created: String = row.get(7)?;
    Ok(TokenTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        amount: row.get(2)?,
        reason: TxReason::from_str(&reason).unwrap_or(TxReason::LlmUsage),
        dialog_id: dialog_id.and_then(|s| Uuid::parse_str(&s).ok()),
        message_id: message_id.and_then(|s| Uuid::parse_str(&s).ok()),
        admin_user_id: row.get(6)?,
        created_at: chrono::DateTime::parse_from_rfc3339(&created)
            .map(|t| t.with_timezone(&chrono::Utc))
            .unwrap_or_default(),
    })
}

pub fn get(conn: &Connection, user_id: i64) -> Result<Option<TokenBalance>> {
    let row = conn
        .query_row(
            "SELECT user_id, balance, token_limit, updated_at
             FROM token_balances WHERE user_id = ?1",
            [user_id],
            row_to_balance,
        )
        .map(Some)
        .or_else(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => Ok(None),
            other => Err(other),
        })?;
    Ok(row)
}

/// Read the balance row, creating a zero row on first contact.
pub fn get_or_create(conn: &Connection, user_id: i64) -> Result<TokenBalance> {
    if let Some(balance) = get(conn, user_id)? {
        return Ok(balance);
    }
    conn.execute(
        "INSERT INTO token_balances (user_id, balance, updated_at) VALUES (?1, 0, ?2)",
        rusqlite::params![user_id, now_str()],
    )?;
    Ok(get(conn, user_id)?.expect("row just inserted"))
}

fn apply_delta(conn: &Connection, user_id: i64, delta: i64) -> Result<TokenBalance> {
    get_or_create(conn, user_id)?;
    conn.execute(
        "UPDATE token_balances SET balance = balance + ?1, updated_at = ?2 WHERE user_id = ?3",
        rusqlite::params![delta, now_str(), user_id],
    )?;
    Ok(get(conn, user_id)?.expect("row exists"))
}

fn insert_transaction(
    conn: &Connection,
    user_id: i64,
    amount: i64,
    reason: TxReason,
    dialog_id: Option<Uuid>,
    message_id: Option<Uuid>,
    admin_user_id: Option<i64>,
) -> Result<TokenTransaction> {
    conn.execute(
        "INSERT INTO token_transactions
         (user_id, amount, reason, dialog_id, message_id, admin_user_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            user_id,
            amount,
            reason.as_str(),
            dialog_id.map(|d| d.to_string()),
            message_id.map(|m| m.to_string()),
            admin_user_id,
            now_str(),
        ],
    )?;
    let id = conn.last_insert_rowid();
    let txn = conn.query_row(
        &format!("SELECT {TX_COLUMNS} FROM token_transactions WHERE id = ?1"),
        [id],
        row_to_transaction,
    )?;
    Ok(txn)
}

/// Charge `amount` (> 0) for LLM usage. Refuses when the balance does not
/// cover the amount; the read and the write happen under the caller's
/// transaction, so concurrent debits cannot oversell.
pub fn debit(
    conn: &Connection,
    user_id: i64,
    amount: i64,
    dialog_id: Uuid,
    message_id: Uuid,
) -> Result<(TokenBalance, TokenTransaction)> {
    debug_assert!(amount > 0);
    let current = get_or_create(conn, user_id)?;
    if current.balance < amount {
        return Err(LedgerError::InsufficientTokens {
            balance: current.balance,
            required: amount,
        });
    }

    let balance = apply_delta(conn, user_id, -amount)?;
    let txn = insert_transaction(
        conn,
        user_id,
        -amount,
        TxReason::LlmUsage,
        Some(dialog_id),
        Some(message_id),
        None,
    )?;
    Ok((balance, txn))
}

/// Administrative adjustment. Positive amount is a top-up, negative a
/// deduct; the balance may go negative.
pub fn credit(
    conn: &Connection,
    user_id: i64,
    amount: i64,
    admin_user_id: i64,
) -> Result<(TokenBalance, TokenTransaction)> {
    let reason = if amount >= 0 {
        TxReason::AdminTopUp
    } else {
        TxReason::AdminDeduct
    };
    let balance = apply_delta(conn, user_id, amount)?;
    let txn = insert_transaction(conn, user_id, amount, reason, None, None, Some(admin_user_id))?;
    Ok((balance, txn))
}

/// Set or clear the administrative limit. Errors when the user has no
/// balance row yet.
pub fn set_limit(conn: &Connection, user_id: i64, limit: Option<i64>) -> Result<TokenBalance> {
    let changed = conn.execute(
        "UPDATE token_balances SET token_limit = ?1, updated_at = ?2 WHERE user_id = ?3",
        rusqlite::params![limit, now_str(), user_id],
    )?;
    if changed == 0 {
        return Err(LedgerError::UserNotFound(user_id));
    }
    Ok(get(conn, user_id)?.expect("row exists"))
}

/// Lifetime consumption: the sum of |amount| over debits.
pub fn total_used(conn: &Connection, user_id: i64) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(-amount), 0) FROM token_transactions
         WHERE user_id = ?1 AND amount < 0",
        [user_id],
        |row| row.get(0),
    )?)
}

/// Transaction log, newest first.
pub fn history(
    conn: &Connection,
    user_id: i64,
    skip: usize,
    limit: usize,
) -> Result<Vec<TokenTransaction>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {TX_COLUMNS} FROM token_transactions
         WHERE user_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT ?2 OFFSET ?3"
    ))?;
    let rows = stmt.query_map(
        rusqlite::params![user_id, limit as i64, skip as i64],
        row_to_transaction,
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

/// All balance rows, for the admin user list.
pub fn list_balances(conn: &Connection, skip: usize, limit: usize) -> Result<Vec<TokenBalance>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, balance, token_limit, updated_at
         FROM token_balances ORDER BY user_id LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt.query_map(
        rusqlite::params![limit as i64, skip as i64],
        row_to_balance,
    )?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}
