use std::sync::Mutex;

use rusqlite::{Connection, Transaction};
use tracing::info;

use crate::error::Result;

/// Shared database handle. SQLite allows one writer at a time; the mutex
/// keeps connection use serialized and transactions are the atomicity
/// boundary for everything that mutates balances or messages.
pub struct Db {
    conn: Mutex<Connection>,
}

impl Db {
    /// Open (or create) the database file, apply pragmas, and ensure the
    /// schema and the seeded model catalog exist.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // journal_mode reports the resulting mode as a row
        let _: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        seed_models(&conn)?;
        info!(path, "database ready");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory database with the full schema. Used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        init_db(&conn)?;
        seed_models(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run `f` with the connection. For single reads and writes.
    pub fn with_conn<T, E>(
        &self,
        f: impl FnOnce(&Connection) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Run `f` inside a transaction. Commit on `Ok`; on `Err` the
    /// transaction rolls back when dropped uncommitted. Generic over the
    /// caller's error type.
    pub fn with_tx<T, E>(
        &self,
        f: impl FnOnce(&Transaction) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<rusqlite::Error>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction().map_err(E::from)?;
        let out = f(&tx)?;
        tx.commit().map_err(E::from)?;
        Ok(out)
    }
}

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS dialogs (
            id             TEXT PRIMARY KEY,
            user_id        INTEGER NOT NULL,
            title          TEXT,
            system_prompt  TEXT,
            model_name     TEXT NOT NULL,
            agent_config   TEXT,  -- JSON
            created_at     TEXT NOT NULL,
            updated_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_dialogs_user
            ON dialogs(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id                 TEXT PRIMARY KEY,
            dialog_id          TEXT NOT NULL REFERENCES dialogs(id) ON DELETE CASCADE,
            role               TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
            content            TEXT NOT NULL,
            prompt_tokens      INTEGER,
            completion_tokens  INTEGER,
            created_at         TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_dialog
            ON messages(dialog_id, created_at);

        CREATE TABLE IF NOT EXISTS token_balances (
            user_id      INTEGER PRIMARY KEY,
            balance      INTEGER NOT NULL DEFAULT 0,
            token_limit  INTEGER,  -- NULL = unlimited
            updated_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS token_transactions (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER NOT NULL,
            amount         INTEGER NOT NULL,  -- negative = debit
            reason         TEXT NOT NULL,
            dialog_id      TEXT REFERENCES dialogs(id) ON DELETE SET NULL,
            message_id     TEXT REFERENCES messages(id) ON DELETE SET NULL,
            admin_user_id  INTEGER,
            created_at     TEXT NOT NULL,
            UNIQUE(message_id, reason)
        );
        CREATE INDEX IF NOT EXISTS idx_transactions_user
            ON token_transactions(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS models (
            name              TEXT PRIMARY KEY,
            provider          TEXT NOT NULL,
            prompt_price      REAL NOT NULL,   -- per 1k prompt tokens
            completion_price  REAL NOT NULL,   -- per 1k completion tokens
            context_window    INTEGER NOT NULL,
            enabled           INTEGER NOT NULL DEFAULT 1,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS audit_logs (
            id             INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id        INTEGER,
            action         TEXT NOT NULL,
            resource_type  TEXT NOT NULL,
            resource_id    TEXT,
            details        TEXT,  -- JSON
            created_at     TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_user
            ON audit_logs(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS system_configs (
            key         TEXT PRIMARY KEY,
            value       TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Seed the model catalog on first run. Existing rows win — operators tune
/// pricing and the enabled flag out-of-band.
pub fn seed_models(conn: &Connection) -> Result<()> {
    let seed: &[(&str, &str, f64, f64, u32)] = &[
        ("gpt-3.5-turbo", "openai", 0.0005, 0.0015, 16_385),
        ("gpt-4o", "openai", 0.0025, 0.01, 128_000),
        ("gpt-4o-mini", "openai", 0.000_15, 0.0006, 128_000),
        ("claude-3-5-sonnet-20241022", "anthropic", 0.003, 0.015, 200_000),
        ("claude-3-5-haiku-20241022", "anthropic", 0.0008, 0.004, 200_000),
        ("GigaChat", "gigachat", 0.001, 0.001, 32_768),
        ("GigaChat-Pro", "gigachat", 0.0015, 0.0015, 32_768),
    ];

    let now = crate::types::now_str();
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO models
         (name, provider, prompt_price, completion_price, context_window, enabled,
          created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?6)",
    )?;
    for (name, provider, prompt, completion, window) in seed {
        stmt.execute(rusqlite::params![name, provider, prompt, completion, window, now])?;
    }
    Ok(())
}
