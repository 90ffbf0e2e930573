use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tollgate_core::events::{DomainEvent, EventBus};
use tollgate_store::types::AuditEntry;
use tollgate_store::Db;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{LedgerError, Result};
use crate::ops;
use crate::types::{TokenBalance, TokenStats, TokenTransaction, TxReason};

/// High-level ledger API. Each mutating call runs in its own transaction;
/// the message pipeline instead uses [`Ledger::debit_in_tx`] so the debit
/// commits together with the turn it pays for.
pub struct Ledger {
    db: Arc<Db>,
    events: EventBus,
}

impl Ledger {
    pub fn new(db: Arc<Db>, events: EventBus) -> Self {
        Self { db, events }
    }

    /// Admission check: does the balance cover the estimate? Creates the
    /// zero row for first-time users. Emits `balance_exhausted` when short.
    pub fn check_balance(&self, user_id: i64, estimated: i64) -> Result<bool> {
        let balance = self.db.with_tx(|tx| ops::get_or_create(tx, user_id))?;
        let sufficient = balance.balance >= estimated;
        if !sufficient {
            warn!(
                user_id,
                balance = balance.balance,
                required = estimated,
                "balance check failed"
            );
            self.events.emit(&DomainEvent::BalanceExhausted {
                user_id,
                required: estimated,
                balance: balance.balance,
                reason: "check_failed".to_string(),
                at: Utc::now(),
            });
        }
        Ok(sufficient)
    }

    pub fn balance(&self, user_id: i64) -> Result<TokenBalance> {
        self.db.with_tx(|tx| ops::get_or_create(tx, user_id))
    }

    /// Balance row without creating one — admin endpoints treat a missing
    /// row as an unknown user.
    pub fn balance_if_exists(&self, user_id: i64) -> Result<Option<TokenBalance>> {
        self.db.with_conn(|conn| ops::get(conn, user_id))
    }

    pub fn stats(&self, user_id: i64) -> Result<TokenStats> {
        self.db.with_tx(|tx| {
            let balance = ops::get_or_create(tx, user_id)?;
            let total_used = ops::total_used(tx, user_id)?;
            Ok(TokenStats {
                balance: balance.balance,
                total_used,
                limit: balance.limit,
            })
        })
    }

    /// Debit in a standalone transaction, with events.
    pub fn debit(
        &self,
        user_id: i64,
        amount: i64,
        dialog_id: Uuid,
        message_id: Uuid,
    ) -> Result<(TokenBalance, TokenTransaction)> {
        let result = self
            .db
            .with_tx(|tx| ops::debit(tx, user_id, amount, dialog_id, message_id));
        self.finish_debit(user_id, amount, dialog_id, message_id, result)
    }

    /// Debit inside the caller's transaction. The caller must invoke
    /// [`Ledger::finish_debit`] after its commit so events still fire.
    pub fn debit_in_tx(
        &self,
        conn: &Connection,
        user_id: i64,
        amount: i64,
        dialog_id: Uuid,
        message_id: Uuid,
    ) -> Result<(TokenBalance, TokenTransaction)> {
        ops::debit(conn, user_id, amount, dialog_id, message_id)
    }

    /// Emit the events a debit produces: `balance_exhausted` on refusal,
    /// `tokens_deducted` (plus `balance_exhausted` if the result went
    /// negative under a racing admin deduct) on success.
    pub fn finish_debit(
        &self,
        user_id: i64,
        amount: i64,
        dialog_id: Uuid,
        message_id: Uuid,
        result: Result<(TokenBalance, TokenTransaction)>,
    ) -> Result<(TokenBalance, TokenTransaction)> {
        match &result {
            Ok((balance, txn)) => {
                self.events.emit(&DomainEvent::TokensDeducted {
                    user_id,
                    amount,
                    new_balance: balance.balance,
                    dialog_id: Some(dialog_id),
                    message_id: Some(message_id),
                    at: Utc::now(),
                });
                if balance.balance < 0 {
                    self.events.emit(&DomainEvent::BalanceExhausted {
                        user_id,
                        required: amount,
                        balance: balance.balance,
                        reason: TxReason::LlmUsage.as_str().to_string(),
                        at: Utc::now(),
                    });
                }
                info!(
                    user_id,
                    amount,
                    new_balance = balance.balance,
                    transaction = txn.id,
                    "tokens deducted"
                );
            }
            Err(LedgerError::InsufficientTokens { balance, required }) => {
                self.events.emit(&DomainEvent::BalanceExhausted {
                    user_id,
                    required: *required,
                    balance: *balance,
                    reason: TxReason::LlmUsage.as_str().to_string(),
                    at: Utc::now(),
                });
            }
            Err(_) => {}
        }
        result
    }

    /// Administrative top-up (positive) or deduct (negative). Writes the
    /// transaction, the balance change, and an audit row atomically; emits
    /// an admin-action event.
    pub fn credit(
        &self,
        user_id: i64,
        amount: i64,
        admin_user_id: i64,
    ) -> Result<(TokenBalance, TokenTransaction)> {
        if self.balance_if_exists(user_id)?.is_none() {
            return Err(LedgerError::UserNotFound(user_id));
        }
        let (balance, txn) = self.db.with_tx(|tx| {
            let out = ops::credit(tx, user_id, amount, admin_user_id)?;
            tollgate_store::audit::append(
                tx,
                &AuditEntry {
                    user_id: Some(admin_user_id),
                    action: if amount >= 0 { "top_up" } else { "deduct" }.to_string(),
                    resource_type: "user".to_string(),
                    resource_id: Some(user_id.to_string()),
                    details: Some(serde_json::json!({
                        "amount": amount,
                        "new_balance": out.0.balance,
                    })),
                },
            )?;
            Ok::<_, LedgerError>(out)
        })?;

        self.events.emit(&DomainEvent::AdminAction {
            admin_user_id,
            target_user_id: user_id,
            action: if amount >= 0 { "top_up" } else { "deduct" }.to_string(),
            details: serde_json::json!({"amount": amount, "new_balance": balance.balance}),
            at: Utc::now(),
        });
        if balance.balance < 0 {
            self.events.emit(&DomainEvent::BalanceExhausted {
                user_id,
                required: amount.abs(),
                balance: balance.balance,
                reason: txn.reason.as_str().to_string(),
                at: Utc::now(),
            });
        }
        info!(
            admin_user_id,
            user_id,
            amount,
            new_balance = balance.balance,
            "admin balance adjustment"
        );
        Ok((balance, txn))
    }

    /// Seed a balance row so admin operations recognise the user. Used when
    /// crediting an account that has never called the API.
    pub fn ensure_account(&self, user_id: i64) -> Result<TokenBalance> {
        self.balance(user_id)
    }

    pub fn set_limit(
        &self,
        user_id: i64,
        limit: Option<i64>,
        admin_user_id: i64,
    ) -> Result<TokenBalance> {
        let balance = self.db.with_tx(|tx| {
            let balance = ops::set_limit(tx, user_id, limit)?;
            tollgate_store::audit::append(
                tx,
                &AuditEntry {
                    user_id: Some(admin_user_id),
                    action: "set_limit".to_string(),
                    resource_type: "user".to_string(),
                    resource_id: Some(user_id.to_string()),
                    details: Some(serde_json::json!({"limit": limit})),
                },
            )?;
            Ok::<_, LedgerError>(balance)
        })?;

        self.events.emit(&DomainEvent::AdminAction {
            admin_user_id,
            target_user_id: user_id,
            action: "set_limit".to_string(),
            details: serde_json::json!({"limit": limit}),
            at: Utc::now(),
        });
        Ok(balance)
    }

    pub fn total_used(&self, user_id: i64) -> Result<i64> {
        self.db.with_conn(|conn| ops::total_used(conn, user_id))
    }

    pub fn history(
        &self,
        user_id: i64,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<TokenTransaction>> {
        self.db
            .with_conn(|conn| ops::history(conn, user_id, skip, limit))
    }

    pub fn list_balances(&self, skip: usize, limit: usize) -> Result<Vec<TokenBalance>> {
        self.db
            .with_conn(|conn| ops::list_balances(conn, skip, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ledger() -> (Ledger, Arc<Db>, Arc<Mutex<Vec<String>>>) {
        let db = Arc::new(Db::open_in_memory().unwrap());
        let events = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = seen.clone();
            events.subscribe(move |event| {
                let tag = serde_json::to_value(event).unwrap()["event"]
                    .as_str()
                    .unwrap()
                    .to_string();
                seen.lock().unwrap().push(tag);
            });
        }
        (Ledger::new(db.clone(), events), db, seen)
    }

    fn conservation_holds(db: &Db, user_id: i64) {
        db.with_conn(|conn| -> Result<()> {
            let balance: i64 = conn.query_row(
                "SELECT balance FROM token_balances WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            let sum: i64 = conn.query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM token_transactions WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            assert_eq!(balance, sum, "balance must equal the transaction sum");
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn credit_then_debit_conserves() {
        let (ledger, db, _) = ledger();
        ledger.ensure_account(100001).unwrap();
        ledger.credit(100001, 1000, 1).unwrap();

        let (balance, txn) = ledger
            .debit(100001, 150, Uuid::new_v4(), Uuid::new_v4())
            .unwrap();
        assert_eq!(balance.balance, 850);
        assert_eq!(txn.amount, -150);
        assert_eq!(txn.reason, TxReason::LlmUsage);
        assert_eq!(ledger.total_used(100001).unwrap(), 150);
        conservation_holds(&db, 100001);
    }

    #[test]
    fn debit_refuses_oversell() {
        let (ledger, db, events) = ledger();
        ledger.ensure_account(5).unwrap();
        ledger.credit(5, 100, 1).unwrap();

        let err = ledger
            .debit(5, 101, Uuid::new_v4(), Uuid::new_v4())
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientTokens { .. }));
        assert_eq!(ledger.balance(5).unwrap().balance, 100);
        conservation_holds(&db, 5);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "balance_exhausted"));
    }

    #[test]
    fn check_balance_creates_row_and_emits_on_shortfall() {
        let (ledger, _, events) = ledger();
        assert!(!ledger.check_balance(7, 25).unwrap());
        assert_eq!(ledger.balance(7).unwrap().balance, 0);
        assert_eq!(*events.lock().unwrap(), vec!["balance_exhausted".to_string()]);

        ledger.credit(7, 30, 1).unwrap();
        assert!(ledger.check_balance(7, 25).unwrap());
    }

    #[test]
    fn same_message_cannot_be_charged_twice() {
        let (ledger, _, _) = ledger();
        ledger.ensure_account(9).unwrap();
        ledger.credit(9, 1000, 1).unwrap();

        let dialog_id = Uuid::new_v4();
        let message_id = Uuid::new_v4();
        ledger.debit(9, 100, dialog_id, message_id).unwrap();
        let err = ledger.debit(9, 100, dialog_id, message_id).unwrap_err();
        assert!(matches!(err, LedgerError::Database(_)));
        // the failed attempt must not have moved the balance
        assert_eq!(ledger.balance(9).unwrap().balance, 900);
    }

    #[test]
    fn admin_deduct_can_go_negative() {
        let (ledger, db, events) = ledger();
        ledger.ensure_account(3).unwrap();
        ledger.credit(3, 50, 1).unwrap();
        let (balance, txn) = ledger.credit(3, -80, 1).unwrap();
        assert_eq!(balance.balance, -30);
        assert_eq!(txn.reason, TxReason::AdminDeduct);
        conservation_holds(&db, 3);
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e == "balance_exhausted"));
    }

    #[test]
    fn credit_unknown_user_is_not_found() {
        let (ledger, _, _) = ledger();
        let err = ledger.credit(404, 100, 1).unwrap_err();
        assert!(matches!(err, LedgerError::UserNotFound(404)));
    }

    #[test]
    fn set_limit_round_trips_and_audits() {
        let (ledger, db, _) = ledger();
        ledger.ensure_account(4).unwrap();
        let balance = ledger.set_limit(4, Some(10_000), 1).unwrap();
        assert_eq!(balance.limit, Some(10_000));
        let balance = ledger.set_limit(4, None, 1).unwrap();
        assert_eq!(balance.limit, None);

        db.with_conn(|conn| -> Result<()> {
            let audits: i64 = conn.query_row(
                "SELECT COUNT(*) FROM audit_logs WHERE action = 'set_limit'",
                [],
                |row| row.get(0),
            )?;
            assert_eq!(audits, 2);
            Ok(())
        })
        .unwrap();

        assert!(matches!(
            ledger.set_limit(999, Some(1), 1).unwrap_err(),
            LedgerError::UserNotFound(999)
        ));
    }

    #[test]
    fn history_is_descending() {
        let (ledger, _, _) = ledger();
        ledger.ensure_account(2).unwrap();
        ledger.credit(2, 100, 1).unwrap();
        ledger.credit(2, 200, 1).unwrap();
        ledger.debit(2, 50, Uuid::new_v4(), Uuid::new_v4()).unwrap();

        let history = ledger.history(2, 0, 10).unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].amount, -50);
        assert_eq!(history[2].amount, 100);

        let page = ledger.history(2, 1, 1).unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].amount, 200);
    }

    #[test]
    fn stats_combine_balance_and_usage() {
        let (ledger, _, _) = ledger();
        ledger.ensure_account(8).unwrap();
        ledger.credit(8, 1000, 1).unwrap();
        ledger.debit(8, 150, Uuid::new_v4(), Uuid::new_v4()).unwrap();
        ledger.set_limit(8, Some(5000), 1).unwrap();

        let stats = ledger.stats(8).unwrap();
        assert_eq!(stats.balance, 850);
        assert_eq!(stats.total_used, 150);
        assert_eq!(stats.limit, Some(5000));
    }
}
