use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

/// Domain events emitted on the hot path. Delivery is synchronous and
/// in-process; subscribers are observers, not participants — a slow or
/// panicking handler must never fail the request that emitted the event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    MessageSent {
        dialog_id: Uuid,
        user_id: i64,
        message_id: Uuid,
        content_length: usize,
        at: DateTime<Utc>,
    },
    LlmResponseReceived {
        dialog_id: Uuid,
        user_id: i64,
        message_id: Uuid,
        model: String,
        prompt_tokens: u32,
        completion_tokens: u32,
        latency_ms: u64,
        at: DateTime<Utc>,
    },
    TokensDeducted {
        user_id: i64,
        amount: i64,
        new_balance: i64,
        dialog_id: Option<Uuid>,
        message_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
    BalanceExhausted {
        user_id: i64,
        required: i64,
        balance: i64,
        reason: String,
        at: DateTime<Utc>,
    },
    AdminAction {
        admin_user_id: i64,
        target_user_id: i64,
        action: String,
        details: serde_json::Value,
        at: DateTime<Utc>,
    },
}

type Handler = Arc<dyn Fn(&DomainEvent) + Send + Sync>;

/// Synchronous handler-list event bus.
#[derive(Clone, Default)]
pub struct EventBus {
    handlers: Arc<RwLock<Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F)
    where
        F: Fn(&DomainEvent) + Send + Sync + 'static,
    {
        self.handlers.write().unwrap().push(Arc::new(handler));
    }

    /// Deliver to every subscriber. Panics are caught and logged so a faulty
    /// handler cannot break the emitting request.
    pub fn emit(&self, event: &DomainEvent) {
        let handlers = self.handlers.read().unwrap().clone();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                error!(?event, "event handler panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_event() -> DomainEvent {
        DomainEvent::BalanceExhausted {
            user_id: 7,
            required: 100,
            balance: 3,
            reason: "check_failed".to_string(),
            at: Utc::now(),
        }
    }

    #[test]
    fn all_subscribers_receive_events() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(&sample_event());
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(|_| panic!("broken subscriber"));
        {
            let count = count.clone();
            bus.subscribe(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }
        bus.emit(&sample_event());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn events_serialize_with_snake_case_tags() {
        let json = serde_json::to_value(sample_event()).expect("serialize");
        assert_eq!(json["event"], "balance_exhausted");
        assert_eq!(json["user_id"], 7);
    }
}
