use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_core::events::{DomainEvent, EventBus};
use tollgate_core::types::{effective_config, AgentConfig, Role};
use tollgate_ledger::{Ledger, LedgerError, TokenBalance, TokenTransaction};
use tollgate_provider::registry::estimate_tokens;
use tollgate_provider::{
    ChatMessage, CompletionRequest, ModelRegistry, Provider, ProviderError, StreamEvent, Usage,
};
use tollgate_store::types::{Dialog, StoredMessage};
use tollgate_store::{dialogs, messages, Db, StoreError};

use crate::error::{ChatError, Result};

/// Messages of history included in the provider context.
const HISTORY_LIMIT: usize = 100;

/// Flat admission overhead on top of the `chars / 4` input estimate. Covers
/// context and a short reply; the post-completion debit is authoritative.
const ADMISSION_OVERHEAD: i64 = 100;

/// One inbound user turn.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub dialog_id: Uuid,
    pub user_id: i64,
    pub is_admin: bool,
    pub content: String,
    pub config: Option<AgentConfig>,
    pub agent_type: Option<String>,
}

/// Result of a completed (non-streaming) turn.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub message: StoredMessage,
    pub usage: Usage,
}

/// Events yielded to the SSE writer while a turn streams.
#[derive(Debug)]
pub enum TurnEvent {
    Chunk {
        text: String,
    },
    /// Terminal event of a successful stream: the persisted assistant
    /// message and what it cost.
    Final {
        message_id: Uuid,
        prompt_tokens: u32,
        completion_tokens: u32,
    },
    /// Terminal event of a failed stream.
    Error {
        message: String,
    },
}

/// The message orchestrator. Drives one turn through ownership check,
/// admission, context assembly, the provider, and the atomic
/// persist-and-debit commit.
pub struct Chat {
    db: Arc<Db>,
    ledger: Arc<Ledger>,
    registry: Arc<ModelRegistry>,
    providers: HashMap<String, Arc<dyn Provider>>,
    events: EventBus,
}

impl Chat {
    pub fn new(
        db: Arc<Db>,
        ledger: Arc<Ledger>,
        registry: Arc<ModelRegistry>,
        providers: HashMap<String, Arc<dyn Provider>>,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            ledger,
            registry,
            providers,
            events,
        }
    }

    /// Send a turn and wait for the full assistant response.
    pub async fn send(&self, req: SendRequest) -> Result<SendOutcome> {
        let started = Instant::now();
        let turn = self.prepare(&req)?;

        let completion = turn.provider.complete(&turn.request).await?;

        self.finish_turn(
            &turn,
            req.user_id,
            completion.content,
            completion.usage,
            started,
        )
    }

    /// Send a turn and stream the assistant response. Pre-provider failures
    /// (ownership, admission, validation) and upstream failures that happen
    /// before the first event return `Err` so the handler can answer with a
    /// proper status; once events flow, failures become a terminal
    /// [`TurnEvent::Error`].
    pub async fn send_stream(
        self: &Arc<Self>,
        req: SendRequest,
    ) -> Result<mpsc::Receiver<TurnEvent>> {
        let started = Instant::now();
        let turn = self.prepare(&req)?;

        let (provider_tx, mut provider_rx) = mpsc::channel::<StreamEvent>(64);
        let provider = turn.provider.clone();
        let request = turn.request.clone();
        let handle =
            tokio::spawn(async move { provider.stream_complete(&request, provider_tx).await });

        // Wait for the first event. A channel that closes without yielding
        // anything means the adapter failed before the stream began.
        let first = match provider_rx.recv().await {
            Some(event) => event,
            None => {
                return Err(match handle.await {
                    Ok(Err(e)) => ChatError::Provider(e),
                    Ok(Ok(())) => ChatError::Provider(ProviderError::Protocol(
                        "stream ended without events".to_string(),
                    )),
                    Err(join) => ChatError::Provider(ProviderError::Transport(join.to_string())),
                });
            }
        };

        let (out_tx, out_rx) = mpsc::channel::<TurnEvent>(64);
        let chat = Arc::clone(self);
        let user_id = req.user_id;
        tokio::spawn(async move {
            chat.drive_stream(turn, user_id, first, provider_rx, out_tx, started)
                .await;
        });

        Ok(out_rx)
    }

    /// Dialog history with the ownership check applied, oldest first.
    pub fn history(
        &self,
        dialog_id: Uuid,
        user_id: i64,
        is_admin: bool,
        skip: usize,
        limit: usize,
    ) -> Result<Vec<StoredMessage>> {
        self.resolve_dialog(dialog_id, user_id, is_admin)?;
        Ok(self
            .db
            .with_conn(|conn| messages::list_by_dialog(conn, dialog_id, skip, limit))?)
    }

    // ── pipeline stages ─────────────────────────────────────────────────────

    /// Steps shared by both entry points: resolve + authorize the dialog,
    /// admit against the balance, build the provider request, emit
    /// `message_sent`.
    fn prepare(&self, req: &SendRequest) -> Result<PreparedTurn> {
        let dialog = self.resolve_dialog(req.dialog_id, req.user_id, req.is_admin)?;

        let estimate = estimate_tokens(&req.content) as i64 + ADMISSION_OVERHEAD;
        if !self.ledger.check_balance(req.user_id, estimate)? {
            return Err(ChatError::InsufficientTokens(format!(
                "Insufficient tokens. Estimated cost: {estimate}"
            )));
        }

        let model = self.registry.validate(&dialog.model_name)?;
        let config = effective_config(
            req.config.as_ref(),
            req.agent_type.as_deref(),
            dialog.agent_config.as_ref(),
            Some(model.context_window),
        )?;

        let provider = self
            .providers
            .get(&model.provider)
            .cloned()
            .ok_or_else(|| ChatError::Unconfigured(model.provider.clone()))?;

        let context = self.build_context(&dialog, &req.content)?;
        let prompt_chars = context
            .iter()
            .map(|m| m.content.len())
            .sum::<usize>()
            + context.len().saturating_sub(1);

        let user_message_id = Uuid::new_v4();
        self.events.emit(&DomainEvent::MessageSent {
            dialog_id: dialog.id,
            user_id: req.user_id,
            message_id: user_message_id,
            content_length: req.content.len(),
            at: Utc::now(),
        });

        Ok(PreparedTurn {
            request: CompletionRequest {
                model: dialog.model_name.clone(),
                messages: context,
                config,
            },
            dialog,
            provider,
            user_message_id,
            content: req.content.clone(),
            prompt_chars,
        })
    }

    fn resolve_dialog(&self, dialog_id: Uuid, user_id: i64, is_admin: bool) -> Result<Dialog> {
        let dialog = self
            .db
            .with_conn(|conn| dialogs::get(conn, dialog_id))
            .map_err(|e| match e {
                StoreError::NotFound { .. } => ChatError::NotFound(dialog_id),
                other => ChatError::Store(other),
            })?;

        if !is_admin && dialog.user_id != user_id {
            return Err(ChatError::Forbidden(dialog_id));
        }
        Ok(dialog)
    }

    /// System prompt (if any), then stored history, then the new user turn.
    /// The turn is not yet persisted — it joins the context in memory and is
    /// written in the same transaction as the assistant reply.
    fn build_context(&self, dialog: &Dialog, content: &str) -> Result<Vec<ChatMessage>> {
        let mut context = Vec::new();
        if let Some(ref system) = dialog.system_prompt {
            context.push(ChatMessage::new(Role::System, system.clone()));
        }
        let history = self
            .db
            .with_conn(|conn| messages::list_by_dialog(conn, dialog.id, 0, HISTORY_LIMIT))?;
        for message in history {
            context.push(ChatMessage::new(message.role, message.content));
        }
        context.push(ChatMessage::new(Role::User, content));
        Ok(context)
    }

    /// Forward provider events to the caller, then persist and settle when
    /// the stream completes. A dropped receiver (client disconnect) stops
    /// forwarding, which drops the provider channel and cancels the upstream
    /// call; nothing is persisted.
    async fn drive_stream(
        self: Arc<Self>,
        turn: PreparedTurn,
        user_id: i64,
        first: StreamEvent,
        mut provider_rx: mpsc::Receiver<StreamEvent>,
        out_tx: mpsc::Sender<TurnEvent>,
        started: Instant,
    ) {
        let mut text = String::new();
        let mut event = Some(first);

        let usage = loop {
            let current = match event.take() {
                Some(e) => e,
                None => match provider_rx.recv().await {
                    Some(e) => e,
                    None => {
                        // adapter went away without a terminal event
                        let _ = out_tx
                            .send(TurnEvent::Error {
                                message: "stream ended unexpectedly".to_string(),
                            })
                            .await;
                        return;
                    }
                },
            };

            match current {
                StreamEvent::Chunk { text: chunk } => {
                    text.push_str(&chunk);
                    if out_tx.send(TurnEvent::Chunk { text: chunk }).await.is_err() {
                        // client disconnected; abandon the turn unpaid
                        warn!(dialog = %turn.dialog.id, "stream receiver dropped, cancelling turn");
                        return;
                    }
                }
                StreamEvent::Final {
                    prompt_tokens,
                    completion_tokens,
                } => {
                    break Usage {
                        prompt_tokens,
                        completion_tokens,
                    };
                }
                StreamEvent::Error { message } => {
                    warn!(dialog = %turn.dialog.id, error = %message, "provider stream failed");
                    let _ = out_tx.send(TurnEvent::Error { message }).await;
                    return;
                }
            }
        };

        match self.finish_turn(&turn, user_id, text, usage, started) {
            Ok(outcome) => {
                let _ = out_tx
                    .send(TurnEvent::Final {
                        message_id: outcome.message.id,
                        prompt_tokens: outcome.usage.prompt_tokens,
                        completion_tokens: outcome.usage.completion_tokens,
                    })
                    .await;
            }
            Err(e) => {
                let _ = out_tx
                    .send(TurnEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Persist both turn halves and debit the balance in one transaction,
    /// then emit the settlement events.
    fn finish_turn(
        &self,
        turn: &PreparedTurn,
        user_id: i64,
        response_text: String,
        mut usage: Usage,
        started: Instant,
    ) -> Result<SendOutcome> {
        // Some OpenAI-protocol servers never report usage; estimate at four
        // characters per token, at least one each.
        if usage.is_unreported() {
            usage.prompt_tokens = std::cmp::max(1, turn.prompt_chars / 4) as u32;
            usage.completion_tokens = std::cmp::max(1, response_text.len() / 4) as u32;
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "estimated token usage from text length"
            );
        }

        let total = usage.total() as i64;
        let assistant_id = Uuid::new_v4();
        let dialog_id = turn.dialog.id;

        type Settled = (StoredMessage, Option<(TokenBalance, TokenTransaction)>);
        let result = self.db.with_tx(|tx| -> Result<Settled> {
            messages::insert(
                tx,
                turn.user_message_id,
                dialog_id,
                Role::User,
                &turn.content,
                None,
                None,
            )?;
            let assistant = messages::insert(
                tx,
                assistant_id,
                dialog_id,
                Role::Assistant,
                &response_text,
                Some(usage.prompt_tokens),
                Some(usage.completion_tokens),
            )?;
            let settled = if total > 0 {
                Some(self.ledger.debit_in_tx(tx, user_id, total, dialog_id, assistant.id)?)
            } else {
                None
            };
            dialogs::touch(tx, dialog_id)?;
            Ok((assistant, settled))
        });

        let (assistant, settled) = match result {
            Ok(out) => out,
            Err(ChatError::Ledger(err @ LedgerError::InsufficientTokens { .. })) => {
                let message = err.to_string();
                let _ = self
                    .ledger
                    .finish_debit(user_id, total, dialog_id, assistant_id, Err(err));
                return Err(ChatError::InsufficientTokens(message));
            }
            Err(other) => return Err(other),
        };

        if let Some(settled) = settled {
            let _ = self
                .ledger
                .finish_debit(user_id, total, dialog_id, assistant.id, Ok(settled));
        }

        let latency_ms = started.elapsed().as_millis() as u64;
        self.events.emit(&DomainEvent::LlmResponseReceived {
            dialog_id,
            user_id,
            message_id: assistant.id,
            model: turn.dialog.model_name.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms,
            at: Utc::now(),
        });

        info!(
            dialog = %dialog_id,
            user_id,
            tokens = total,
            latency_ms,
            "turn completed"
        );

        Ok(SendOutcome {
            message: assistant,
            usage,
        })
    }
}

/// Everything `prepare` resolves before the provider is driven.
struct PreparedTurn {
    dialog: Dialog,
    provider: Arc<dyn Provider>,
    request: CompletionRequest,
    user_message_id: Uuid,
    content: String,
    prompt_chars: usize,
}
