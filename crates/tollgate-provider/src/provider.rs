use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tollgate_core::types::{AgentConfig, Role};

use crate::stream::StreamEvent;

/// A single message in the conversation sent upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Request to an upstream provider. `messages` is the full ordered context;
/// position 0 may carry the system role. `config` is already validated —
/// adapters translate the fields their protocol honors and ignore the rest.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub config: AgentConfig,
}

/// Token usage reported by the provider for one completion. `(0, 0)` means
/// the upstream never reported usage; callers estimate from text length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }

    pub fn is_unreported(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

/// Non-streaming completion result.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: String,
    pub usage: Usage,
}

/// Common capability over heterogeneous chat providers.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provider tag used by the registry and in logs.
    fn name(&self) -> &str;

    /// Send a request and wait for the full response.
    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError>;

    /// Stream response events through a channel. The final event is always
    /// `Final` carrying usage (zeroes when the upstream reported none).
    /// Default: falls back to `complete`, emitting one chunk then `Final`.
    async fn stream_complete(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let completion = self.complete(req).await?;
        let _ = tx
            .send(StreamEvent::Chunk {
                text: completion.content,
            })
            .await;
        let _ = tx
            .send(StreamEvent::Final {
                prompt_tokens: completion.usage.prompt_tokens,
                completion_tokens: completion.usage.completion_tokens,
            })
            .await;
        Ok(())
    }
}

/// The closed set every upstream outcome is normalized into.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("provider timed out: {0}")]
    Timeout(String),

    /// The provider rejected our credentials. This is operator
    /// misconfiguration — never surfaced to the API caller as a 401.
    #[error("provider rejected credentials: {0}")]
    Unauthorized(String),

    #[error("provider rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("upstream server error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Map a non-success upstream status into the taxonomy. Shared by all
/// adapters; `retry_after` is the parsed Retry-After header in seconds.
pub(crate) fn status_error(status: u16, retry_after: Option<u64>, body: String) -> ProviderError {
    match status {
        401 | 403 => ProviderError::Unauthorized(truncate(body)),
        429 => ProviderError::RateLimited {
            retry_after_ms: retry_after.map(|s| s * 1000).unwrap_or(5000),
        },
        500..=599 => ProviderError::Upstream {
            status,
            message: truncate(body),
        },
        _ => ProviderError::Protocol(format!("unexpected status {status}: {}", truncate(body))),
    }
}

pub(crate) fn retry_after_secs(resp: &reqwest::Response) -> Option<u64> {
    resp.headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn truncate(mut body: String) -> String {
    if body.len() > 200 {
        body.truncate(200);
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn default_stream_falls_back_to_complete() {
        struct Fixed;

        #[async_trait]
        impl Provider for Fixed {
            fn name(&self) -> &str {
                "fixed"
            }
            async fn complete(
                &self,
                _req: &CompletionRequest,
            ) -> Result<Completion, ProviderError> {
                Ok(Completion {
                    content: "hello".to_string(),
                    usage: Usage {
                        prompt_tokens: 3,
                        completion_tokens: 2,
                    },
                })
            }
        }

        let (tx, mut rx) = mpsc::channel(8);
        let req = CompletionRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::new(Role::User, "hi")],
            config: AgentConfig::default(),
        };
        Fixed.stream_complete(&req, tx).await.unwrap();

        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Chunk { text }) if text == "hello"
        ));
        assert!(matches!(
            rx.recv().await,
            Some(StreamEvent::Final { prompt_tokens: 3, completion_tokens: 2 })
        ));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn status_errors_normalize() {
        assert!(matches!(
            status_error(401, None, "bad key".into()),
            ProviderError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(429, Some(2), String::new()),
            ProviderError::RateLimited {
                retry_after_ms: 2000
            }
        ));
        assert!(matches!(
            status_error(429, None, String::new()),
            ProviderError::RateLimited {
                retry_after_ms: 5000
            }
        ));
        assert!(matches!(
            status_error(503, None, "overloaded".into()),
            ProviderError::Upstream { status: 503, .. }
        ));
        assert!(matches!(
            status_error(400, None, "bad request".into()),
            ProviderError::Protocol(_)
        ));
    }

    #[test]
    fn usage_unreported_detection() {
        assert!(Usage::default().is_unreported());
        assert!(!Usage {
            prompt_tokens: 1,
            completion_tokens: 0
        }
        .is_unreported());
    }
}
