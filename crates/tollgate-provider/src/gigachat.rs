use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tollgate_core::types::AgentConfig;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::provider::{
    retry_after_secs, status_error, Completion, CompletionRequest, Provider, ProviderError, Usage,
};
use crate::stream::{drain_lines, parse_sse_line, SseParsed, StreamEvent};

const AUTH_URL: &str = "https://ngw.devices.sberbank.ru:9443/api/v2/oauth";
const API_URL: &str = "https://gigachat.devices.sberbank.ru/api/v1";

/// GigaChat requires max_tokens; applied when the caller sets none.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Refresh the OAuth token when it expires within this margin.
const REFRESH_MARGIN_SECS: i64 = 60;

struct CachedToken {
    access_token: String,
    /// Unix seconds.
    expires_at: i64,
}

/// Adapter for Sber's GigaChat. Auth is OAuth2 client-credentials: a static
/// authorization key buys short-lived access tokens from the OAuth endpoint.
/// The data plane speaks the OpenAI chat shape over SSE with a `[DONE]`
/// terminator.
pub struct GigaChatProvider {
    client: reqwest::Client,
    auth_key: String,
    scope: String,
    token: Mutex<Option<CachedToken>>,
}

impl GigaChatProvider {
    /// `verify_tls` is off by default upstream of us — GigaChat serves
    /// self-signed certificates.
    pub fn new(
        auth_key: String,
        scope: String,
        verify_tls: bool,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .danger_accept_invalid_certs(!verify_tls)
                .build()
                .expect("reqwest client"),
            auth_key,
            scope,
            token: Mutex::new(None),
        }
    }

    /// Get a valid access token, fetching a fresh one when the cached token
    /// is missing, stale, or `force` is set (data-plane 401).
    async fn access_token(&self, force: bool) -> Result<String, ProviderError> {
        let mut guard = self.token.lock().await;

        if !force {
            if let Some(token) = guard.as_ref() {
                if token_is_fresh(token.expires_at, unix_now()) {
                    return Ok(token.access_token.clone());
                }
            }
        }

        debug!(scope = %self.scope, "fetching GigaChat access token");
        let resp = self
            .client
            .post(AUTH_URL)
            .header("Authorization", format!("Basic {}", self.auth_key))
            .header("RqUID", Uuid::new_v4().to_string())
            .header("Content-Type", "application/x-www-form-urlencoded")
            .form(&[("scope", self.scope.as_str())])
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, "GigaChat auth failed");
            return Err(match status {
                429 => status_error(status, None, text),
                500..=599 => status_error(status, None, text),
                _ => ProviderError::Unauthorized(format!("GigaChat auth failed ({status})")),
            });
        }

        let auth: AuthResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        let token = CachedToken {
            access_token: auth.access_token.clone(),
            // the endpoint reports milliseconds
            expires_at: auth.expires_at / 1000,
        };
        *guard = Some(token);
        Ok(auth.access_token)
    }

    /// POST the chat body, refreshing the token exactly once on a 401.
    async fn send_chat(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let token = self.access_token(false).await?;
        let resp = self.post_chat(body, &token).await?;
        if resp.status().as_u16() != 401 {
            return Ok(resp);
        }

        warn!("GigaChat data plane returned 401, refreshing token once");
        let token = self.access_token(true).await?;
        self.post_chat(body, &token).await
    }

    async fn post_chat(
        &self,
        body: &serde_json::Value,
        token: &str,
    ) -> Result<reqwest::Response, ProviderError> {
        Ok(self
            .client
            .post(format!("{API_URL}/chat/completions"))
            .bearer_auth(token)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?)
    }
}

#[async_trait]
impl Provider for GigaChatProvider {
    fn name(&self) -> &str {
        "gigachat"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = build_request_body(req, false);

        debug!(model = %req.model, "sending request to GigaChat");

        let resp = self.send_chat(&body).await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "GigaChat API error");
            return Err(status_error(status, retry_after, text));
        }

        let api_resp: crate::openai::ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        crate::openai::parse_response(api_resp)
    }

    async fn stream_complete(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);

        debug!(model = %req.model, "sending streaming request to GigaChat");

        let resp = self.send_chat(&body).await?;
        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "GigaChat streaming API error");
            return Err(status_error(status, retry_after, text));
        }

        process_stream(resp, tx).await;
        Ok(())
    }
}

pub(crate) fn token_is_fresh(expires_at: i64, now: i64) -> bool {
    expires_at > now + REFRESH_MARGIN_SECS
}

fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn build_request_body(req: &CompletionRequest, stream: bool) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = req
        .messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "role": m.role,
                "content": m.content,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "model": req.model,
        "messages": messages,
        "max_tokens": req.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "stream": stream,
    });
    apply_config(&mut body, &req.config);
    body
}

/// GigaChat honors temperature and top_p; the remaining knobs have no
/// equivalent and are dropped after validation.
fn apply_config(body: &mut serde_json::Value, config: &AgentConfig) {
    if let Some(t) = config.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(p) = config.top_p {
        body["top_p"] = serde_json::json!(p);
    }
}

/// OpenAI-shaped SSE terminated by `[DONE]`; non-data lines are ignored.
async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut usage = Usage::default();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    'read: while let Some(chunk) = byte_stream.next().await {
        let chunk = match chunk {
            Ok(c) => c,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error {
                        message: e.to_string(),
                    })
                    .await;
                return;
            }
        };

        let text = match std::str::from_utf8(&chunk) {
            Ok(t) => t,
            Err(_) => continue,
        };
        line_buf.push_str(text);

        for line in drain_lines(&mut line_buf) {
            if line.is_empty() {
                continue;
            }
            if let Some(SseParsed::Data(data)) = parse_sse_line(&line) {
                if data.trim() == "[DONE]" {
                    break 'read;
                }
                if let Some(event) = crate::openai::handle_stream_data(&data, &mut usage) {
                    if tx.send(event).await.is_err() {
                        return; // receiver dropped
                    }
                }
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Final {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
        .await;
}

#[derive(Deserialize)]
struct AuthResponse {
    access_token: String,
    /// Unix milliseconds.
    expires_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use tollgate_core::types::Role;

    #[test]
    fn token_freshness_window() {
        let now = 1_700_000_000;
        // plenty of time left
        assert!(token_is_fresh(now + 3600, now));
        // inside the 60s margin: treat as stale
        assert!(!token_is_fresh(now + 30, now));
        assert!(!token_is_fresh(now + 60, now));
        // already expired
        assert!(!token_is_fresh(now - 1, now));
    }

    #[test]
    fn auth_response_expiry_is_milliseconds() {
        let auth: AuthResponse = serde_json::from_str(
            r#"{"access_token": "tok", "expires_at": 1700000000000}"#,
        )
        .unwrap();
        assert_eq!(auth.expires_at / 1000, 1_700_000_000);
    }

    #[test]
    fn body_defaults_max_tokens_and_maps_config() {
        let req = CompletionRequest {
            model: "GigaChat".to_string(),
            messages: vec![
                ChatMessage::new(Role::System, "be brief"),
                ChatMessage::new(Role::User, "hi"),
            ],
            config: AgentConfig {
                temperature: Some(0.4),
                presence_penalty: Some(1.0),
                ..AgentConfig::default()
            },
        };
        let body = build_request_body(&req, true);

        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert_eq!(body["temperature"], 0.4);
        assert_eq!(body["stream"], true);
        // system stays inline — GigaChat takes the OpenAI message shape
        assert_eq!(body["messages"][0]["role"], "system");
        assert!(body.get("presence_penalty").is_none());
    }
}
