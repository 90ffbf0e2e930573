use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tollgate_core::types::Role;
use tracing::{debug, warn};

use crate::provider::{
    retry_after_secs, status_error, ChatMessage, Completion, CompletionRequest, Provider,
    ProviderError, Usage,
};
use crate::stream::StreamEvent;

const API_VERSION: &str = "2023-06-01";

/// The messages API requires max_tokens; applied when the caller sets none.
pub(crate) const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String, base_url: String, timeout: std::time::Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .expect("reqwest client"),
            api_key,
            base_url,
        }
    }

    fn url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn send_request(
        &self,
        body: &serde_json::Value,
    ) -> Result<reqwest::Response, ProviderError> {
        let resp = self
            .client
            .post(self.url())
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "Anthropic API error");
            return Err(status_error(status, retry_after, text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = build_request_body(req, false);

        debug!(model = %req.model, "sending request to Anthropic");

        let resp = self.send_request(&body).await?;
        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        Ok(parse_response(api_resp))
    }

    async fn stream_complete(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);

        debug!(model = %req.model, "sending streaming request to Anthropic");

        let resp = self.send_request(&body).await?;
        crate::anthropic_stream::process_stream(resp, tx).await;
        Ok(())
    }
}

/// Anthropic takes the system prompt as a dedicated field, not a message.
/// Returns (system, remaining messages).
pub(crate) fn split_system(messages: &[ChatMessage]) -> (Option<&str>, &[ChatMessage]) {
    match messages.first() {
        Some(first) if first.role == Role::System => {
            (Some(first.content.as_str()), &messages[1..])
        }
        _ => (None, messages),
    }
}

pub(crate) fn build_request_body(req: &CompletionRequest, stream: bool) -> serde_json::Value {
    let (system, rest) = split_system(&req.messages);

    let messages: Vec<serde_json::Value> = rest
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
        "max_tokens": req.config.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": stream,
    });
    if let Some(system) = system {
        body["system"] = serde_json::json!(system);
    }
    if let Some(t) = req.config.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(p) = req.config.top_p {
        body["top_p"] = serde_json::json!(p);
    }
    if let Some(ref stop) = req.config.stop_sequences {
        body["stop_sequences"] = serde_json::json!(stop);
    }
    // presence/frequency penalties have no Anthropic equivalent; dropped.
    body
}

fn parse_response(resp: ApiResponse) -> Completion {
    let content = resp
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(text),
            ContentBlock::Unknown => None,
        })
        .collect::<Vec<_>>()
        .join("");

    Completion {
        content,
        usage: Usage {
            prompt_tokens: resp.usage.input_tokens,
            completion_tokens: resp.usage.output_tokens,
        },
    }
}

// Anthropic API response types (deserialization only)

#[derive(Deserialize)]
struct ApiResponse {
    content: Vec<ContentBlock>,
    usage: ApiUsage,
}

#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Unknown,
}

#[derive(Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_core::types::AgentConfig;

    fn request(messages: Vec<ChatMessage>, config: AgentConfig) -> CompletionRequest {
        CompletionRequest {
            model: "claude-3-5-sonnet-20241022".to_string(),
            messages,
            config,
        }
    }

    #[test]
    fn system_is_extracted_to_its_own_field() {
        let body = build_request_body(
            &request(
                vec![
                    ChatMessage::new(Role::System, "You are terse."),
                    ChatMessage::new(Role::User, "hi"),
                ],
                AgentConfig::default(),
            ),
            false,
        );

        assert_eq!(body["system"], "You are terse.");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn max_tokens_defaults_when_unset() {
        let body = build_request_body(
            &request(
                vec![ChatMessage::new(Role::User, "hi")],
                AgentConfig::default(),
            ),
            false,
        );
        assert_eq!(body["max_tokens"], DEFAULT_MAX_TOKENS);
        assert!(body.get("system").is_none());

        let body = build_request_body(
            &request(
                vec![ChatMessage::new(Role::User, "hi")],
                AgentConfig {
                    max_tokens: Some(512),
                    ..AgentConfig::default()
                },
            ),
            true,
        );
        assert_eq!(body["max_tokens"], 512);
        assert_eq!(body["stream"], true);
    }

    #[test]
    fn penalties_are_dropped_stops_are_mapped() {
        let body = build_request_body(
            &request(
                vec![ChatMessage::new(Role::User, "hi")],
                AgentConfig {
                    presence_penalty: Some(1.0),
                    frequency_penalty: Some(-1.0),
                    stop_sequences: Some(vec!["STOP".to_string()]),
                    ..AgentConfig::default()
                },
            ),
            false,
        );
        assert!(body.get("presence_penalty").is_none());
        assert!(body.get("frequency_penalty").is_none());
        assert_eq!(body["stop_sequences"][0], "STOP");
    }

    #[test]
    fn response_text_blocks_concatenate() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "content": [
                    {"type": "text", "text": "Hel"},
                    {"type": "tool_use", "id": "t1", "name": "x", "input": {}},
                    {"type": "text", "text": "lo"}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 7}
            }"#,
        )
        .unwrap();
        let completion = parse_response(resp);
        assert_eq!(completion.content, "Hello");
        assert_eq!(completion.usage.prompt_tokens, 12);
        assert_eq!(completion.usage.completion_tokens, 7);
    }
}
