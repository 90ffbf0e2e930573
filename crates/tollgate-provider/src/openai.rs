use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;
use tollgate_core::types::AgentConfig;
use tracing::{debug, warn};

use crate::provider::{
    retry_after_secs, status_error, Completion, CompletionRequest, Provider, ProviderError, Usage,
};
use crate::stream::{drain_lines, parse_sse_line, SseParsed, StreamEvent};

/// Adapter for OpenAI and any server speaking its chat-completions protocol.
/// Messages pass through verbatim, including a system entry at position 0.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiProvider {
    /// `base_url` should NOT include a trailing slash.
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
        format!("{}/v1/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, req: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = build_request_body(req, false);

        debug!(model = %req.model, "sending request to OpenAI");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI API error");
            return Err(status_error(status, retry_after, text));
        }

        let api_resp: ApiResponse = resp
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(e.to_string()))?;

        parse_response(api_resp)
    }

    async fn stream_complete(
        &self,
        req: &CompletionRequest,
        tx: mpsc::Sender<StreamEvent>,
    ) -> Result<(), ProviderError> {
        let body = build_request_body(req, true);

        debug!(model = %req.model, "sending streaming request to OpenAI");

        let resp = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let retry_after = retry_after_secs(&resp);
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "OpenAI streaming API error");
            return Err(status_error(status, retry_after, text));
        }

        process_stream(resp, tx).await;
        Ok(())
    }
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
        "stream": stream,
    });
    if stream {
        // ask for aggregate usage on the terminal chunk
        body["stream_options"] = serde_json::json!({"include_usage": true});
    }
    apply_config(&mut body, &req.config);
    body
}

/// Translate the validated config to OpenAI field names. Unset fields are
/// omitted entirely.
fn apply_config(body: &mut serde_json::Value, config: &AgentConfig) {
    if let Some(t) = config.temperature {
        body["temperature"] = serde_json::json!(t);
    }
    if let Some(m) = config.max_tokens {
        body["max_tokens"] = serde_json::json!(m);
    }
    if let Some(p) = config.top_p {
        body["top_p"] = serde_json::json!(p);
    }
    if let Some(p) = config.presence_penalty {
        body["presence_penalty"] = serde_json::json!(p);
    }
    if let Some(p) = config.frequency_penalty {
        body["frequency_penalty"] = serde_json::json!(p);
    }
    if let Some(ref stop) = config.stop_sequences {
        body["stop"] = serde_json::json!(stop);
    }
}

pub(crate) fn parse_response(resp: ApiResponse) -> Result<Completion, ProviderError> {
    let choice = resp
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::Protocol("response carried no choices".to_string()))?;

    Ok(Completion {
        content: choice.message.content.unwrap_or_default(),
        usage: resp
            .usage
            .map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            })
            .unwrap_or_default(),
    })
}

/// Read the SSE body and forward chunks. OpenAI sends JSON deltas on `data:`
/// lines and signals the end with a literal `[DONE]`.
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
                if let Some(event) = handle_stream_data(&data, &mut usage) {
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

/// Parse one `data:` payload. Text deltas become chunk events; usage is
/// captured when present (OpenAI sends it on the last chunk).
pub(crate) fn handle_stream_data(data: &str, usage: &mut Usage) -> Option<StreamEvent> {
    let chunk: StreamChunk = serde_json::from_str(data).ok()?;

    if let Some(u) = chunk.usage {
        usage.prompt_tokens = u.prompt_tokens;
        usage.completion_tokens = u.completion_tokens;
    }

    let content = chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content)?;
    if content.is_empty() {
        return None;
    }
    debug!(len = content.len(), "openai stream text delta");
    Some(StreamEvent::Chunk { text: content })
}

// OpenAI API response types

#[derive(Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) choices: Vec<Choice>,
    pub(crate) usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: ApiMessage,
}

#[derive(Deserialize)]
pub(crate) struct ApiMessage {
    pub(crate) content: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct ApiUsage {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

// Streaming chunk types

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChatMessage;
    use tollgate_core::types::Role;

    fn request(config: AgentConfig) -> CompletionRequest {
        CompletionRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                ChatMessage::new(Role::System, "You are terse."),
                ChatMessage::new(Role::User, "hi"),
            ],
            config,
        }
    }

    #[test]
    fn body_passes_system_through_and_maps_config() {
        let body = build_request_body(
            &request(AgentConfig {
                temperature: Some(0.2),
                max_tokens: Some(256),
                stop_sequences: Some(vec!["END".to_string()]),
                ..AgentConfig::default()
            }),
            false,
        );

        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["max_tokens"], 256);
        assert_eq!(body["stop"][0], "END");
        assert!(body.get("top_p").is_none());
        assert_eq!(body["stream"], false);
        assert!(body.get("stream_options").is_none());
    }

    #[test]
    fn streaming_body_requests_usage() {
        let body = build_request_body(&request(AgentConfig::default()), true);
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn parse_response_extracts_text_and_usage() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "choices": [{"message": {"role": "assistant", "content": "Hi"}}],
                "usage": {"prompt_tokens": 50, "completion_tokens": 100, "total_tokens": 150}
            }"#,
        )
        .unwrap();
        let completion = parse_response(resp).unwrap();
        assert_eq!(completion.content, "Hi");
        assert_eq!(completion.usage.prompt_tokens, 50);
        assert_eq!(completion.usage.completion_tokens, 100);
    }

    #[test]
    fn missing_usage_reports_zeroes() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"content": "ok"}}]}"#,
        )
        .unwrap();
        assert!(parse_response(resp).unwrap().usage.is_unreported());
    }

    #[test]
    fn empty_choices_is_protocol_error() {
        let resp: ApiResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            parse_response(resp),
            Err(ProviderError::Protocol(_))
        ));
    }

    #[test]
    fn stream_deltas_and_usage_chunk() {
        let mut usage = Usage::default();

        let event = handle_stream_data(
            r#"{"choices":[{"delta":{"content":"Hel"}}]}"#,
            &mut usage,
        );
        assert!(matches!(event, Some(StreamEvent::Chunk { text }) if text == "Hel"));

        // usage-only terminal chunk has an empty choices array
        let event = handle_stream_data(
            r#"{"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":5,"total_tokens":15}}"#,
            &mut usage,
        );
        assert!(event.is_none());
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);

        // malformed payloads are skipped quietly
        assert!(handle_stream_data("not-json", &mut usage).is_none());
    }
}
