//! Anthropic's streaming API is a typed SSE feed: `message_start` carries
//! the prompt token count, `content_block_delta` events carry text, and
//! `message_delta` carries the final output token count.

use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::stream::{drain_lines, parse_sse_line, SseParsed, StreamEvent};

#[derive(Default)]
pub(crate) struct StreamState {
    pub(crate) prompt_tokens: u32,
    pub(crate) completion_tokens: u32,
}

/// Read the SSE body, emit chunk events, then one `Final` with the usage
/// accumulated from the typed events.
pub(crate) async fn process_stream(resp: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    use futures_util::StreamExt;

    let mut state = StreamState::default();
    let mut current_event = String::new();
    let mut line_buf = String::new();
    let mut byte_stream = resp.bytes_stream();

    while let Some(chunk) = byte_stream.next().await {
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
            match parse_sse_line(&line) {
                Some(SseParsed::Event(ev)) => current_event = ev,
                Some(SseParsed::Data(data)) => {
                    if let Some(event) = handle_data_block(&current_event, &data, &mut state) {
                        if tx.send(event).await.is_err() {
                            return; // receiver dropped
                        }
                    }
                }
                None => {}
            }
        }
    }

    let _ = tx
        .send(StreamEvent::Final {
            prompt_tokens: state.prompt_tokens,
            completion_tokens: state.completion_tokens,
        })
        .await;
}

/// Interpret one data block based on the preceding `event:` line.
pub(crate) fn handle_data_block(
    event_type: &str,
    data: &str,
    state: &mut StreamState,
) -> Option<StreamEvent> {
    match event_type {
        "message_start" => {
            if let Ok(msg) = serde_json::from_str::<MessageStart>(data) {
                state.prompt_tokens = msg.message.usage.input_tokens;
            }
            None
        }

        "content_block_delta" => {
            if let Ok(delta) = serde_json::from_str::<ContentBlockDelta>(data) {
                if delta.delta.delta_type == "text_delta" {
                    if let Some(text) = delta.delta.text {
                        debug!(len = text.len(), "anthropic stream text delta");
                        return Some(StreamEvent::Chunk { text });
                    }
                }
            }
            None
        }

        "message_delta" => {
            if let Ok(delta) = serde_json::from_str::<MessageDelta>(data) {
                state.completion_tokens = delta.usage.output_tokens;
            }
            None
        }

        "error" => {
            warn!(data, "anthropic stream error");
            Some(StreamEvent::Error {
                message: data.to_string(),
            })
        }

        // message_stop, content_block_start/stop, ping — nothing to do
        _ => None,
    }
}

// Anthropic SSE data types (deserialization only)

#[derive(Deserialize)]
struct MessageStart {
    message: MessageStartInner,
}

#[derive(Deserialize)]
struct MessageStartInner {
    usage: InputUsage,
}

#[derive(Deserialize)]
struct InputUsage {
    input_tokens: u32,
}

#[derive(Deserialize)]
struct ContentBlockDelta {
    delta: DeltaContent,
}

#[derive(Deserialize)]
struct DeltaContent {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
}

#[derive(Deserialize)]
struct MessageDelta {
    usage: OutputUsage,
}

#[derive(Deserialize)]
struct OutputUsage {
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_events_accumulate_usage() {
        let mut state = StreamState::default();

        let event = handle_data_block(
            "message_start",
            r#"{"message": {"model": "claude-3-5-sonnet-20241022", "usage": {"input_tokens": 25}}}"#,
            &mut state,
        );
        assert!(event.is_none());
        assert_eq!(state.prompt_tokens, 25);

        let event = handle_data_block(
            "content_block_delta",
            r#"{"delta": {"type": "text_delta", "text": "Hi"}}"#,
            &mut state,
        );
        assert!(matches!(event, Some(StreamEvent::Chunk { text }) if text == "Hi"));

        let event = handle_data_block(
            "message_delta",
            r#"{"delta": {"stop_reason": "end_turn"}, "usage": {"output_tokens": 9}}"#,
            &mut state,
        );
        assert!(event.is_none());
        assert_eq!(state.completion_tokens, 9);
    }

    #[test]
    fn non_text_deltas_are_ignored() {
        let mut state = StreamState::default();
        let event = handle_data_block(
            "content_block_delta",
            r#"{"delta": {"type": "input_json_delta", "partial_json": "{\"a\""}}"#,
            &mut state,
        );
        assert!(event.is_none());

        assert!(handle_data_block("message_stop", "{}", &mut state).is_none());
        assert!(handle_data_block("ping", "{}", &mut state).is_none());
    }

    #[test]
    fn error_events_surface() {
        let mut state = StreamState::default();
        let event = handle_data_block("error", r#"{"type":"overloaded_error"}"#, &mut state);
        assert!(matches!(event, Some(StreamEvent::Error { .. })));
    }
}
