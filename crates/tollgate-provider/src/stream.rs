/// Events emitted while a provider streams a completion.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Incremental text content from the model.
    Chunk { text: String },

    /// Stream completed. Always the last event on a successful stream;
    /// zeroes mean the upstream never reported usage.
    Final {
        prompt_tokens: u32,
        completion_tokens: u32,
    },

    /// The stream broke after it started. Terminal.
    Error { message: String },
}

/// Parse a single SSE line.
/// SSE format: `event: <type>\ndata: <json>\n\n`
pub fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub enum SseParsed {
    Event(String),
    Data(String),
}

/// Splits buffered bytes into complete lines, returning the trailing
/// incomplete remainder. SSE chunks can end mid-line; adapters carry the
/// remainder into the next read.
pub(crate) fn drain_lines(buf: &mut String) -> Vec<String> {
    let mut parts: Vec<&str> = buf.split('\n').collect();
    let remainder = parts.pop().unwrap_or("").to_string();
    let complete: Vec<String> = parts.iter().map(|s| s.trim().to_string()).collect();
    *buf = remainder;
    complete
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_event_and_data_lines() {
        assert!(matches!(
            parse_sse_line("event: message_start"),
            Some(SseParsed::Event(e)) if e == "message_start"
        ));
        assert!(matches!(
            parse_sse_line("data: {\"x\":1}"),
            Some(SseParsed::Data(d)) if d == "{\"x\":1}"
        ));
        assert!(parse_sse_line(": keep-alive comment").is_none());
    }

    #[test]
    fn drain_keeps_partial_line() {
        let mut buf = "data: a\ndata: b\ndata: partial".to_string();
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["data: a", "data: b"]);
        assert_eq!(buf, "data: partial");

        buf.push('\n');
        let lines = drain_lines(&mut buf);
        assert_eq!(lines, vec!["data: partial"]);
        assert_eq!(buf, "");
    }
}
