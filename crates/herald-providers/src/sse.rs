//! Minimal SSE line parsing shared by the streaming completion path.

/// Parse a single SSE line: `event: <type>` or `data: <json>`.
pub(crate) fn parse_sse_line(line: &str) -> Option<SseParsed> {
    if let Some(event_type) = line.strip_prefix("event: ") {
        Some(SseParsed::Event(event_type.to_string()))
    } else {
        line.strip_prefix("data: ")
            .map(|data| SseParsed::Data(data.to_string()))
    }
}

#[derive(Debug)]
pub(crate) enum SseParsed {
    Event(String),
    Data(String),
}
