//! Minimal SSE line assembly shared by the streaming adapters.

/// Accumulates raw response bytes and yields complete lines.
///
/// Lines keep no trailing `\n`/`\r`. Whatever remains after the stream closes
/// is surfaced by [`LineBuffer::take_trailing`].
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    buffer: String,
}

impl LineBuffer {
    pub(crate) fn push(&mut self, fragment: &str) {
        self.buffer.push_str(fragment);
    }

    pub(crate) fn next_line(&mut self) -> Option<String> {
        let pos = self.buffer.find('\n')?;
        let line = self.buffer[..pos].trim_end_matches('\r').to_string();
        self.buffer.drain(..=pos);
        Some(line)
    }

    pub(crate) fn take_trailing(&mut self) -> Option<String> {
        let trailing = self.buffer.trim();
        if trailing.is_empty() {
            None
        } else {
            let line = trailing.to_string();
            self.buffer.clear();
            Some(line)
        }
    }
}

/// Strips the `data:` prefix of an SSE frame line, if present.
pub(crate) fn data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Strips the `event:` prefix of a named SSE event line, if present.
pub(crate) fn event_name(line: &str) -> Option<&str> {
    line.strip_prefix("event:").map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_split_on_newline_and_strip_carriage_returns() {
        let mut buffer = LineBuffer::default();
        buffer.push("data: a\r\nda");
        assert_eq!(buffer.next_line().as_deref(), Some("data: a"));
        assert_eq!(buffer.next_line(), None);
        buffer.push("ta: b\n\n");
        assert_eq!(buffer.next_line().as_deref(), Some("data: b"));
        assert_eq!(buffer.next_line().as_deref(), Some(""));
    }

    #[test]
    fn trailing_partial_line_is_recoverable() {
        let mut buffer = LineBuffer::default();
        buffer.push("data: tail");
        assert_eq!(buffer.next_line(), None);
        assert_eq!(buffer.take_trailing().as_deref(), Some("data: tail"));
        assert_eq!(buffer.take_trailing(), None);
    }

    #[test]
    fn frame_prefixes_parse() {
        assert_eq!(data_payload("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(data_payload(": comment"), None);
        assert_eq!(event_name("event: message_stop"), Some("message_stop"));
    }
}
