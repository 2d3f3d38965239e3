//! Watch-stream framing: newline-delimited JSON watch events, rewritten
//! one frame at a time.

use bytes::{Buf, BytesMut};
use serde_json::Value;

use crate::rewriter::rewrite_value;
use crate::rules::RewriteRules;
use crate::{Action, RewriteError};

const EVENT_TYPES: &[&str] = &["ADDED", "MODIFIED", "DELETED", "BOOKMARK", "ERROR"];

/// Accumulates body chunks and yields complete newline-terminated frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Pops the next complete frame, newline excluded. Empty frames are
    /// swallowed.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        loop {
            let position = self.buffer.iter().position(|b| *b == b'\n')?;
            let frame = self.buffer.split_to(position + 1);
            let frame = &frame[..frame.len() - 1];
            if frame.iter().any(|b| !b.is_ascii_whitespace()) {
                return Some(frame.to_vec());
            }
        }
    }

    /// Whatever is left without a trailing newline (normally nothing; a
    /// truncated stream may leave a partial frame behind).
    pub fn remainder(&mut self) -> Option<Vec<u8>> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            self.buffer.advance(self.buffer.len());
            return None;
        }
        let rest = self.buffer.split_to(self.buffer.len());
        Some(rest.to_vec())
    }
}

/// Rewrites one watch event frame, returning the frame newline-terminated
/// and ready to forward. Unknown event types are errors; `ERROR` events
/// pass through untouched.
pub fn rewrite_watch_frame(
    rules: &RewriteRules,
    action: Action,
    frame: &[u8],
) -> Result<Vec<u8>, RewriteError> {
    let mut event: Value = serde_json::from_slice(frame)
        .map_err(|err| RewriteError::Malformed(format!("watch frame: {}", err)))?;
    let event_type = event
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    if !EVENT_TYPES.contains(&event_type.as_str()) {
        return Err(RewriteError::UnknownWatchEvent(event_type));
    }
    if event_type != "ERROR" {
        if let Some(object) = event.get_mut("object") {
            if object.is_object() {
                match rewrite_value(rules, action, object) {
                    Ok(_) => {}
                    Err(RewriteError::SkipItem) => {}
                    Err(err) => return Err(err),
                }
            }
        }
    }
    let mut bytes = serde_json::to_vec(&event)
        .map_err(|err| RewriteError::Malformed(err.to_string()))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// True for stream-end conditions that terminate a watch cleanly.
pub fn is_clean_stream_end(message: &str) -> bool {
    message.contains("unexpected EOF")
        || message.contains("unexpected end of file")
        || message.contains("connection reset by peer")
        || message.contains("broken pipe")
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::test_rules;
    use serde_json::json;

    #[test]
    fn decoder_yields_frames_across_chunks() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"{\"type\":\"ADD");
        assert!(decoder.next_frame().is_none());
        decoder.push(b"ED\"}\n{\"type\":\"DELETED\"}\n");
        assert_eq!(decoder.next_frame().unwrap(), b"{\"type\":\"ADDED\"}");
        assert_eq!(decoder.next_frame().unwrap(), b"{\"type\":\"DELETED\"}");
        assert!(decoder.next_frame().is_none());
        assert!(decoder.remainder().is_none());
    }

    #[test]
    fn frame_rewrite_restores_object() {
        let rules = test_rules();
        let frame = serde_json::to_vec(&json!({
            "type": "ADDED",
            "object": {
                "apiVersion": "prefixed.resources.group.io/v1",
                "kind": "PrefixedSomeResource",
                "metadata": {"name": "obj"}
            }
        }))
        .unwrap();
        let rewritten = rewrite_watch_frame(&rules, Action::Restore, &frame).unwrap();
        assert_eq!(*rewritten.last().unwrap(), b'\n');
        let event: Value = serde_json::from_slice(&rewritten[..rewritten.len() - 1]).unwrap();
        assert_eq!(event["type"], json!("ADDED"));
        assert_eq!(event["object"]["apiVersion"], json!("original.group.io/v1"));
        assert_eq!(event["object"]["kind"], json!("SomeResource"));
    }

    #[test]
    fn stream_rewrite_is_idempotent_across_runs() {
        let rules = test_rules();
        let stream = concat!(
            "{\"type\":\"ADDED\",\"object\":{\"apiVersion\":\"prefixed.resources.group.io/v1\",\"kind\":\"PrefixedSomeResource\",\"metadata\":{\"name\":\"a\"}}}\n",
            "{\"type\":\"BOOKMARK\",\"object\":{\"apiVersion\":\"prefixed.resources.group.io/v1\",\"kind\":\"PrefixedSomeResource\",\"metadata\":{\"resourceVersion\":\"12\"}}}\n",
        );
        let run = |input: &str| {
            let mut decoder = FrameDecoder::new();
            decoder.push(input.as_bytes());
            let mut out = Vec::new();
            while let Some(frame) = decoder.next_frame() {
                out.extend(rewrite_watch_frame(&rules, Action::Restore, &frame).unwrap());
            }
            out
        };
        let first = run(stream);
        let second = run(stream);
        assert_eq!(first, second);
    }

    #[test]
    fn unknown_event_type_is_an_error() {
        let rules = test_rules();
        let frame = br#"{"type":"PATCHED","object":{}}"#;
        let err = rewrite_watch_frame(&rules, Action::Restore, frame).unwrap_err();
        assert!(matches!(err, RewriteError::UnknownWatchEvent(t) if t == "PATCHED"));
    }

    #[test]
    fn error_events_pass_through() {
        let rules = test_rules();
        let frame = serde_json::to_vec(&json!({
            "type": "ERROR",
            "object": {"kind": "Status", "apiVersion": "v1", "code": 410}
        }))
        .unwrap();
        let rewritten = rewrite_watch_frame(&rules, Action::Restore, &frame).unwrap();
        let event: Value = serde_json::from_slice(&rewritten[..rewritten.len() - 1]).unwrap();
        assert_eq!(event["object"]["code"], json!(410));
    }
}
