//! Newline-delimited JSON object framing for the hub and daemon buses.
//!
//! The wire format is one JSON object per message; in the common case a
//! WebSocket or Unix-socket text message is exactly one complete document.
//! Some peers split a document across several transport messages, so the
//! decoder accumulates bytes and retries a full-document parse, using a
//! balanced-delimiter check to decide whether it's worth trying yet.

use anyhow::{bail, Result};
use serde_json::Value;

/// Incremental JSON-object decoder that tolerates a document being split
/// across multiple `feed()` calls.
///
/// Feed raw text via [`JsonFrameDecoder::feed`]; each call returns the
/// frames that became complete as a result, leaving any trailing partial
/// object buffered for the next call.
#[derive(Debug, Default)]
pub struct JsonFrameDecoder {
    buf: String,
}

impl JsonFrameDecoder {
    /// Creates a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk of text (one transport message) into the decoder.
    ///
    /// Returns zero or more complete JSON objects. A chunk that completes
    /// the buffered partial document, or that itself contains several
    /// back-to-back or newline-separated documents, may yield more than
    /// one frame.
    ///
    /// # Errors
    ///
    /// Returns an error only when the buffer looks complete (balanced
    /// delimiters) yet fails to parse — a malformed document, not a
    /// partial one. On error the buffer is dropped so the decoder can
    /// recover on the next feed.
    pub fn feed(&mut self, chunk: &str) -> Result<Vec<Value>> {
        if !self.buf.is_empty() {
            self.buf.push('\n');
        }
        self.buf.push_str(chunk);

        let mut frames = Vec::new();
        loop {
            let trimmed = self.buf.trim_start();
            if trimmed.is_empty() {
                self.buf.clear();
                break;
            }

            if !looks_balanced(trimmed) {
                // Wait for more data.
                break;
            }

            match split_first_value(trimmed) {
                Ok(Some((value, rest))) => {
                    frames.push(value);
                    self.buf = rest.to_string();
                    if self.buf.trim().is_empty() {
                        self.buf.clear();
                        break;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.buf.clear();
                    bail!("malformed JSON frame: {e}");
                }
            }
        }

        Ok(frames)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.trim().is_empty()
    }
}

/// Cheap pre-check: does `s` have balanced `{}`/`[]`/`"` so a parse attempt
/// is worth making? Ignores braces inside string literals.
fn looks_balanced(s: &str) -> bool {
    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut saw_open = false;

    for c in s.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' | '[' => {
                depth += 1;
                saw_open = true;
            }
            '}' | ']' => depth -= 1,
            _ => {}
        }
    }

    saw_open && depth <= 0 && !in_string
}

/// Parses the first complete JSON value out of `s`, returning the value and
/// the unparsed remainder. Returns `Ok(None)` if `s` is not yet a complete
/// document (shouldn't happen once `looks_balanced` passed, but handled
/// defensively since the pre-check is a heuristic, not a real parser).
fn split_first_value(s: &str) -> Result<Option<(Value, &str)>> {
    let mut stream = serde_json::Deserializer::from_str(s).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => {
            let consumed = stream.byte_offset();
            Ok(Some((value, &s[consumed..])))
        }
        Some(Err(e)) if e.is_eof() => Ok(None),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_complete_object() {
        let mut decoder = JsonFrameDecoder::new();
        let frames = decoder.feed(r#"{"type":"keepalive"}"#).unwrap();
        assert_eq!(frames, vec![json!({"type": "keepalive"})]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_split_across_two_feeds() {
        let mut decoder = JsonFrameDecoder::new();
        let frames = decoder.feed(r#"{"type":"keep"#).unwrap();
        assert!(frames.is_empty());
        assert!(decoder.has_partial());

        let frames = decoder.feed(r#"alive"}"#).unwrap();
        assert_eq!(frames, vec![json!({"type": "keepalive"})]);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn test_two_objects_in_one_feed() {
        let mut decoder = JsonFrameDecoder::new();
        let frames = decoder
            .feed(r#"{"a":1}{"b":2}"#)
            .unwrap();
        assert_eq!(frames, vec![json!({"a": 1}), json!({"b": 2})]);
    }

    #[test]
    fn test_byte_at_a_time() {
        let doc = r#"{"type":"request","request_id":"r1","method":"ping"}"#;
        let mut decoder = JsonFrameDecoder::new();
        let mut all = Vec::new();
        for c in doc.chars() {
            let frames = decoder.feed(&c.to_string()).unwrap();
            all.extend(frames);
        }
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["method"], "ping");
    }

    #[test]
    fn test_malformed_after_balanced_errors_and_recovers() {
        let mut decoder = JsonFrameDecoder::new();
        let err = decoder.feed(r#"{"a": ,}"#);
        assert!(err.is_err());
        assert!(!decoder.has_partial());

        let frames = decoder.feed(r#"{"a":1}"#).unwrap();
        assert_eq!(frames, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_braces_inside_string_do_not_confuse_balance_check() {
        let mut decoder = JsonFrameDecoder::new();
        let frames = decoder
            .feed(r#"{"msg":"contains { and } and ["}"#)
            .unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["msg"], "contains { and } and [");
    }
}
