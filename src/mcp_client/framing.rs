//! Newline-delimited JSON framing.
//!
//! Outbound messages are one JSON object followed by `\n`. Inbound bytes are
//! split on `\n` and each line is decoded independently; what to do with a
//! line that fails to decode is the transport's policy, not the codec's.

use std::collections::VecDeque;

use serde::Serialize;

use super::correlator::Correlator;
use super::errors::McpError;
use super::types::{error_codes, JsonRpcNotification, JsonRpcResponse};

/// Characters of diagnostic output retained per process.
pub const STDERR_TAIL_CAPACITY: usize = 1000;

/// Characters of diagnostic output included in error messages.
pub const STDERR_SNIPPET_LEN: usize = 500;

// ─── Encoding ────────────────────────────────────────────────────────────────

/// Serialize a message and terminate it with a single newline.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

// ─── Decoding ────────────────────────────────────────────────────────────────

/// A server-initiated message that is not a correlated response.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Present when the server sent a request rather than a notification.
    pub id: Option<serde_json::Value>,
    pub method: String,
    pub params: Option<serde_json::Value>,
}

impl InboundMessage {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

impl From<JsonRpcNotification> for InboundMessage {
    fn from(n: JsonRpcNotification) -> Self {
        Self {
            id: None,
            method: n.method,
            params: n.params,
        }
    }
}

/// Where an inbound line ended up.
#[derive(Debug, PartialEq)]
pub enum Routed {
    /// Blank line.
    Empty,
    /// Delivered to the pending caller with this id.
    Response(u64),
    /// To be forwarded to the message observer.
    Message(InboundMessage),
    /// A response nobody is waiting for (late, after timeout, or unknown id).
    Unmatched,
}

/// Decode one line and route it: responses to the correlator, everything
/// else with a method to the caller.
///
/// Returns `Err` with a human-readable reason when the line is not a JSON
/// object.
pub fn route_line(line: &[u8], correlator: &Correlator) -> Result<Routed, String> {
    let trimmed = trim_ascii(line);
    if trimmed.is_empty() {
        return Ok(Routed::Empty);
    }

    let value: serde_json::Value =
        serde_json::from_slice(trimmed).map_err(|e| format!("invalid JSON: {e}"))?;
    let obj = value
        .as_object()
        .ok_or_else(|| "message is not a JSON object".to_string())?;

    let id = obj.get("id").filter(|v| !v.is_null());
    let method = obj.get("method").and_then(|m| m.as_str());

    if let Some(numeric_id) = id.and_then(|v| v.as_u64()) {
        if method.is_none() && correlator.is_pending(numeric_id) {
            return Ok(match serde_json::from_value::<JsonRpcResponse>(value.clone()) {
                Ok(response) if correlator.complete(response.clone()) => Routed::Response(numeric_id),
                Ok(_) => Routed::Unmatched,
                // Someone is waiting on this id: fail them now, not at their timeout.
                Err(e) if correlator.fail(numeric_id, unreadable_response(obj, &e)) => {
                    Routed::Response(numeric_id)
                }
                Err(_) => Routed::Unmatched,
            });
        }
    }

    match method {
        Some(method) => Ok(Routed::Message(InboundMessage {
            id: id.cloned(),
            method: method.to_string(),
            params: obj.get("params").cloned(),
        })),
        None => Ok(Routed::Unmatched),
    }
}

/// Best-effort error for a response that carries our id but does not fit the
/// response shape, e.g. `"error":"boom"`.
fn unreadable_response(
    obj: &serde_json::Map<String, serde_json::Value>,
    reason: &serde_json::Error,
) -> McpError {
    let error = obj.get("error");
    let code = error
        .and_then(|e| e.get("code"))
        .and_then(|c| c.as_i64())
        .and_then(|c| i32::try_from(c).ok())
        .unwrap_or(error_codes::INTERNAL_ERROR);
    let message = match error {
        Some(serde_json::Value::String(text)) => text.clone(),
        _ => format!("unreadable response: {reason}"),
    };
    McpError::RemoteError {
        code,
        message,
        data: error.cloned(),
    }
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

// ─── Diagnostic Capture ──────────────────────────────────────────────────────

/// Rolling buffer of the most recent diagnostic (stderr) output.
#[derive(Debug)]
pub struct StderrTail {
    chars: VecDeque<char>,
    capacity: usize,
}

impl Default for StderrTail {
    fn default() -> Self {
        Self::with_capacity(STDERR_TAIL_CAPACITY)
    }
}

impl StderrTail {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            chars: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append output, evicting the oldest characters beyond capacity.
    pub fn push(&mut self, text: &str) {
        for ch in text.chars() {
            if self.chars.len() == self.capacity {
                self.chars.pop_front();
            }
            self.chars.push_back(ch);
        }
    }

    /// The last `max_chars` characters, trimmed.
    pub fn snippet(&self, max_chars: usize) -> String {
        let skip = self.chars.len().saturating_sub(max_chars);
        let tail: String = self.chars.iter().skip(skip).collect();
        tail.trim().to_string()
    }

    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" | stderr: {stderr}")
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
