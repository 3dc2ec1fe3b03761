//! OneBot envelope classification and synthesis.
//!
//! Frames travel through the proxy as [`serde_json::Value`] so that unknown
//! fields and the original JSON number types survive forwarding untouched.
//! This module provides the accessors the routing logic needs on top of that
//! raw representation.

use serde_json::{Map, Value, json};

use crate::error::ProxyResult;
use crate::segment;

/// The three envelope shapes exchanged on a OneBot socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// A pushed event (`post_type` present, or neither `action` nor `status`).
    Event,
    /// An API call (`action` present).
    ApiCall,
    /// An API response (`status`/`retcode` present).
    ApiResponse,
}

/// Parses a wire frame into a raw envelope.
pub fn parse_frame(text: &str) -> ProxyResult<Value> {
    Ok(serde_json::from_str(text)?)
}

/// Classifies a frame by its envelope shape.
pub fn classify(frame: &Value) -> EnvelopeKind {
    if frame.get("status").is_some() || frame.get("retcode").is_some() {
        EnvelopeKind::ApiResponse
    } else if frame.get("action").is_some() {
        EnvelopeKind::ApiCall
    } else {
        EnvelopeKind::Event
    }
}

/// Returns the correlation token of a frame, if any.
///
/// Echoes are compared as strings regardless of their JSON type.
pub fn echo_of(frame: &Value) -> Option<String> {
    match frame.get("echo")? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Returns the `post_type` of an event frame.
pub fn post_type(frame: &Value) -> Option<&str> {
    frame.get("post_type").and_then(Value::as_str)
}

/// Returns the `action` of an API call frame.
pub fn action(frame: &Value) -> Option<&str> {
    frame.get("action").and_then(Value::as_str)
}

/// Returns the `self_id` carried by a frame, coercing digit strings.
pub fn self_id(frame: &Value) -> Option<i64> {
    frame.get("self_id").and_then(segment::coerce_id)
}

/// Whether a frame is a successful API response (`status == "ok"` and
/// `retcode == 0`).
pub fn is_success_response(frame: &Value) -> bool {
    frame.get("status").and_then(Value::as_str) == Some("ok")
        && frame.get("retcode").and_then(Value::as_i64) == Some(0)
}

/// Whether an action is a message-send style API call.
pub fn is_send_action(action: &str) -> bool {
    action.contains("send")
}

/// Builds a `message_sent` pseudo-event from a send-style API call.
///
/// The record mirrors what the message would have looked like had it arrived
/// as an event, so outbound traffic persists symmetrically with inbound.
pub fn synthesize_message_sent(
    call: &Value,
    self_id: Option<i64>,
    message_id: Option<Value>,
) -> Value {
    let mut params: Map<String, Value> = call
        .get("params")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();

    params.insert("self_id".into(), json!(self_id));
    if !params.contains_key("sender") {
        params.insert(
            "sender".into(),
            json!({"user_id": self_id, "nickname": "onemux"}),
        );
    }
    params.insert("post_type".into(), json!("message_sent"));

    let segments = params
        .get("message")
        .map(segment::parse_message)
        .unwrap_or_default();
    params.insert(
        "raw_message".into(),
        json!(segment::raw_message(&segments)),
    );

    if let Some(id) = message_id {
        params.insert("message_id".into(), id);
    }

    Value::Object(params)
}

/// Renders a compact single-line preview of a frame for log output,
/// truncated to `max` characters so base64 payloads cannot flood the log.
pub fn compact_preview(frame: &Value, max: usize) -> String {
    let rendered = frame.to_string();
    if rendered.chars().count() <= max {
        return rendered;
    }
    let head: String = rendered.chars().take(max).collect();
    format!("{head}...[total length: {}]", rendered.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&json!({"post_type": "message"})),
            EnvelopeKind::Event
        );
        assert_eq!(
            classify(&json!({"action": "send_group_msg", "echo": "e"})),
            EnvelopeKind::ApiCall
        );
        assert_eq!(
            classify(&json!({"status": "ok", "retcode": 0, "echo": "e"})),
            EnvelopeKind::ApiResponse
        );
        // heartbeat events carry a nested status object but no top-level one
        assert_eq!(classify(&json!({"post_type": "meta_event", "meta_event_type": "heartbeat"})), EnvelopeKind::Event);
    }

    #[test]
    fn test_echo_of() {
        assert_eq!(echo_of(&json!({"echo": "a1"})), Some("a1".into()));
        assert_eq!(echo_of(&json!({"echo": 17})), Some("17".into()));
        assert_eq!(echo_of(&json!({"echo": null})), None);
        assert_eq!(echo_of(&json!({})), None);
    }

    #[test]
    fn test_is_success_response() {
        assert!(is_success_response(
            &json!({"status": "ok", "retcode": 0})
        ));
        assert!(!is_success_response(
            &json!({"status": "failed", "retcode": 100})
        ));
        assert!(!is_success_response(&json!({"status": "ok", "retcode": 1})));
        assert!(!is_success_response(&json!({"post_type": "message"})));
    }

    #[test]
    fn test_synthesize_message_sent() {
        let call = json!({
            "action": "send_group_msg",
            "params": {
                "group_id": 1,
                "message": [{"type": "text", "data": {"text": "hi"}}],
            },
            "echo": "a1",
        });
        let event = synthesize_message_sent(&call, Some(3), Some(json!(99)));
        assert_eq!(event["post_type"], "message_sent");
        assert_eq!(event["self_id"], 3);
        assert_eq!(event["group_id"], 1);
        assert_eq!(event["raw_message"], "hi");
        assert_eq!(event["message_id"], 99);
        assert_eq!(event["sender"]["user_id"], 3);
    }

    #[test]
    fn test_compact_preview_truncates() {
        let frame = json!({"data": "x".repeat(400)});
        let preview = compact_preview(&frame, 200);
        assert!(preview.len() < 260);
        assert!(preview.contains("...[total length:"));
        assert_eq!(compact_preview(&json!({"a": 1}), 200), r#"{"a":1}"#);
    }
}
