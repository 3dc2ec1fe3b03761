//! Sakoya wire format.
//!
//! The dialect exchanges UTF-8 JSON over binary WebSocket frames. Inbound
//! messages to a Sakoya backend are `MessageReceive`; outbound replies from
//! the backend are `MessageSend`. Segment `data` is loosely typed on the
//! wire: plain strings for text/at/record, either a string or a
//! `{type, content}` object for images.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fallback bot identifier when none can be derived from the endpoint path.
pub const DEFAULT_BOT_ID: &str = "Bot";

/// Chat scope of a `MessageReceive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserType {
    #[default]
    Group,
    Direct,
    Channel,
    SubChannel,
}

/// One Sakoya message segment: `{type, data}` with dialect-specific payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct SakoyaSegment {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

impl SakoyaSegment {
    /// Creates a segment with the given type tag and payload.
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self {
            kind: Some(kind.into()),
            data: Some(data),
        }
    }

    /// Creates a plain text segment.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new("text", Value::String(text.into()))
    }

    /// The type tag, or `""` when absent.
    pub fn kind_str(&self) -> &str {
        self.kind.as_deref().unwrap_or_default()
    }

    /// The payload rendered as a string. Strings come back verbatim, a
    /// missing payload becomes `""`, everything else its JSON rendering.
    pub fn data_str(&self) -> String {
        match &self.data {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
        }
    }
}

/// Image payload shapes seen on the wire.
///
/// Older senders pass a bare string (URL, `base64://…` or file name); newer
/// ones pass `{type, content}`. Anything else is rejected rather than
/// coerced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImagePayload {
    Typed {
        #[serde(rename = "type")]
        kind: ImageSourceKind,
        content: String,
    },
    Plain(String),
}

/// Source discriminator of a typed image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSourceKind {
    Url,
    B64,
    File,
}

/// Decodes an image segment payload, or `None` for an unexpected shape.
pub fn image_payload(data: &Value) -> Option<ImagePayload> {
    serde_json::from_value(data.clone()).ok()
}

/// A message pushed to a Sakoya backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageReceive {
    pub bot_id: String,
    pub bot_self_id: String,
    pub msg_id: String,
    pub user_type: UserType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub user_id: Option<String>,
    pub sender: Map<String, Value>,
    pub user_pm: i64,
    pub content: Vec<SakoyaSegment>,
}

impl Default for MessageReceive {
    fn default() -> Self {
        Self {
            bot_id: DEFAULT_BOT_ID.to_string(),
            bot_self_id: String::new(),
            msg_id: String::new(),
            user_type: UserType::Group,
            group_id: None,
            user_id: None,
            sender: Map::new(),
            user_pm: 3,
            content: Vec::new(),
        }
    }
}

/// A send request produced by a Sakoya backend.
///
/// `target_type` and `content` are deliberately required so that decoding
/// doubles as the shape check: ordinary OneBot frames do not parse as a
/// `MessageSend`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSend {
    #[serde(default = "default_bot_id")]
    pub bot_id: String,
    #[serde(default)]
    pub bot_self_id: String,
    #[serde(default)]
    pub msg_id: String,
    pub target_type: String,
    #[serde(default)]
    pub target_id: Option<String>,
    pub content: Vec<SakoyaSegment>,
}

fn default_bot_id() -> String {
    DEFAULT_BOT_ID.to_string()
}

/// Extracts the bot id from a `/ws/<bot_id>` endpoint path.
pub fn bot_id_from_path(path: &str) -> Option<String> {
    let path = path.strip_prefix('/').unwrap_or(path);
    let mut parts = path.split('/');
    if parts.next() != Some("ws") {
        return None;
    }
    match parts.next() {
        Some(bot_id) if !bot_id.is_empty() => Some(bot_id.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_send_strict_decode() {
        let wire = json!({
            "bot_id": "onebot",
            "bot_self_id": "3",
            "msg_id": "m1",
            "target_type": "group",
            "target_id": "1",
            "content": [{"type": "text", "data": "pong"}],
        });
        let send: MessageSend = serde_json::from_value(wire).unwrap();
        assert_eq!(send.target_type, "group");
        assert_eq!(send.content[0].data_str(), "pong");

        // an ordinary OneBot event must not decode as a send request
        let event = json!({"post_type": "message", "message": []});
        assert!(serde_json::from_value::<MessageSend>(event).is_err());
        // neither must a response envelope
        let resp = json!({"status": "ok", "retcode": 0, "echo": "a"});
        assert!(serde_json::from_value::<MessageSend>(resp).is_err());
    }

    #[test]
    fn test_message_receive_defaults() {
        let receive: MessageReceive =
            serde_json::from_value(json!({"bot_id": "b", "content": []})).unwrap();
        assert_eq!(receive.user_type, UserType::Group);
        assert_eq!(receive.user_pm, 3);
        assert_eq!(receive.msg_id, "");
    }

    #[test]
    fn test_image_payload_shapes() {
        assert_eq!(
            image_payload(&json!("http://x/a.jpg")),
            Some(ImagePayload::Plain("http://x/a.jpg".into()))
        );
        assert_eq!(
            image_payload(&json!({"type": "b64", "content": "AAAA"})),
            Some(ImagePayload::Typed {
                kind: ImageSourceKind::B64,
                content: "AAAA".into()
            })
        );
        assert_eq!(image_payload(&json!(42)), None);
        assert_eq!(image_payload(&json!({"kind": "url"})), None);
    }

    #[test]
    fn test_bot_id_from_path() {
        assert_eq!(bot_id_from_path("/ws/NoneBot2"), Some("NoneBot2".into()));
        assert_eq!(bot_id_from_path("ws/Bot"), Some("Bot".into()));
        assert_eq!(bot_id_from_path("/ws/"), None);
        assert_eq!(bot_id_from_path("/onebot/v11/ws"), None);
        assert_eq!(bot_id_from_path(""), None);
    }
}
