//! Bidirectional translation between OneBot envelopes and the Sakoya
//! dialect.
//!
//! All functions here are pure: they take a frame, return bytes or a new
//! frame, and keep no state. The reply cache that enriches quoted messages
//! lives with the target adapter, not here.

use serde_json::{Map, Value, json};
use tracing::warn;

use onemux_core::{envelope, segment};

use crate::model::{
    DEFAULT_BOT_ID, ImagePayload, ImageSourceKind, MessageReceive, MessageSend, SakoyaSegment,
    UserType, image_payload,
};

/// Actions forwarded to Sakoya targets as-is, without translation.
pub const PASSTHROUGH_ACTIONS: [&str; 5] = [
    "get_login_info",
    "get_status",
    "get_version_info",
    "lifecycle",
    "_connect",
];

/// Whether an action belongs to the pass-through set.
pub fn is_passthrough_action(action: &str) -> bool {
    PASSTHROUGH_ACTIONS.contains(&action)
}

fn stringify(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn field_str(data: &Value, key: &str) -> String {
    stringify(data.get(key))
}

/// Translates an OneBot message event into `MessageReceive` bytes.
///
/// Only `post_type == "message"` events translate; everything else yields
/// `None`. Group versus direct is inferred from `message_type`, image
/// segments prefer the resolved `url` over `file`, and unknown segment types
/// degrade to their textual rendering. If the event carries a materialized
/// `reply` object, the images of the quoted message are appended to the
/// content so the backend sees the full context.
pub fn event_to_receive(event: &Value, bot_id: &str) -> Option<Vec<u8>> {
    if envelope::post_type(event) != Some("message") {
        return None;
    }

    let is_group = event.get("message_type").and_then(Value::as_str) == Some("group");

    let mut content = Vec::new();
    for seg in event
        .get("message")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let kind = seg.get("type").and_then(Value::as_str).unwrap_or_default();
        let data = seg.get("data").cloned().unwrap_or(Value::Null);
        match kind {
            "text" => content.push(SakoyaSegment::text(field_str(&data, "text"))),
            "at" => content.push(SakoyaSegment::new("at", json!(field_str(&data, "qq")))),
            "image" => {
                let url = field_str(&data, "url");
                let file = field_str(&data, "file");
                let source = if url.is_empty() { file } else { url };
                content.push(SakoyaSegment::new("image", Value::String(source)));
            }
            "record" => content.push(SakoyaSegment::new(
                "record",
                json!(field_str(&data, "file")),
            )),
            "reply" => content.push(SakoyaSegment::new("reply", json!(field_str(&data, "id")))),
            _ => content.push(SakoyaSegment::text(data.to_string())),
        }
    }

    // Quoted-message context: some clients materialize the referenced
    // message under `reply`; its images ride along at the end.
    if let Some(reply_message) = event.pointer("/reply/message").and_then(Value::as_array) {
        for seg in reply_message {
            if seg.get("type").and_then(Value::as_str) != Some("image") {
                continue;
            }
            let file = seg
                .get("data")
                .map(|d| field_str(d, "file"))
                .unwrap_or_default();
            let payload = if let Some(b64) = file.strip_prefix("base64://") {
                ImagePayload::Typed {
                    kind: ImageSourceKind::B64,
                    content: b64.to_string(),
                }
            } else if file.starts_with("http") {
                ImagePayload::Typed {
                    kind: ImageSourceKind::Url,
                    content: file,
                }
            } else {
                ImagePayload::Typed {
                    kind: ImageSourceKind::File,
                    content: file,
                }
            };
            content.push(SakoyaSegment::new("image", serde_json::to_value(payload).ok()?));
        }
    }

    let sender = event.get("sender").cloned().unwrap_or(Value::Null);
    let mut sakoya_sender = Map::new();
    sakoya_sender.insert("nickname".into(), json!(field_str(&sender, "nickname")));
    sakoya_sender.insert("card".into(), json!(field_str(&sender, "card")));

    let receive = MessageReceive {
        bot_id: bot_id.to_string(),
        bot_self_id: stringify(event.get("self_id")),
        msg_id: stringify(event.get("message_id")),
        user_type: if is_group {
            UserType::Group
        } else {
            UserType::Direct
        },
        group_id: is_group.then(|| stringify(event.get("group_id"))),
        user_id: Some(stringify(event.get("user_id"))),
        sender: sakoya_sender,
        user_pm: 3,
        content,
    };

    serde_json::to_vec(&receive).ok()
}

/// Translates a `MessageReceive` back into an OneBot message event.
pub fn receive_to_event(message: &MessageReceive) -> Value {
    let is_group = message.user_type == UserType::Group;

    let mut segments: Vec<Value> = Vec::new();
    let mut raw_parts: Vec<String> = Vec::new();

    for seg in &message.content {
        match seg.kind_str() {
            "text" => {
                let text = seg.data_str();
                segments.push(json!({"type": "text", "data": {"text": text}}));
                raw_parts.push(text);
            }
            "at" => {
                let id = seg.data_str();
                segments.push(json!({"type": "at", "data": {"qq": id}}));
                raw_parts.push(format!("@{id}"));
            }
            "image" => {
                if let Some(data) = &seg.data
                    && let Some(payload) = image_payload(data)
                {
                    let file = match payload {
                        ImagePayload::Typed {
                            kind: ImageSourceKind::B64,
                            content,
                        } => {
                            if content.starts_with("base64://") {
                                content
                            } else {
                                format!("base64://{content}")
                            }
                        }
                        ImagePayload::Typed { content, .. } => content,
                        ImagePayload::Plain(s) => s,
                    };
                    segments.push(json!({"type": "image", "data": {"file": file}}));
                }
                raw_parts.push("[图片]".into());
            }
            "reply" => {
                segments.push(json!({"type": "reply", "data": {"id": seg.data_str()}}));
                raw_parts.push("[回复]".into());
            }
            "record" => {
                if matches!(&seg.data, Some(Value::String(_))) {
                    segments.push(json!({"type": "record", "data": {"file": seg.data_str()}}));
                }
                raw_parts.push("[语音]".into());
            }
            "file" => {
                // wire format is "<name>|<base64>"
                let data = seg.data_str();
                if let Some((name, b64)) = data.split_once('|') {
                    segments.push(json!({
                        "type": "file",
                        "data": {"file": format!("base64://{b64}"), "name": name},
                    }));
                }
                raw_parts.push("[文件]".into());
            }
            "node" => {
                // forward bundles are flattened to their text for the raw
                // rendering only
                if let Some(nodes) = seg.data.as_ref().and_then(Value::as_array) {
                    for node in nodes.iter().filter_map(Value::as_array) {
                        for sub in node {
                            if sub.get("type").and_then(Value::as_str) == Some("text") {
                                raw_parts.push(stringify(sub.get("data")));
                            }
                        }
                    }
                }
            }
            "markdown" => {
                let text = seg.data_str();
                segments.push(json!({"type": "text", "data": {"text": text}}));
                raw_parts.push(text);
            }
            "buttons" => raw_parts.push("[按钮消息]".into()),
            _ => {
                if seg.data.is_some() {
                    raw_parts.push(seg.data_str());
                }
            }
        }
    }

    let raw_message: String = raw_parts.concat();

    let sender = &message.sender;
    let sender_str = |key: &str| stringify(sender.get(key));
    let onebot_sender = json!({
        "user_id": message
            .user_id
            .as_deref()
            .and_then(|id| segment::coerce_id(&Value::String(id.into())))
            .unwrap_or(0),
        "nickname": sender_str("nickname"),
        "card": sender_str("card"),
        "sex": sender.get("sex").cloned().unwrap_or_else(|| json!("unknown")),
        "age": sender.get("age").cloned().unwrap_or_else(|| json!(0)),
        "area": sender_str("area"),
        "level": sender_str("level"),
        "role": sender.get("role").cloned().unwrap_or_else(|| json!("member")),
        "title": sender_str("title"),
    });

    let digits = |s: &str| segment::coerce_id(&Value::String(s.into())).unwrap_or(0);

    let mut event = json!({
        "post_type": "message",
        "message_type": if is_group { "group" } else { "private" },
        "sub_type": if is_group { "normal" } else { "friend" },
        "message_id": digits(&message.msg_id),
        "user_id": message.user_id.as_deref().map(digits).unwrap_or(0),
        "raw_message": raw_message,
        "message": segments,
        "font": 0,
        "sender": onebot_sender,
        "time": 0,
        "self_id": digits(&message.bot_self_id),
    });
    if is_group {
        event["group_id"] = json!(message.group_id.as_deref().map(digits).unwrap_or(0));
    }
    event
}

/// Translates a `MessageSend` into an OneBot send API call with a fresh
/// random echo. An empty segment list gets one empty text segment injected;
/// downstream implementations reject empty messages.
pub fn send_to_api_call(message: &MessageSend) -> Value {
    let is_group = message.target_type == "group";

    let mut segments: Vec<Value> = Vec::new();
    for seg in &message.content {
        let kind = seg.kind_str();
        if kind.starts_with("log_") {
            // log lines are backend-console output, never sent
            continue;
        }
        match kind {
            "text" => segments.push(json!({"type": "text", "data": {"text": seg.data_str()}})),
            "at" => segments.push(json!({"type": "at", "data": {"qq": seg.data_str()}})),
            "image" => match seg.data.as_ref().and_then(|d| image_payload(d)) {
                Some(ImagePayload::Typed {
                    kind: ImageSourceKind::B64,
                    content,
                }) => {
                    let file = if content.starts_with("base64://") {
                        content
                    } else {
                        format!("base64://{content}")
                    };
                    segments.push(json!({"type": "image", "data": {"file": file}}));
                }
                Some(ImagePayload::Typed { content, .. }) => {
                    segments.push(json!({"type": "image", "data": {"file": content}}));
                }
                Some(ImagePayload::Plain(file)) if !file.is_empty() => {
                    segments.push(json!({"type": "image", "data": {"file": file}}));
                }
                Some(ImagePayload::Plain(_)) => {}
                None => {
                    warn!(data = %seg.data_str(), "unexpected image payload shape, sending as text");
                    segments.push(json!({"type": "text", "data": {"text": seg.data_str()}}));
                }
            },
            "reply" => segments.push(json!({"type": "reply", "data": {"id": seg.data_str()}})),
            "record" => {
                segments.push(json!({"type": "record", "data": {"file": seg.data_str()}}))
            }
            "file" => {
                let data = seg.data_str();
                if let Some((name, b64)) = data.split_once('|') {
                    segments.push(json!({
                        "type": "file",
                        "data": {"file": format!("base64://{b64}"), "name": name},
                    }));
                }
            }
            "markdown" => {
                segments.push(json!({"type": "text", "data": {"text": seg.data_str()}}))
            }
            _ => {
                if seg.data.is_some() {
                    segments.push(json!({"type": "text", "data": {"text": seg.data_str()}}));
                }
            }
        }
    }

    if segments.is_empty() {
        segments.push(json!({"type": "text", "data": {"text": ""}}));
    }

    let target_id = message
        .target_id
        .as_deref()
        .and_then(|id| segment::coerce_id(&Value::String(id.into())))
        .unwrap_or(0);

    let echo = uuid::Uuid::new_v4().simple().to_string();
    if is_group {
        json!({
            "action": "send_group_msg",
            "params": {"group_id": target_id, "message": segments},
            "echo": echo,
        })
    } else {
        json!({
            "action": "send_private_msg",
            "params": {"user_id": target_id, "message": segments},
            "echo": echo,
        })
    }
}

/// Translates an OneBot send API call into `MessageSend` bytes.
///
/// Image files map onto the structured `{type, content}` payload; segment
/// kinds the dialect cannot carry degrade to text.
pub fn api_call_to_send(call: &Value) -> Option<Vec<u8>> {
    let params = call.get("params").cloned().unwrap_or_else(|| json!({}));
    let is_group = params.get("message_type").and_then(Value::as_str) == Some("group");

    let (target_type, target_id) = if is_group {
        ("group", field_str(&params, "group_id"))
    } else {
        ("direct", field_str(&params, "user_id"))
    };

    let mut content = Vec::new();
    for seg in params
        .get("message")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let kind = seg.get("type").and_then(Value::as_str).unwrap_or_default();
        let data = seg.get("data").cloned().unwrap_or(Value::Null);
        match kind {
            "text" => content.push(SakoyaSegment::new("text", json!(field_str(&data, "text")))),
            "at" => content.push(SakoyaSegment::new("at", json!(field_str(&data, "qq")))),
            "image" => {
                let file = field_str(&data, "file");
                let payload = if let Some(b64) = file.strip_prefix("base64://") {
                    ImagePayload::Typed {
                        kind: ImageSourceKind::B64,
                        content: b64.to_string(),
                    }
                } else if file.starts_with("http") {
                    ImagePayload::Typed {
                        kind: ImageSourceKind::Url,
                        content: file,
                    }
                } else {
                    ImagePayload::Typed {
                        kind: ImageSourceKind::File,
                        content: file,
                    }
                };
                content.push(SakoyaSegment::new(
                    "image",
                    serde_json::to_value(payload).ok()?,
                ));
            }
            "record" => content.push(SakoyaSegment::new(
                "record",
                json!(field_str(&data, "file")),
            )),
            "file" => {
                let file = field_str(&data, "file");
                let name = {
                    let n = field_str(&data, "name");
                    if n.is_empty() { "unknown".to_string() } else { n }
                };
                if let Some(b64) = file.strip_prefix("base64://") {
                    content.push(SakoyaSegment::new("file", json!(format!("{name}|{b64}"))));
                } else {
                    content.push(SakoyaSegment::text(format!("[文件: {name}]")));
                }
            }
            "reply" => content.push(SakoyaSegment::new("reply", json!(field_str(&data, "id")))),
            "forward" | "node" => {
                content.push(SakoyaSegment::text("[合并转发消息暂不支持]"))
            }
            _ => content.push(SakoyaSegment::text(data.to_string())),
        }
    }

    let send = MessageSend {
        bot_id: DEFAULT_BOT_ID.to_string(),
        bot_self_id: stringify(call.get("self_id")),
        msg_id: String::new(),
        target_type: target_type.to_string(),
        target_id: Some(target_id),
        content,
    };

    serde_json::to_vec(&send).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_event() -> Value {
        json!({
            "post_type": "message",
            "message_type": "group",
            "group_id": 1,
            "user_id": 2,
            "self_id": 3,
            "message_id": 42,
            "sender": {"nickname": "alice", "card": ""},
            "message": [{"type": "text", "data": {"text": "hi"}}],
        })
    }

    #[test]
    fn test_event_to_receive_group() {
        let bytes = event_to_receive(&group_event(), "Bot").unwrap();
        let receive: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(receive["user_type"], "group");
        assert_eq!(receive["group_id"], "1");
        assert_eq!(receive["user_id"], "2");
        assert_eq!(receive["bot_self_id"], "3");
        assert_eq!(receive["msg_id"], "42");
        assert_eq!(receive["user_pm"], 3);
        assert_eq!(receive["content"], json!([{"type": "text", "data": "hi"}]));
    }

    #[test]
    fn test_event_to_receive_private_has_no_group_id() {
        let mut event = group_event();
        event["message_type"] = json!("private");
        let bytes = event_to_receive(&event, "Bot").unwrap();
        let receive: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(receive["user_type"], "direct");
        assert!(receive.get("group_id").is_none());
    }

    #[test]
    fn test_event_to_receive_ignores_non_message() {
        let meta = json!({"post_type": "meta_event", "meta_event_type": "heartbeat"});
        assert!(event_to_receive(&meta, "Bot").is_none());
    }

    #[test]
    fn test_event_to_receive_prefers_image_url() {
        let mut event = group_event();
        event["message"] = json!([
            {"type": "image", "data": {"file": "cached.jpg", "url": "http://x/a.jpg"}},
        ]);
        let bytes = event_to_receive(&event, "Bot").unwrap();
        let receive: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            receive["content"],
            json!([{"type": "image", "data": "http://x/a.jpg"}])
        );
    }

    #[test]
    fn test_event_to_receive_appends_quoted_images() {
        let mut event = group_event();
        event["reply"] = json!({
            "message": [
                {"type": "text", "data": {"text": "earlier"}},
                {"type": "image", "data": {"file": "base64://AAAA"}},
                {"type": "image", "data": {"file": "http://x/b.jpg"}},
            ],
        });
        let bytes = event_to_receive(&event, "Bot").unwrap();
        let receive: Value = serde_json::from_slice(&bytes).unwrap();
        let content = receive["content"].as_array().unwrap();
        assert_eq!(content.len(), 3);
        assert_eq!(
            content[1],
            json!({"type": "image", "data": {"type": "b64", "content": "AAAA"}})
        );
        assert_eq!(
            content[2],
            json!({"type": "image", "data": {"type": "url", "content": "http://x/b.jpg"}})
        );
    }

    #[test]
    fn test_round_trip_preserves_ids_and_order() {
        let mut event = group_event();
        event["message"] = json!([
            {"type": "text", "data": {"text": "see "}},
            {"type": "at", "data": {"qq": "2"}},
            {"type": "image", "data": {"url": "http://x/a.jpg"}},
        ]);
        let bytes = event_to_receive(&event, "Bot").unwrap();
        let receive: MessageReceive = serde_json::from_slice(&bytes).unwrap();
        let back = receive_to_event(&receive);
        assert_eq!(back["group_id"], 1);
        assert_eq!(back["user_id"], 2);
        assert_eq!(back["self_id"], 3);
        let kinds: Vec<&str> = back["message"]
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["type"].as_str().unwrap())
            .collect();
        assert_eq!(kinds, ["text", "at", "image"]);
        assert_eq!(back["raw_message"], "see @2[图片]");
    }

    #[test]
    fn test_send_to_api_call_group() {
        let send = MessageSend {
            bot_id: DEFAULT_BOT_ID.into(),
            bot_self_id: String::new(),
            msg_id: String::new(),
            target_type: "group".into(),
            target_id: Some("1".into()),
            content: vec![SakoyaSegment::text("pong")],
        };
        let call = send_to_api_call(&send);
        assert_eq!(call["action"], "send_group_msg");
        assert_eq!(call["params"]["group_id"], 1);
        assert_eq!(call["params"]["message"][0]["data"]["text"], "pong");
        assert_eq!(call["echo"].as_str().unwrap().len(), 32);
    }

    #[test]
    fn test_send_to_api_call_injects_empty_text() {
        let send = MessageSend {
            bot_id: DEFAULT_BOT_ID.into(),
            bot_self_id: String::new(),
            msg_id: String::new(),
            target_type: "direct".into(),
            target_id: Some("2".into()),
            content: vec![SakoyaSegment::new("log_info", json!("done"))],
        };
        let call = send_to_api_call(&send);
        assert_eq!(call["action"], "send_private_msg");
        assert_eq!(call["params"]["user_id"], 2);
        assert_eq!(
            call["params"]["message"],
            json!([{"type": "text", "data": {"text": ""}}])
        );
    }

    #[test]
    fn test_send_to_api_call_fresh_echo_each_time() {
        let send = MessageSend {
            bot_id: DEFAULT_BOT_ID.into(),
            bot_self_id: String::new(),
            msg_id: String::new(),
            target_type: "group".into(),
            target_id: Some("1".into()),
            content: vec![SakoyaSegment::text("x")],
        };
        let first = send_to_api_call(&send);
        let second = send_to_api_call(&send);
        assert_ne!(first["echo"], second["echo"]);
    }

    #[test]
    fn test_api_call_to_send_image_shapes() {
        let call = json!({
            "action": "send_msg",
            "self_id": 3,
            "params": {
                "message_type": "group",
                "group_id": 1,
                "message": [
                    {"type": "image", "data": {"file": "base64://AAAA"}},
                    {"type": "image", "data": {"file": "http://x/a.jpg"}},
                    {"type": "image", "data": {"file": "local.jpg"}},
                    {"type": "node", "data": {"id": "99"}},
                ],
            },
        });
        let bytes = api_call_to_send(&call).unwrap();
        let send: MessageSend = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(send.target_type, "group");
        assert_eq!(send.target_id.as_deref(), Some("1"));
        assert_eq!(send.bot_self_id, "3");
        assert_eq!(
            send.content[0].data,
            Some(json!({"type": "b64", "content": "AAAA"}))
        );
        assert_eq!(
            send.content[1].data,
            Some(json!({"type": "url", "content": "http://x/a.jpg"}))
        );
        assert_eq!(
            send.content[2].data,
            Some(json!({"type": "file", "content": "local.jpg"}))
        );
        assert_eq!(send.content[3].kind_str(), "text");
    }

    #[test]
    fn test_api_call_to_send_file_without_base64_degrades() {
        let call = json!({
            "action": "send_private_msg",
            "params": {
                "message_type": "private",
                "user_id": 2,
                "message": [
                    {"type": "file", "data": {"file": "/tmp/doc.pdf", "name": "doc.pdf"}},
                ],
            },
        });
        let bytes = api_call_to_send(&call).unwrap();
        let send: MessageSend = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(send.target_type, "direct");
        assert_eq!(send.content[0].data_str(), "[文件: doc.pdf]");
    }

    #[test]
    fn test_passthrough_actions() {
        assert!(is_passthrough_action("lifecycle"));
        assert!(is_passthrough_action("_connect"));
        assert!(is_passthrough_action("get_status"));
        assert!(!is_passthrough_action("send_group_msg"));
    }
}
