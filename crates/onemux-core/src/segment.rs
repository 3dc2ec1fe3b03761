//! OneBot v11 message segment model.
//!
//! A message is an array of `{type, data}` objects. The proxy never needs the
//! full OneBot type zoo; it needs the segments that translation and rendering
//! care about, plus a lossless fallback for everything else. Segments whose
//! `type` is unrecognized (or whose `data` does not match the expected shape)
//! are kept as [`Segment::Unknown`] and serialize back verbatim, so a parse
//! and re-serialize of a message array yields equivalent JSON.

use serde::de::Error as _;
use serde::ser::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value, json};

/// A single message segment.
#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    /// Plain text.
    Text(TextData),
    /// @mention. `qq` may be a number, a digit string, or `"all"`.
    At(AtData),
    /// Image, by file reference, URL or `base64://` payload.
    Image(ImageData),
    /// Voice record.
    Record(RecordData),
    /// Reply reference to an earlier message.
    Reply(ReplyData),
    /// File attachment (`base64://` payload plus a display name).
    File(FileData),
    /// Forward node.
    Node(NodeData),
    /// Markdown block.
    Markdown(MarkdownData),
    /// Button panel. The payload is kept as-is.
    Buttons(ButtonsData),
    /// Any segment the proxy does not model; the whole raw object.
    Unknown(Value),
}

/// Plain text segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextData {
    /// The text content.
    pub text: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// @mention segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtData {
    /// QQ number, digit string, or `"all"`.
    pub qq: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Image segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    /// File name, path, URL, or `base64://` payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Resolved URL (receive only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Voice record segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordData {
    /// Audio file name, path, URL, or `base64://` payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Reply segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyData {
    /// Referenced message id; number or string depending on the client.
    pub id: Value,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// File segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileData {
    /// `base64://` payload or file reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Forward node segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    /// Child content for custom nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Markdown segment data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkdownData {
    /// Markdown text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Button panel segment data, kept opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ButtonsData {
    #[serde(flatten)]
    pub raw: Map<String, Value>,
}

impl Segment {
    /// Creates a plain text segment.
    pub fn text(text: impl Into<String>) -> Self {
        Segment::Text(TextData {
            text: text.into(),
            extra: Map::new(),
        })
    }

    /// Creates an image segment from a file reference or URL.
    pub fn image(file: impl Into<String>) -> Self {
        Segment::Image(ImageData {
            file: Some(file.into()),
            url: None,
            extra: Map::new(),
        })
    }

    /// Creates a reply segment referencing another message.
    pub fn reply(id: impl Into<String>) -> Self {
        Segment::Reply(ReplyData {
            id: Value::String(id.into()),
            extra: Map::new(),
        })
    }

    /// The OneBot `type` tag of this segment.
    pub fn segment_type(&self) -> &str {
        match self {
            Segment::Text(_) => "text",
            Segment::At(_) => "at",
            Segment::Image(_) => "image",
            Segment::Record(_) => "record",
            Segment::Reply(_) => "reply",
            Segment::File(_) => "file",
            Segment::Node(_) => "node",
            Segment::Markdown(_) => "markdown",
            Segment::Buttons(_) => "buttons",
            Segment::Unknown(raw) => raw
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }

    /// Converts a raw segment object into a [`Segment`], falling back to
    /// [`Segment::Unknown`] on any shape mismatch.
    pub fn from_value_lossy(raw: Value) -> Self {
        let ty = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let data = raw.get("data").cloned().unwrap_or(Value::Null);

        macro_rules! typed {
            ($variant:ident) => {
                match serde_json::from_value(data) {
                    Ok(d) => Segment::$variant(d),
                    Err(_) => Segment::Unknown(raw),
                }
            };
        }

        match ty.as_str() {
            "text" => typed!(Text),
            "at" => typed!(At),
            "image" => typed!(Image),
            "record" => typed!(Record),
            "reply" => typed!(Reply),
            "file" => typed!(File),
            "node" => typed!(Node),
            "markdown" => typed!(Markdown),
            "buttons" => typed!(Buttons),
            _ => Segment::Unknown(raw),
        }
    }

    /// Converts this segment back to its raw `{type, data}` object.
    pub fn to_value(&self) -> serde_json::Result<Value> {
        fn tagged<T: Serialize>(ty: &str, data: &T) -> serde_json::Result<Value> {
            Ok(json!({"type": ty, "data": serde_json::to_value(data)?}))
        }

        match self {
            Segment::Text(d) => tagged("text", d),
            Segment::At(d) => tagged("at", d),
            Segment::Image(d) => tagged("image", d),
            Segment::Record(d) => tagged("record", d),
            Segment::Reply(d) => tagged("reply", d),
            Segment::File(d) => tagged("file", d),
            Segment::Node(d) => tagged("node", d),
            Segment::Markdown(d) => tagged("markdown", d),
            Segment::Buttons(d) => tagged("buttons", d),
            Segment::Unknown(raw) => Ok(raw.clone()),
        }
    }
}

impl Serialize for Segment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(S::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Segment {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        if !raw.is_object() {
            return Err(D::Error::custom("message segment must be an object"));
        }
        Ok(Segment::from_value_lossy(raw))
    }
}

impl std::fmt::Display for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Text(data) => write!(f, "{}", data.text),
            Segment::At(data) => match &data.qq {
                Value::String(s) if s.as_str() == "all" => write!(f, "@全体成员"),
                Value::String(s) => write!(f, "@{s}"),
                other => write!(f, "@{other}"),
            },
            Segment::Image(_) => write!(f, "[图片]"),
            Segment::Record(_) => write!(f, "[语音]"),
            Segment::Reply(_) => write!(f, "[回复]"),
            Segment::File(_) => write!(f, "[文件]"),
            Segment::Node(_) => write!(f, "[合并转发]"),
            Segment::Markdown(data) => write!(f, "{}", data.content.as_deref().unwrap_or("")),
            Segment::Buttons(_) => write!(f, "[按钮]"),
            Segment::Unknown(_) => write!(f, "[未知消息]"),
        }
    }
}

/// Parses an OneBot `message` field into segments.
///
/// A string message is treated as one text segment; anything else that is not
/// an array yields no segments.
pub fn parse_message(message: &Value) -> Vec<Segment> {
    match message {
        Value::Array(items) => items
            .iter()
            .cloned()
            .map(Segment::from_value_lossy)
            .collect(),
        Value::String(text) => vec![Segment::text(text.clone())],
        _ => Vec::new(),
    }
}

/// Renders a segment list as the flat `raw_message` string used for
/// persistence: text is inlined, everything else becomes a placeholder.
pub fn raw_message(segments: &[Segment]) -> String {
    segments.iter().map(ToString::to_string).collect()
}

/// Converts a JSON number or digit string to an integer.
///
/// Used when synthesizing API calls internally; string-shaped IDs on incoming
/// frames are forwarded untouched.
pub fn coerce_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) if !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()) => {
            s.parse().ok()
        }
        _ => None,
    }
}
