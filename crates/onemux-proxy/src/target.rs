//! Outbound target sessions.
//!
//! A target session is a dialed WebSocket split into a writer and a reader
//! half. Plain targets forward OneBot JSON text frames untouched; Sakoya
//! targets translate in both directions and keep a bounded reply cache for
//! quoted-message enrichment.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};

use onemux_core::{EnvelopeKind, TargetEndpoint, TransportError, TransportResult, envelope};
use onemux_sakoya::{self as sakoya, MessageReceive, MessageSend};

use crate::reply::ReplyCache;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// Client handshake headers copied onto every target dial. Some downstream
/// frameworks require `x-self-id` to accept the connection at all.
pub const PROPAGATED_HEADERS: [&str; 4] =
    ["authorization", "x-self-id", "x-client-role", "user-agent"];

/// One read off a target socket.
#[derive(Debug)]
pub enum RecvOutcome {
    /// A data frame, already translated to OneBot JSON text.
    Frame(String),
    /// The peer closed the connection.
    Closed { code: Option<u16>, reason: String },
    /// The socket failed.
    Error(String),
}

/// What the Sakoya translation decided to do with an outbound frame.
pub(crate) enum Outgoing {
    /// Translated dialect bytes.
    Bytes(Vec<u8>),
    /// Forward the OneBot frame as-is.
    Passthrough,
    /// Do not deliver this frame to the target.
    Skip,
}

/// Per-target Sakoya state: the bot id derived from the endpoint path and
/// the reply cache shared between the two translation directions.
pub(crate) struct SakoyaChannel {
    bot_id: String,
    replies: parking_lot::Mutex<ReplyCache>,
}

impl SakoyaChannel {
    pub(crate) fn new(bot_id: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            replies: parking_lot::Mutex::new(ReplyCache::default()),
        }
    }

    /// Applies the outbound decision rules.
    pub(crate) fn outgoing(&self, frame: &Value) -> Outgoing {
        match envelope::classify(frame) {
            // responses routed back by echo stay OneBot-shaped
            EnvelopeKind::ApiResponse => Outgoing::Passthrough,
            EnvelopeKind::Event => match envelope::post_type(frame) {
                Some("meta_event") => Outgoing::Skip,
                Some("message") => {
                    let mut event = frame.clone();
                    self.enrich_reply(&mut event);
                    match sakoya::event_to_receive(&event, &self.bot_id) {
                        Some(bytes) => Outgoing::Bytes(bytes),
                        None => {
                            warn!("message event did not translate, forwarding raw frame");
                            Outgoing::Passthrough
                        }
                    }
                }
                _ => Outgoing::Passthrough,
            },
            EnvelopeKind::ApiCall => {
                let action = envelope::action(frame).unwrap_or_default();
                if sakoya::is_passthrough_action(action) {
                    return Outgoing::Passthrough;
                }
                if action.contains("send") && action.contains("_msg") {
                    return match sakoya::api_call_to_send(frame) {
                        Some(bytes) => Outgoing::Bytes(bytes),
                        None => {
                            warn!(action, "send call did not translate, forwarding raw frame");
                            Outgoing::Passthrough
                        }
                    };
                }
                Outgoing::Passthrough
            }
        }
    }

    /// Decodes an inbound dialect frame to OneBot JSON text. Frames that are
    /// neither a `MessageSend` nor a `MessageReceive` come back untouched.
    pub(crate) fn incoming(&self, text: &str) -> String {
        if let Ok(send) = serde_json::from_str::<MessageSend>(text) {
            return sakoya::send_to_api_call(&send).to_string();
        }
        if let Ok(value) = serde_json::from_str::<Value>(text)
            && value.get("bot_id").is_some()
            && value.get("content").is_some()
            && let Ok(receive) = serde_json::from_value::<MessageReceive>(value)
        {
            return sakoya::receive_to_event(&receive).to_string();
        }
        text.to_string()
    }

    /// Records the event in the reply cache and, when it quotes a cached
    /// message, prepends the quoted images and drops the reply segment.
    fn enrich_reply(&self, event: &mut Value) {
        let message_id = match event.get("message_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let segments = event.get("message").cloned().unwrap_or_else(|| json!([]));

        let mut replies = self.replies.lock();
        replies.insert(message_id, segments.clone());

        let reply_id = segments.as_array().into_iter().flatten().find_map(|seg| {
            if seg.get("type").and_then(Value::as_str) != Some("reply") {
                return None;
            }
            match seg.pointer("/data/id") {
                Some(Value::String(s)) => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }
        });
        let Some(reply_id) = reply_id else { return };

        let Some(quoted) = replies.get(&reply_id) else {
            // quoted message is too old or was never forwarded here
            debug!(reply_id, "quoted message not cached, skipping enrichment");
            return;
        };

        let mut images = Vec::new();
        for seg in quoted.as_array().into_iter().flatten() {
            if seg.get("type").and_then(Value::as_str) != Some("image") {
                continue;
            }
            match seg.pointer("/data/url").and_then(Value::as_str) {
                Some(url) if !url.is_empty() => {
                    images.push(json!({"type": "image", "data": {"url": url}}));
                }
                _ => images.push(seg.clone()),
            }
        }
        if images.is_empty() {
            return;
        }

        let remaining = segments
            .as_array()
            .into_iter()
            .flatten()
            .filter(|seg| seg.get("type").and_then(Value::as_str) != Some("reply"))
            .cloned();
        let mut message = images;
        message.extend(remaining);
        debug!(reply_id, "prepended quoted images to message");
        event["message"] = Value::Array(message);
    }
}

/// Write half of a target session.
pub struct TargetWriter {
    url: String,
    sink: WsSink,
    sakoya: Option<Arc<SakoyaChannel>>,
}

impl TargetWriter {
    /// Sends one OneBot envelope, translating when the target speaks the
    /// Sakoya dialect. Dialect targets always receive binary frames.
    pub async fn send_envelope(&mut self, frame: &Value) -> TransportResult<()> {
        let message = match &self.sakoya {
            Some(channel) => match channel.outgoing(frame) {
                Outgoing::Skip => return Ok(()),
                Outgoing::Bytes(bytes) => Message::Binary(bytes.into()),
                Outgoing::Passthrough => Message::Binary(frame.to_string().into_bytes().into()),
            },
            None => Message::Text(frame.to_string().into()),
        };
        self.sink
            .send(message)
            .await
            .map_err(|e| TransportError::SendFailed(format!("{}: {e}", self.url)))
    }

    /// Best-effort close of the write half.
    pub async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(url = %self.url, error = %e, "target close failed");
        }
    }
}

/// Read half of a target session.
pub struct TargetReader {
    source: WsSource,
    sakoya: Option<Arc<SakoyaChannel>>,
}

impl TargetReader {
    /// Reads the next data frame, translating dialect frames to OneBot text.
    /// Ping/pong frames are consumed transparently.
    pub async fn next_frame(&mut self) -> RecvOutcome {
        loop {
            match self.source.next().await {
                Some(Ok(Message::Text(text))) => return self.decode(text.as_str()),
                Some(Ok(Message::Binary(data))) => {
                    let text = String::from_utf8_lossy(&data).into_owned();
                    return self.decode(&text);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    return RecvOutcome::Closed { code, reason };
                }
                Some(Err(e)) => return RecvOutcome::Error(e.to_string()),
                None => {
                    return RecvOutcome::Closed {
                        code: None,
                        reason: "stream ended".into(),
                    };
                }
            }
        }
    }

    fn decode(&self, text: &str) -> RecvOutcome {
        match &self.sakoya {
            Some(channel) => RecvOutcome::Frame(channel.incoming(text)),
            None => RecvOutcome::Frame(text.to_string()),
        }
    }
}

/// Dials a target endpoint, propagating the captured client headers and
/// overlaying the per-target custom headers (custom wins).
pub async fn dial(
    endpoint: &TargetEndpoint,
    client_headers: &HashMap<String, String>,
) -> TransportResult<(TargetWriter, TargetReader)> {
    let url = endpoint.url().to_string();
    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::invalid_endpoint(&url, e))?;
    let path = request.uri().path().to_string();

    {
        let headers = request.headers_mut();
        for name in PROPAGATED_HEADERS {
            if let Some(value) = client_headers.get(name)
                && let Ok(value) = HeaderValue::from_str(value)
            {
                headers.insert(HeaderName::from_static(name), value);
            }
        }
        for (name, value) in endpoint.headers().into_iter().flatten() {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping malformed custom header"),
            }
        }
    }

    let (stream, _response) = connect_async(request)
        .await
        .map_err(|e| TransportError::connection_failed(&url, e))?;
    let (sink, source) = stream.split();

    let sakoya = endpoint.is_sakoya().then(|| {
        let bot_id = sakoya::bot_id_from_path(&path).unwrap_or_else(|| {
            warn!(path = %path, "cannot derive bot id from endpoint path, using default");
            sakoya::DEFAULT_BOT_ID.to_string()
        });
        Arc::new(SakoyaChannel::new(bot_id))
    });

    Ok((
        TargetWriter {
            url,
            sink,
            sakoya: sakoya.clone(),
        },
        TargetReader { source, sakoya },
    ))
}
