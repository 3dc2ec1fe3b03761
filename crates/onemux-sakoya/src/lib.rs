//! # onemux-sakoya
//!
//! The Sakoya wire dialect spoken by one family of downstream backends, and
//! the stateless translation between it and OneBot envelopes.
//!
//! Endpoints using this dialect follow the `/ws/<bot_id>` path convention
//! and exchange UTF-8 JSON over binary frames.

pub mod convert;
pub mod model;

pub use convert::{
    PASSTHROUGH_ACTIONS, api_call_to_send, event_to_receive, is_passthrough_action,
    receive_to_event, send_to_api_call,
};
pub use model::{
    DEFAULT_BOT_ID, ImagePayload, ImageSourceKind, MessageReceive, MessageSend, SakoyaSegment,
    UserType, bot_id_from_path, image_payload,
};
