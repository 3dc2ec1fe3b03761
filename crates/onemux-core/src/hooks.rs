//! Hook interfaces the proxy engine calls out to.
//!
//! The command subsystem and the persistence layer live outside the engine;
//! the engine only ever sees these traits. Implementations must be cheap to
//! call per frame; anything expensive belongs behind the implementation's
//! own queueing.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction of a persisted message relative to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Received from the client side.
    Recv,
    /// Sent on behalf of the bot account.
    Send,
}

impl Direction {
    /// The tag stored alongside the message.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Recv => "RECV",
            Direction::Send => "SEND",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication state for one bot account, keyed by `bot_id`.
///
/// Timestamps are unix seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub bot_id: String,
    pub is_authenticated: bool,
    pub authenticated_at: Option<i64>,
    pub failed_attempts: u32,
    pub last_attempt_at: Option<i64>,
    pub is_banned: bool,
    pub banned_until: Option<i64>,
}

/// Entry points of the command subsystem.
///
/// `preprocess` may rewrite any inbound client frame. `handle` may answer an
/// event locally; when it returns a frame, that frame is delivered to the
/// client as if a target had produced it and the original event is not
/// forwarded. `postprocess` is the rewrite/drop point on the target-to-client
/// path.
#[async_trait]
pub trait CommandHook: Send + Sync {
    /// Rewrites an inbound client frame before classification.
    async fn preprocess(&self, envelope: Value) -> Value {
        envelope
    }

    /// Optionally answers an event locally with a synthesized frame.
    async fn handle(&self, envelope: &Value) -> Option<Value> {
        let _ = envelope;
        None
    }

    /// Rewrites or drops a frame headed for the client.
    async fn postprocess(&self, envelope: Value, self_id: Option<i64>) -> Option<Value> {
        let _ = self_id;
        Some(envelope)
    }

    /// A one-shot notification delivered to the client right after the
    /// session registers, e.g. a restart notice.
    fn startup_notice(&self, self_id: Option<i64>) -> Option<Value> {
        let _ = self_id;
        None
    }
}

/// Message and auth-state persistence.
#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// Stores one message with its direction and owning connection.
    async fn save_message(&self, envelope: &Value, direction: Direction, connection_id: &str);

    /// Reads the auth record for a bot account.
    async fn auth_status(&self, bot_id: &str) -> Option<AuthStatus>;

    /// Creates or replaces the auth record for a bot account.
    async fn upsert_auth_status(&self, status: AuthStatus);

    /// Removes the auth record for a bot account.
    async fn delete_auth_status(&self, bot_id: &str);
}

/// The dependency bundle handed to every proxy connection.
#[derive(Clone)]
pub struct ProxyHooks {
    pub command: Arc<dyn CommandHook>,
    pub persistence: Arc<dyn PersistenceHook>,
}
