//! Default hook implementations.
//!
//! The engine only ever talks to the hook traits; these implementations are
//! what the runtime wires in when no external command or persistence
//! subsystem is plugged. The store keeps everything in memory, which is also
//! what the tests run against.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use onemux_core::{AuthStatus, CommandHook, Direction, PersistenceHook, ProxyHooks};

/// A command hook that rewrites nothing and answers nothing.
pub struct NoopCommandHook;

#[async_trait]
impl CommandHook for NoopCommandHook {}

/// One persisted message row.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub envelope: Value,
    pub direction: Direction,
    pub connection_id: String,
}

/// In-memory persistence: message rows and the auth-status table.
#[derive(Default)]
pub struct MemoryStore {
    messages: parking_lot::RwLock<Vec<StoredMessage>>,
    auth: parking_lot::RwLock<HashMap<String, AuthStatus>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored message rows.
    pub fn message_count(&self) -> usize {
        self.messages.read().len()
    }

    /// All rows stored for one connection.
    pub fn messages_for(&self, connection_id: &str) -> Vec<StoredMessage> {
        self.messages
            .read()
            .iter()
            .filter(|row| row.connection_id == connection_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PersistenceHook for MemoryStore {
    async fn save_message(&self, envelope: &Value, direction: Direction, connection_id: &str) {
        debug!(connection_id, %direction, "storing message");
        self.messages.write().push(StoredMessage {
            envelope: envelope.clone(),
            direction,
            connection_id: connection_id.to_string(),
        });
    }

    async fn auth_status(&self, bot_id: &str) -> Option<AuthStatus> {
        self.auth.read().get(bot_id).cloned()
    }

    async fn upsert_auth_status(&self, status: AuthStatus) {
        self.auth.write().insert(status.bot_id.clone(), status);
    }

    async fn delete_auth_status(&self, bot_id: &str) {
        self.auth.write().remove(bot_id);
    }
}

/// The hook bundle used when nothing external is plugged in.
pub fn default_hooks() -> ProxyHooks {
    ProxyHooks {
        command: Arc::new(NoopCommandHook),
        persistence: Arc::new(MemoryStore::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_rows_by_connection() {
        let store = MemoryStore::new();
        store
            .save_message(&json!({"post_type": "message"}), Direction::Recv, "a")
            .await;
        store
            .save_message(&json!({"post_type": "message_sent"}), Direction::Send, "b")
            .await;
        assert_eq!(store.message_count(), 2);
        let rows = store.messages_for("b");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].direction, Direction::Send);
    }

    #[tokio::test]
    async fn test_auth_status_crud() {
        let store = MemoryStore::new();
        assert!(store.auth_status("10001").await.is_none());

        store
            .upsert_auth_status(AuthStatus {
                bot_id: "10001".into(),
                is_authenticated: true,
                authenticated_at: Some(1_700_000_000),
                ..AuthStatus::default()
            })
            .await;
        let status = store.auth_status("10001").await.unwrap();
        assert!(status.is_authenticated);

        store
            .upsert_auth_status(AuthStatus {
                bot_id: "10001".into(),
                is_banned: true,
                banned_until: Some(1_700_001_800),
                failed_attempts: 3,
                ..AuthStatus::default()
            })
            .await;
        let status = store.auth_status("10001").await.unwrap();
        assert!(status.is_banned);
        assert_eq!(status.failed_attempts, 3);

        store.delete_auth_status("10001").await;
        assert!(store.auth_status("10001").await.is_none());
    }
}
