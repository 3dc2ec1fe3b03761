//! Bounded message history for quoted-reply enrichment.
//!
//! The Sakoya adapter remembers the segment lists of recently forwarded
//! messages so that a later event quoting one of them can be enriched with
//! the quoted images. Insertion order is the eviction order.

use std::collections::{HashMap, VecDeque};

use serde_json::Value;

/// Maximum number of remembered messages per Sakoya target.
pub const REPLY_CACHE_CAPACITY: usize = 100;

/// Insertion-ordered `message_id -> segment list` cache.
#[derive(Debug)]
pub struct ReplyCache {
    order: VecDeque<String>,
    entries: HashMap<String, Value>,
    capacity: usize,
}

impl Default for ReplyCache {
    fn default() -> Self {
        Self::new(REPLY_CACHE_CAPACITY)
    }
}

impl ReplyCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            entries: HashMap::with_capacity(capacity),
            capacity,
        }
    }

    /// Remembers the segments of a message. Re-inserting an id refreshes the
    /// stored value but keeps its position in the eviction order.
    pub fn insert(&mut self, message_id: impl Into<String>, segments: Value) {
        let message_id = message_id.into();
        if message_id.is_empty() {
            return;
        }
        if self.entries.insert(message_id.clone(), segments).is_none() {
            self.order.push_back(message_id);
            if self.order.len() > self.capacity
                && let Some(oldest) = self.order.pop_front()
            {
                self.entries.remove(&oldest);
            }
        }
    }

    /// Returns the remembered segments for a message id.
    pub fn get(&self, message_id: &str) -> Option<&Value> {
        self.entries.get(message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
