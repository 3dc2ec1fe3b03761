//! Echo correlation cache.
//!
//! Every API call a target sends toward the client carries an `echo` token.
//! The cache remembers which target issued which token so the client's reply
//! can be routed back to that target alone, and so a successful send result
//! can be reconstructed into a persistable message. Keys include the target
//! index; two targets may legally pick the same echo value.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::{debug, warn};

/// Entries older than this are eligible for purging.
pub const MAX_ENTRY_AGE_SECS: u64 = 120;

/// The purge only runs when the cache size crosses a multiple of this.
/// Under healthy traffic the cache never gets this large.
pub const PURGE_STRIDE: usize = 100;

/// One registered correlation token.
#[derive(Debug, Clone)]
pub struct EchoEntry {
    pub original_echo: String,
    pub target_index: usize,
    pub created_at: u64,
    pub original_call: Value,
}

/// Correlation cache owned by a single proxy connection.
#[derive(Debug, Default)]
pub struct EchoCache {
    entries: HashMap<(usize, String), EchoEntry>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl EchoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an echo issued by `target_index`, keeping the originating
    /// call for later reconstruction. A duplicate key is overwritten.
    pub fn record(&mut self, target_index: usize, echo: &str, call: Value) {
        self.record_at(target_index, echo, call, unix_now());
    }

    pub(crate) fn record_at(&mut self, target_index: usize, echo: &str, call: Value, now: u64) {
        let key = (target_index, echo.to_string());
        let entry = EchoEntry {
            original_echo: echo.to_string(),
            target_index,
            created_at: now,
            original_call: call,
        };
        if self.entries.insert(key, entry).is_some() {
            warn!(target = target_index, echo, "echo already registered, overwriting");
        }
        debug!(target = target_index, echo, size = self.entries.len(), "echo registered");

        if self.entries.len() % PURGE_STRIDE == 0 {
            warn!(size = self.entries.len(), "echo cache grew large, purging stale entries");
            self.purge_expired(now);
        }
    }

    /// Resolves an echo and removes the entry. When two targets registered
    /// the same echo value, the lowest target index wins.
    pub fn take(&mut self, echo: &str) -> Option<EchoEntry> {
        let key = self
            .entries
            .keys()
            .filter(|(_, e)| e.as_str() == echo)
            .min_by_key(|(target_index, _)| *target_index)
            .cloned()?;
        self.entries.remove(&key)
    }

    /// Looks an echo up without removing it, resolving collisions the same
    /// way as [`EchoCache::take`].
    pub fn peek(&self, echo: &str) -> Option<&EchoEntry> {
        self.entries
            .values()
            .filter(|entry| entry.original_echo == echo)
            .min_by_key(|entry| entry.target_index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn purge_expired(&mut self, now: u64) {
        self.entries
            .retain(|_, entry| now.saturating_sub(entry.created_at) <= MAX_ENTRY_AGE_SECS);
    }
}
