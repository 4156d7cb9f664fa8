//! TTL-keyed store
//!
//! The credential store only needs a string key-value map with a per-key
//! expiry. `MemoryStore` keeps it in process; expired entries behave as
//! absent and are purged when touched.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum StoreError {
    /// Backend refused or failed the operation
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "store error: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

// ============================================================================
// Store Contract
// ============================================================================

/// Key-value store with per-key expiry
pub trait TtlStore {
    fn exists(&mut self, key: &str) -> Result<bool, StoreError>;

    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write `value` under `key`, expiring after `expire_secs`.
    /// Returns whether the write was confirmed.
    fn set(&mut self, key: &str, value: &str, expire_secs: u64) -> Result<bool, StoreError>;

    /// Returns whether a live key was removed
    fn delete(&mut self, key: &str) -> Result<bool, StoreError>;

    /// Re-arm the expiry of a live key. Returns false if the key is absent.
    fn expire(&mut self, key: &str, expire_secs: u64) -> Result<bool, StoreError>;
}

// ============================================================================
// In-memory Store
// ============================================================================

struct Entry {
    value: String,
    deadline: Instant,
}

/// In-process `TtlStore` with lazy expiry
#[derive(Default)]
pub struct MemoryStore {
    entries: HashMap<String, Entry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.deadline > now);
        before - self.entries.len()
    }

    /// Number of stored entries, including ones not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn live(&mut self, key: &str) -> Option<&mut Entry> {
        let expired = match self.entries.get(key) {
            Some(e) => e.deadline <= Instant::now(),
            None => return None,
        };
        if expired {
            log::trace!("Store key expired: {}", key);
            self.entries.remove(key);
            return None;
        }
        self.entries.get_mut(key)
    }
}

impl TtlStore for MemoryStore {
    fn exists(&mut self, key: &str) -> Result<bool, StoreError> {
        Ok(self.live(key).is_some())
    }

    fn get(&mut self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.live(key).map(|e| e.value.clone()))
    }

    fn set(&mut self, key: &str, value: &str, expire_secs: u64) -> Result<bool, StoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: Instant::now() + Duration::from_secs(expire_secs),
            },
        );
        Ok(true)
    }

    fn delete(&mut self, key: &str) -> Result<bool, StoreError> {
        let was_live = self.live(key).is_some();
        self.entries.remove(key);
        Ok(was_live)
    }

    fn expire(&mut self, key: &str, expire_secs: u64) -> Result<bool, StoreError> {
        match self.live(key) {
            Some(entry) => {
                entry.deadline = Instant::now() + Duration::from_secs(expire_secs);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
