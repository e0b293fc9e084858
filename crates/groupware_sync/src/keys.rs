//! Local record keys
//!
//! Every record gets a key the moment it enters a store. Keys are never
//! reused within an allocator, so two entries holding the same record
//! object still end up with distinct keys.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default key prefix
pub const DEFAULT_KEY_PREFIX: &str = "ext-record";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic key source shared by every store in a session
#[derive(Debug)]
pub struct KeyAllocator {
    prefix: String,
    next: AtomicU64,
}

impl KeyAllocator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }

    /// Next serial number, also used for store ids
    pub fn next_serial(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }

    /// Mint a fresh `<prefix>-<n>` key
    pub fn allocate(&self) -> RecordKey {
        RecordKey(format!("{}-{}", self.prefix, self.next_serial()))
    }
}

impl Default for KeyAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}
