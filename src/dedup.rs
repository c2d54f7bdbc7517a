//! Run-wide set of semantic keys already emitted.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::codec::ParsedConfig;

/// First-seen-wins filter over semantic keys, shared by all source tasks.
#[derive(Debug, Default)]
pub struct Deduplicator {
    seen: Mutex<HashSet<String>>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `config`'s key. `true` on first occurrence, `false` on every repeat.
    pub fn admit(&self, config: &ParsedConfig) -> bool {
        self.admit_key(&config.semantic_key)
    }

    pub fn admit_key(&self, key: &str) -> bool {
        let mut seen = self.seen.lock();
        if seen.contains(key) {
            return false;
        }
        seen.insert(key.to_string())
    }

    /// Cheap pre-check used to skip testing candidates that can no longer be emitted.
    pub fn contains(&self, key: &str) -> bool {
        self.seen.lock().contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
