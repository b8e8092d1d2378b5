//! Cache counters and point-in-time status.

use std::time::Duration;

use serde::Serialize;

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Lookups that reused a cached prefix.
    pub hits: u64,
    /// Lookups that reused nothing.
    pub misses: u64,
    /// Hits that had to drop cached positions past the common prefix.
    pub trims: u64,
    /// Times the cached entry was discarded.
    pub resets: u64,
    /// Tokens reused by the most recent lookup.
    pub tokens_reused: usize,
    /// Tokens reused across all lookups.
    pub total_tokens_reused: usize,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.misses
    }

    /// Fraction of lookups that were hits, 0.0 before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let total = self.lookups();
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Snapshot of the cached entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStatus {
    pub model_key: String,
    pub cached_tokens: usize,
    pub layers: usize,
    /// Allocated positions per layer.
    pub capacity: usize,
    pub memory_bytes: usize,
    pub active_memory_bytes: usize,
    /// Time since the entry was created.
    pub age: Duration,
    /// Time since the entry was last used.
    pub idle: Duration,
    /// State is currently held by a running generation.
    pub lent: bool,
}
