//! The single cached prompt.

use std::time::{Duration, Instant};

use promptcache_engine::{LayerStates, ModelKey, TokenId};

/// Identifies one loan of an entry's attention state.
pub(crate) type LeaseId = u64;

/// A token sequence together with the per-layer attention state that covers it.
///
/// While a generation is running the state is lent out; the entry keeps its
/// tokens so the returning commit can be matched against what was handed out.
#[derive(Debug)]
pub struct CacheEntry {
    model_key: ModelKey,
    tokens: Vec<TokenId>,
    states: Option<LayerStates>,
    lease: Option<LeaseId>,
    created_at: Instant,
    last_accessed_at: Instant,
}

impl CacheEntry {
    /// # Panics
    /// If the state does not cover exactly `tokens.len()` positions.
    pub fn new(model_key: ModelKey, tokens: Vec<TokenId>, states: LayerStates, now: Instant) -> Self {
        let entry = CacheEntry {
            model_key,
            tokens,
            states: Some(states),
            lease: None,
            created_at: now,
            last_accessed_at: now,
        };
        entry.assert_consistent();
        entry
    }

    pub fn model_key(&self) -> &ModelKey {
        &self.model_key
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Attention state, or `None` while lent to a generation.
    pub fn states(&self) -> Option<&LayerStates> {
        self.states.as_ref()
    }

    pub fn is_lent(&self) -> bool {
        self.states.is_none()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_accessed_at(&self) -> Instant {
        self.last_accessed_at
    }

    /// Accessed less than `threshold` ago.
    pub fn is_fresh(&self, now: Instant, threshold: Duration) -> bool {
        now.saturating_duration_since(self.last_accessed_at) < threshold
    }

    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_accessed_at = now;
    }

    /// Drop the last `count` positions from both tokens and state.
    ///
    /// # Panics
    /// If the entry is lent or `count` exceeds its length.
    pub(crate) fn trim(&mut self, count: usize) {
        assert!(
            count <= self.tokens.len(),
            "cannot trim {count} of {} cached tokens",
            self.tokens.len()
        );
        let states = self
            .states
            .as_mut()
            .unwrap_or_else(|| panic!("cannot trim a lent cache entry"));
        if let Err(e) = states.trim(count) {
            panic!("cached state out of sync with tokens: {e}");
        }
        self.tokens.truncate(self.tokens.len() - count);
        self.assert_consistent();
    }

    /// Hand the state to a generation.
    pub(crate) fn lend(&mut self, lease: LeaseId) -> Option<LayerStates> {
        let states = self.states.take()?;
        self.lease = Some(lease);
        Some(states)
    }

    pub(crate) fn is_lent_to(&self, lease: LeaseId) -> bool {
        self.is_lent() && self.lease == Some(lease)
    }

    /// Take back lent state that now also covers `suffix`.
    pub(crate) fn restore(&mut self, suffix: &[TokenId], states: LayerStates, now: Instant) {
        self.tokens.extend_from_slice(suffix);
        self.states = Some(states);
        self.lease = None;
        self.last_accessed_at = now;
        self.assert_consistent();
    }

    /// Bytes allocated for the state, zero while lent.
    pub fn memory_bytes(&self) -> usize {
        self.states.as_ref().map_or(0, |s| s.memory_bytes())
    }

    fn assert_consistent(&self) {
        if let Some(states) = &self.states {
            assert_eq!(
                states.offset(),
                self.tokens.len(),
                "attention state covers {} positions but entry holds {} tokens",
                states.offset(),
                self.tokens.len()
            );
        }
    }
}
