//! Single-slot prompt cache.
//!
//! Holds at most one [`CacheEntry`]. A lookup matches the incoming tokens
//! against it, trims the cached state back to the common prefix, and lends the
//! state to the generation. The generation hands it back through
//! [`CacheManager::commit`] together with every token it processed.
//!
//! If the slot changed while the state was out (cleared, replaced, or trimmed),
//! the commit stores a fresh entry instead of extending the old one.

use std::sync::Arc;

use promptcache_engine::{LayerStates, ModelKey, TokenId};
use tracing::{debug, info};

use super::clock::{Clock, SystemClock};
use super::entry::{CacheEntry, LeaseId};
use super::prefix::PrefixMatch;
use super::stats::{CacheStats, CacheStatus};
use crate::config::CacheConfig;

/// Proof that a generation borrowed the cached state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTicket {
    id: LeaseId,
    prior_tokens: usize,
}

impl LeaseTicket {
    /// Tokens the entry held when the state was lent.
    pub fn prior_tokens(&self) -> usize {
        self.prior_tokens
    }
}

/// Cached state lent to a generation.
#[derive(Debug)]
pub struct StateLease {
    ticket: LeaseTicket,
    states: LayerStates,
}

impl StateLease {
    pub fn ticket(&self) -> LeaseTicket {
        self.ticket
    }

    pub fn states(&self) -> &LayerStates {
        &self.states
    }

    pub fn into_parts(self) -> (LeaseTicket, LayerStates) {
        (self.ticket, self.states)
    }
}

/// Outcome of [`CacheManager::lookup`].
#[derive(Debug)]
pub struct Lookup {
    /// Suffix of the incoming tokens the model still has to process.
    pub tokens_to_process: Vec<TokenId>,
    /// Leading tokens already covered by the lent state.
    pub reused: usize,
    /// Present on a hit.
    pub lease: Option<StateLease>,
}

impl Lookup {
    pub fn is_hit(&self) -> bool {
        self.lease.is_some()
    }
}

/// Everything a finished generation hands back to the cache.
#[derive(Debug)]
pub struct CommitRequest {
    pub model_key: ModelKey,
    /// The complete sequence covered by `states`, prompt and generated tokens.
    pub tokens: Vec<TokenId>,
    pub states: LayerStates,
    /// Ticket from the lookup that lent `states`, if any.
    pub ticket: Option<LeaseTicket>,
}

pub struct CacheManager {
    slot: Option<CacheEntry>,
    config: CacheConfig,
    stats: CacheStats,
    clock: Arc<dyn Clock>,
    next_lease: LeaseId,
}

impl CacheManager {
    pub fn new(config: CacheConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        CacheManager {
            slot: None,
            config,
            stats: CacheStats::default(),
            clock,
            next_lease: 0,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Match `new_tokens` against the cached entry.
    ///
    /// On a hit the entry is trimmed to the common prefix and its state lent
    /// out. On a miss the entry is discarded and the whole input must be
    /// processed from scratch.
    pub fn lookup(&mut self, model_key: &ModelKey, new_tokens: &[TokenId]) -> Lookup {
        let now = self.clock.now();
        let freshness = self.config.freshness();

        let miss_reason = match self.slot.as_ref() {
            None => Some("no entry"),
            Some(_) if !self.config.enabled => Some("disabled"),
            Some(entry) if entry.model_key() != model_key => Some("model key mismatch"),
            Some(entry) if !entry.is_fresh(now, freshness) => Some("stale"),
            Some(entry) if entry.is_lent() => Some("entry still lent"),
            Some(_) => None,
        };
        if let Some(reason) = miss_reason {
            return self.miss(model_key, new_tokens, reason);
        }
        let Some(entry) = self.slot.as_mut() else {
            return self.miss(model_key, new_tokens, "no entry");
        };

        let matched = PrefixMatch::between(entry.tokens(), new_tokens);
        if matched.common == 0 {
            return self.miss(model_key, new_tokens, "no common prefix");
        }

        entry.touch(now);
        if !matched.is_extension() {
            entry.trim(matched.excess);
            self.stats.trims += 1;
            debug!(trimmed = matched.excess, cached = entry.len(), "trimmed cache entry");
        }

        let id = self.next_lease;
        self.next_lease += 1;
        let Some(states) = entry.lend(id) else {
            return self.miss(model_key, new_tokens, "entry still lent");
        };

        self.stats.hits += 1;
        self.stats.tokens_reused = matched.common;
        self.stats.total_tokens_reused += matched.common;
        debug!(
            model_key = %model_key,
            reused = matched.common,
            to_process = new_tokens.len() - matched.common,
            "prompt cache hit"
        );

        Lookup {
            tokens_to_process: new_tokens[matched.common..].to_vec(),
            reused: matched.common,
            lease: Some(StateLease {
                ticket: LeaseTicket {
                    id,
                    prior_tokens: matched.common,
                },
                states,
            }),
        }
    }

    fn miss(&mut self, model_key: &ModelKey, new_tokens: &[TokenId], reason: &str) -> Lookup {
        self.stats.misses += 1;
        self.stats.tokens_reused = 0;
        debug!(
            model_key = %model_key,
            reason,
            to_process = new_tokens.len(),
            "prompt cache miss"
        );
        self.invalidate();
        Lookup {
            tokens_to_process: new_tokens.to_vec(),
            reused: 0,
            lease: None,
        }
    }

    /// Store the state a generation ended with.
    ///
    /// Extends the lent entry in place when it is still the one handed out and
    /// unchanged; otherwise replaces the slot with a new entry.
    ///
    /// # Panics
    /// If `states` does not cover exactly `tokens.len()` positions.
    pub fn commit(&mut self, request: CommitRequest) {
        let CommitRequest {
            model_key,
            tokens,
            states,
            ticket,
        } = request;
        let now = self.clock.now();

        if let (Some(ticket), Some(entry)) = (ticket, self.slot.as_mut()) {
            if entry.is_lent_to(ticket.id)
                && entry.len() == ticket.prior_tokens
                && tokens.len() >= ticket.prior_tokens
                && entry.model_key() == &model_key
            {
                debug_assert_eq!(&tokens[..ticket.prior_tokens], entry.tokens());
                let appended = tokens.len() - ticket.prior_tokens;
                entry.restore(&tokens[ticket.prior_tokens..], states, now);
                debug!(appended, cached = entry.len(), "extended cache entry");
                return;
            }
        }

        if ticket.is_some() {
            info!("cache changed during generation, storing a fresh entry");
        }
        let entry = CacheEntry::new(model_key, tokens, states, now);
        debug!(cached = entry.len(), "stored new cache entry");
        self.slot = Some(entry);
    }

    /// Discard the cached entry.
    pub fn invalidate(&mut self) {
        if let Some(entry) = self.slot.take() {
            debug!(cached = entry.len(), "invalidated cache entry");
        }
        self.stats.resets += 1;
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn entry(&self) -> Option<&CacheEntry> {
        self.slot.as_ref()
    }

    pub fn status(&self) -> Option<CacheStatus> {
        let now = self.clock.now();
        self.slot.as_ref().map(|entry| {
            let states = entry.states();
            CacheStatus {
                model_key: entry.model_key().to_string(),
                cached_tokens: entry.len(),
                layers: states.map_or(0, |s| s.n_layers()),
                capacity: states.map_or(0, |s| s.capacity()),
                memory_bytes: entry.memory_bytes(),
                active_memory_bytes: states.map_or(0, |s| s.active_memory_bytes()),
                age: now.saturating_duration_since(entry.created_at()),
                idle: now.saturating_duration_since(entry.last_accessed_at()),
                lent: entry.is_lent(),
            }
        })
    }
}
