//! Longest-common-prefix matching between token sequences.

use promptcache_engine::TokenId;

/// Length of the longest common prefix of `cached` and `incoming`.
///
/// Exact element-wise equality only; comparison stops at the first mismatch.
pub fn common_prefix_len(cached: &[TokenId], incoming: &[TokenId]) -> usize {
    cached
        .iter()
        .zip(incoming)
        .take_while(|(a, b)| a == b)
        .count()
}

/// Result of matching an incoming sequence against a cached one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixMatch {
    /// Positions shared by both sequences.
    pub common: usize,
    /// Cached positions past the common prefix that must be dropped.
    pub excess: usize,
}

impl PrefixMatch {
    pub fn between(cached: &[TokenId], incoming: &[TokenId]) -> Self {
        let common = common_prefix_len(cached, incoming);
        PrefixMatch {
            common,
            excess: cached.len() - common,
        }
    }

    /// The incoming sequence fully extends the cached one.
    pub fn is_extension(&self) -> bool {
        self.excess == 0
    }
}
