//! Incremental prompt caching.
//!
//! A single cached token sequence and the attention state that covers it.
//! Each new prompt reuses the longest common prefix with the cached sequence,
//! so only the differing suffix has to go through the model.

mod clock;
mod entry;
mod manager;
mod prefix;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use entry::CacheEntry;
pub use manager::{CacheManager, CommitRequest, LeaseTicket, Lookup, StateLease};
pub use prefix::{common_prefix_len, PrefixMatch};
pub use stats::{CacheStats, CacheStatus};
