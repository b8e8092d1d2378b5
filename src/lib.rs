//! Incremental prompt caching for autoregressive language model inference.
//!
//! Keeps the attention state of the last processed token sequence and reuses
//! its longest common prefix with the next prompt, so only the new suffix goes
//! through the model.
//!
//! - [`cache`]: prefix matching and the single-slot cache
//! - [`engine`]: the generation orchestrator and its actor
//! - [`promptcache_kv`]: growable per-layer attention state
//! - [`promptcache_engine`]: the model and tokenizer contracts

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;

pub use cache::{CacheManager, CacheStats, CacheStatus, Clock, SystemClock};
pub use config::CacheConfig;
pub use engine::actor::{OrchestratorHandle, TextStream};
pub use engine::{
    FinishReason, GenerationObserver, GenerationOrchestrator, GenerationPhase, GenerationRequest,
    GenerationStats,
};
pub use error::{PromptCacheError, Result};
pub use promptcache_engine::{
    ChatMessage, GenerateParameters, LanguageModel, ModelKey, PromptInput, TokenId, Tokenizer,
};
pub use promptcache_kv::{AttentionStateBuffer, LayerStates};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
