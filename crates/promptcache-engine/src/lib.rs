//! # promptcache-engine
//!
//! The contracts the prompt cache consumes from the surrounding inference stack.
//! Tokenization, detokenization and model execution stay opaque; the cache only
//! needs the traits defined here.
//!
//! ## Design Notes
//!
//! ### State ownership
//! [`LanguageModel::decode_step`] receives `&mut LayerStates`. The caller owns the
//! attention state and lends it for the duration of one step, so the model can append
//! to every layer without keeping a reference of its own.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are logically
//! non-negative.

mod params;
mod tokenizer;

pub use params::{GenerateParameters, ModelKey};
pub use promptcache_kv::{KVError, LayerStates, DEFAULT_GROWTH_STEP};
pub use tokenizer::{ChatMessage, DecodingState, PromptInput, Tokenizer, WhitespaceTokenizer};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Error type for the consumed capabilities.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Attention state error: {0}")]
    State(#[from] KVError),
}

/// Opaque model execution.
///
/// Implementations append the attention state of the tokens they are given to
/// every layer of `state`, then produce the next token.
pub trait LanguageModel: Send + Sync {
    /// Model identity used to build cache keys.
    fn name(&self) -> &str;

    /// Number of transformer layers; the state handed to the model has exactly this many.
    fn layer_count(&self) -> usize;

    /// Allocate zero-length state matching the model architecture.
    fn new_empty_state(&self, step: usize) -> LayerStates {
        LayerStates::with_step(self.layer_count(), step)
    }

    /// Run one unit of model execution.
    ///
    /// `tokens` is empty when `state` already covers the whole prompt; the model
    /// then continues from the last cached position.
    fn decode_step(
        &self,
        tokens: &[TokenId],
        params: &GenerateParameters,
        state: &mut LayerStates,
    ) -> Result<TokenId>;

    /// Absorb `tokens` into `state` without keeping a sampled token.
    fn extend_state(&self, tokens: &[TokenId], state: &mut LayerStates) -> Result<()> {
        self.decode_step(tokens, &GenerateParameters::greedy(), state)
            .map(|_| ())
    }
}
