//! Error types for the promptcache crate.

use promptcache_engine::{EngineError, KVError};
use thiserror::Error;

/// Top-level error type for prompt cache operations.
#[derive(Error, Debug)]
pub enum PromptCacheError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Attention state error: {0}")]
    State(#[from] KVError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Prompt cache actor is not running")]
    ActorClosed,
}

pub type Result<T> = std::result::Result<T, PromptCacheError>;
