//! Generation with prompt caching.
//!
//! One request moves through these phases:
//! - **PrepareInput**: tokenize the structured prompt.
//! - **LookupCache**: reuse the longest cached prefix, leaving only the suffix.
//! - **DecodeLoop**: feed the suffix (possibly empty) and then each generated
//!   token back into the model, streaming text chunks out.
//! - **Commit**: hand the attention state and every processed token back to the cache.
//!
//! The commit also runs after cancellation and after a failed step, so the
//! cache keeps whatever prefix the state actually covers.

pub mod actor;

use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, Instant};

use promptcache_engine::{
    DecodingState, EngineError, GenerateParameters, KVError, LanguageModel, LayerStates,
    ModelKey, PromptInput, TokenId, Tokenizer,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn};
use uuid::Uuid;

use crate::cache::{CacheManager, CacheStats, CacheStatus, Clock, CommitRequest, SystemClock};
use crate::config::CacheConfig;
use crate::error::Result;

/// Where a generation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    PrepareInput,
    LookupCache,
    DecodeLoop,
    Cancelled,
    Commit,
    Done,
}

/// Why the decode loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model produced a stop token.
    Stop,
    /// `max_tokens` reached.
    Length,
    /// Cancelled by the caller or the consumer.
    Cancelled,
    /// A model or detokenizer step failed.
    Failed,
}

/// A single generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub input: PromptInput,
    pub params: GenerateParameters,
    /// Overrides the key derived from the model name and sampling parameters.
    pub model_key: Option<ModelKey>,
}

impl GenerationRequest {
    pub fn new(input: impl Into<PromptInput>, params: GenerateParameters) -> Self {
        GenerationRequest {
            input: input.into(),
            params,
            model_key: None,
        }
    }

    pub fn with_model_key(mut self, key: ModelKey) -> Self {
        self.model_key = Some(key);
        self
    }

    fn key_for(&self, model_name: &str) -> ModelKey {
        self.model_key
            .clone()
            .unwrap_or_else(|| ModelKey::new(model_name, &self.params))
    }
}

/// Statistics from a generation run.
#[derive(Debug, Clone)]
pub struct GenerationStats {
    pub request_id: Uuid,

    /// Tokens in the tokenized prompt.
    pub prompt_tokens: usize,

    /// Prompt tokens served from the cache.
    pub reused_tokens: usize,

    /// Prompt tokens the model had to process.
    pub processed_tokens: usize,

    /// Tokens generated, including a trailing stop token.
    pub generated_tokens: usize,

    pub finish_reason: FinishReason,

    /// Time from request start to the first generated token.
    pub time_to_first_token_ms: Option<f64>,

    /// Time spent in the decode loop in milliseconds.
    pub decode_time_ms: f64,

    /// Generated tokens per second of decode time.
    pub tokens_per_second: f64,

    /// Tokens held by the cache after the commit.
    pub cached_tokens: usize,
}

/// Receives the output of a running generation.
pub trait GenerationObserver {
    /// Called with each decoded text chunk. `Break` cancels the generation.
    fn on_chunk(&mut self, chunk: String) -> ControlFlow<()>;

    /// Called before every decode step with access to the cache.
    fn between_tokens(&mut self, _cache: &mut CacheManager) {}

    fn on_phase(&mut self, _phase: GenerationPhase) {}
}

impl<F> GenerationObserver for F
where
    F: FnMut(String) -> ControlFlow<()>,
{
    fn on_chunk(&mut self, chunk: String) -> ControlFlow<()> {
        self(chunk)
    }
}

/// Result of the decode loop.
struct DecodeRun {
    generated: Vec<TokenId>,
    finish: FinishReason,
    error: Option<EngineError>,
    first_token_at: Option<Instant>,
    decode_time: Duration,
}

/// Owns the model, tokenizer and cache, and runs generations one at a time.
pub struct GenerationOrchestrator {
    model: Arc<dyn LanguageModel>,
    tokenizer: Arc<dyn Tokenizer>,
    cache: CacheManager,
    config: CacheConfig,
}

impl GenerationOrchestrator {
    pub fn new(
        model: Arc<dyn LanguageModel>,
        tokenizer: Arc<dyn Tokenizer>,
        config: CacheConfig,
    ) -> Result<Self> {
        Self::with_clock(model, tokenizer, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        model: Arc<dyn LanguageModel>,
        tokenizer: Arc<dyn Tokenizer>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(GenerationOrchestrator {
            model,
            tokenizer,
            cache: CacheManager::with_clock(config.clone(), clock),
            config,
        })
    }

    /// Run one generation to completion.
    ///
    /// Text chunks go to `observer` as they are decoded. Cancellation through
    /// `cancel` or the observer still commits the tokens produced so far.
    /// A failed model or detokenizer step commits the covered prefix and then
    /// returns the error.
    pub fn generate(
        &mut self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
        observer: &mut dyn GenerationObserver,
    ) -> Result<GenerationStats> {
        let request_id = Uuid::new_v4();
        let span = info_span!("generate", request_id = %request_id);
        let _enter = span.enter();
        let started = Instant::now();

        observer.on_phase(GenerationPhase::PrepareInput);
        let prompt = self.tokenizer.encode(&request.input)?;
        let model_key = request.key_for(self.model.name());
        debug!(prompt_tokens = prompt.len(), model_key = %model_key, "prepared input");

        observer.on_phase(GenerationPhase::LookupCache);
        let lookup = self.cache.lookup(&model_key, &prompt);
        let reused = lookup.reused;
        let processed = lookup.tokens_to_process.len();
        let (ticket, mut state) = match lookup.lease {
            Some(lease) => {
                let (ticket, state) = lease.into_parts();
                (Some(ticket), state)
            }
            None => (None, self.model.new_empty_state(self.config.growth_step)),
        };
        if state.n_layers() != self.model.layer_count() {
            let err = KVError::LayerCountMismatch {
                expected: self.model.layer_count(),
                got: state.n_layers(),
            };
            warn!(error = %err, model = self.model.name(), "discarding attention state");
            self.cache.invalidate();
            return Err(err.into());
        }

        observer.on_phase(GenerationPhase::DecodeLoop);
        let run = self.decode_loop(
            &lookup.tokens_to_process,
            &request.params,
            &mut state,
            cancel,
            observer,
        );
        if run.finish == FinishReason::Cancelled {
            observer.on_phase(GenerationPhase::Cancelled);
        }

        observer.on_phase(GenerationPhase::Commit);
        let mut tokens = prompt;
        tokens.extend_from_slice(&run.generated);
        if !state.is_synchronized() {
            warn!("layer offsets diverged, trimming to the shortest layer");
        }
        let covered = state.reconcile();
        assert!(
            covered <= tokens.len(),
            "attention state covers {covered} positions but only {} tokens were seen",
            tokens.len()
        );
        if covered < tokens.len() {
            debug!(
                covered,
                seen = tokens.len(),
                "committing the prefix covered by the attention state"
            );
            tokens.truncate(covered);
        }
        self.cache.commit(CommitRequest {
            model_key,
            tokens,
            states: state,
            ticket,
        });
        let cached_tokens = covered;
        observer.on_phase(GenerationPhase::Done);

        let generated = run.generated.len();
        let decode_secs = run.decode_time.as_secs_f64();
        let stats = GenerationStats {
            request_id,
            prompt_tokens: reused + processed,
            reused_tokens: reused,
            processed_tokens: processed,
            generated_tokens: generated,
            finish_reason: run.finish,
            time_to_first_token_ms: run
                .first_token_at
                .map(|t| t.duration_since(started).as_secs_f64() * 1000.0),
            decode_time_ms: decode_secs * 1000.0,
            tokens_per_second: if decode_secs > 0.0 {
                generated as f64 / decode_secs
            } else {
                0.0
            },
            cached_tokens,
        };

        if let Some(err) = run.error {
            warn!(error = %err, cached_tokens, "generation failed");
            return Err(err.into());
        }
        info!(
            reused = stats.reused_tokens,
            processed = stats.processed_tokens,
            generated = stats.generated_tokens,
            finish = ?stats.finish_reason,
            tokens_per_second = stats.tokens_per_second,
            "generation finished"
        );
        Ok(stats)
    }

    fn decode_loop(
        &mut self,
        suffix: &[TokenId],
        params: &GenerateParameters,
        state: &mut LayerStates,
        cancel: &CancellationToken,
        observer: &mut dyn GenerationObserver,
    ) -> DecodeRun {
        let model = Arc::clone(&self.model);
        let tokenizer = Arc::clone(&self.tokenizer);
        let decode_start = Instant::now();

        let mut decoding = DecodingState::new();
        let mut generated = Vec::new();
        let mut input = suffix.to_vec();
        let mut first_token_at = None;
        let mut error = None;

        let finish = loop {
            if generated.len() >= params.max_tokens {
                break FinishReason::Length;
            }
            if cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }
            observer.between_tokens(&mut self.cache);
            if cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }

            let token = match model.decode_step(&input, params, state) {
                Ok(token) => token,
                Err(e) => {
                    error = Some(e);
                    break FinishReason::Failed;
                }
            };
            first_token_at.get_or_insert_with(Instant::now);
            generated.push(token);
            input.clear();
            input.push(token);
            trace!(token, "decoded");

            if params.is_stop_token(token) {
                break FinishReason::Stop;
            }
            match tokenizer.decode_token(token, &mut decoding) {
                Ok(Some(chunk)) => {
                    if observer.on_chunk(chunk).is_break() {
                        break FinishReason::Cancelled;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error = Some(e);
                    break FinishReason::Failed;
                }
            }
        };

        // The last generated token has not been fed back yet.
        if finish != FinishReason::Failed && !generated.is_empty() {
            if let Err(e) = model.extend_state(&input, state) {
                // Commit reconciles the layers and drops the token.
                warn!(
                    error = %e,
                    token = input[0],
                    "could not absorb final token, it will not be cached"
                );
            }
        }

        DecodeRun {
            generated,
            finish,
            error,
            first_token_at,
            decode_time: decode_start.elapsed(),
        }
    }

    /// Discard the cached entry.
    pub fn clear_cache(&mut self) {
        info!("clearing prompt cache");
        self.cache.invalidate();
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats().clone()
    }

    pub fn cache_status(&self) -> Option<CacheStatus> {
        self.cache.status()
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut CacheManager {
        &mut self.cache
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }
}
