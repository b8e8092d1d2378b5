//! Shared test fixtures: a deterministic model, a numeric tokenizer and helpers.

#![allow(dead_code)]

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use promptcache::cache::ManualClock;
use promptcache::{
    CacheConfig, GenerateParameters, GenerationObserver, GenerationOrchestrator, LanguageModel,
    LayerStates, TokenId, Tokenizer,
};
use promptcache_engine::{DecodingState, EngineError, PromptInput};
use promptcache_kv::{KVShape, KVSlice};

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// How a [`CountingModel`] step should fail.
#[derive(Debug, Clone, Copy)]
pub enum Failure {
    /// Fail before touching the state.
    Clean,
    /// Append to the first layer only, then fail.
    Partial,
}

/// Writes each token's id into every layer and predicts `last cached token + 1`.
///
/// Optionally sleeps per step and fails on a chosen step (counted from 1).
pub struct CountingModel {
    layers: usize,
    steps: AtomicUsize,
    inputs: Mutex<Vec<Vec<TokenId>>>,
    fail_at: Mutex<Option<(usize, Failure)>>,
    delay: Duration,
}

impl CountingModel {
    pub fn new(layers: usize) -> Self {
        CountingModel {
            layers,
            steps: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
            fail_at: Mutex::new(None),
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the `step`-th decode step from now.
    pub fn fail_after(&self, steps_from_now: usize, failure: Failure) {
        let at = self.steps.load(Ordering::SeqCst) + steps_from_now;
        *self.fail_at.lock().unwrap() = Some((at, failure));
    }

    /// Token lists passed to every decode step so far.
    pub fn inputs(&self) -> Vec<Vec<TokenId>> {
        self.inputs.lock().unwrap().clone()
    }

    /// Total prompt and generated tokens fed through the model.
    pub fn tokens_processed(&self) -> usize {
        self.inputs.lock().unwrap().iter().map(|i| i.len()).sum()
    }

    pub fn clear_inputs(&self) {
        self.inputs.lock().unwrap().clear();
    }
}

fn append_all(state: &mut LayerStates, tokens: &[TokenId], only_first: bool) -> Result<(), EngineError> {
    let data: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
    let shape = KVShape::new(1, 2, tokens.len(), 1);
    let data: Vec<f32> = data.iter().chain(data.iter()).copied().collect();
    for (i, layer) in state.iter_mut().enumerate() {
        if only_first && i > 0 {
            break;
        }
        layer.append(KVSlice::new(&data, shape)?, KVSlice::new(&data, shape)?)?;
    }
    Ok(())
}

impl LanguageModel for CountingModel {
    fn name(&self) -> &str {
        "counting"
    }

    fn layer_count(&self) -> usize {
        self.layers
    }

    fn decode_step(
        &self,
        tokens: &[TokenId],
        _params: &GenerateParameters,
        state: &mut LayerStates,
    ) -> Result<TokenId, EngineError> {
        let step = self.steps.fetch_add(1, Ordering::SeqCst) + 1;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let failure = {
            let mut fail_at = self.fail_at.lock().unwrap();
            match *fail_at {
                Some((at, failure)) if at == step => {
                    *fail_at = None;
                    Some(failure)
                }
                _ => None,
            }
        };
        match failure {
            Some(Failure::Clean) => {
                return Err(EngineError::Inference(format!("injected failure at step {step}")))
            }
            Some(Failure::Partial) => {
                append_all(state, tokens, true)?;
                return Err(EngineError::Inference(format!("injected failure at step {step}")));
            }
            None => {}
        }

        self.inputs.lock().unwrap().push(tokens.to_vec());
        append_all(state, tokens, false)?;

        let last = state
            .layer(0)
            .and_then(|l| l.views())
            .filter(|(keys, _)| !keys.is_empty())
            .map(|(keys, _)| keys.get(0, 0, keys.len() - 1, 0))
            .ok_or_else(|| EngineError::Inference("nothing to continue from".to_string()))?;
        Ok(last as TokenId + 1)
    }
}

/// Tokenizes whitespace-separated integers.
///
/// Chat messages become a role marker (`system` 1000, `user` 1001,
/// `assistant` 1002) followed by their numbers. Negative ids cannot be decoded.
pub struct NumericTokenizer;

fn role_marker(role: &str) -> TokenId {
    match role {
        "system" => 1000,
        "user" => 1001,
        "assistant" => 1002,
        _ => 1003,
    }
}

fn parse(text: &str) -> Result<Vec<TokenId>, EngineError> {
    text.split_whitespace()
        .map(|w| {
            w.parse::<TokenId>()
                .map_err(|_| EngineError::Tokenization(format!("not a number: {w}")))
        })
        .collect()
}

impl Tokenizer for NumericTokenizer {
    fn encode(&self, input: &PromptInput) -> Result<Vec<TokenId>, EngineError> {
        match input {
            PromptInput::Text(text) => parse(text),
            PromptInput::Chat(messages) => {
                let mut ids = Vec::new();
                for m in messages {
                    ids.push(role_marker(&m.role));
                    ids.extend(parse(&m.content)?);
                }
                Ok(ids)
            }
        }
    }

    fn decode_token(
        &self,
        token: TokenId,
        state: &mut DecodingState,
    ) -> Result<Option<String>, EngineError> {
        if token < 0 {
            return Err(EngineError::Tokenization(format!("token {token} has no text")));
        }
        let chunk = if state.emitted_any() {
            format!(" {token}")
        } else {
            token.to_string()
        };
        state.push(&chunk);
        Ok(Some(chunk))
    }
}

pub struct Fixture {
    pub model: Arc<CountingModel>,
    pub clock: ManualClock,
    pub orchestrator: GenerationOrchestrator,
}

pub fn fixture() -> Fixture {
    fixture_with(CountingModel::new(2), CacheConfig::default().with_growth_step(8))
}

pub fn fixture_with(model: CountingModel, config: CacheConfig) -> Fixture {
    init_tracing();
    let model = Arc::new(model);
    let clock = ManualClock::new();
    let orchestrator = GenerationOrchestrator::with_clock(
        model.clone(),
        Arc::new(NumericTokenizer),
        config,
        Arc::new(clock.clone()),
    )
    .unwrap();
    Fixture {
        model,
        clock,
        orchestrator,
    }
}

/// Collects chunks and optionally stops after a number of them.
#[derive(Default)]
pub struct Collector {
    pub chunks: Vec<String>,
    pub stop_after: Option<usize>,
}

impl Collector {
    pub fn stopping_after(n: usize) -> Self {
        Collector {
            chunks: Vec::new(),
            stop_after: Some(n),
        }
    }

    pub fn text(&self) -> String {
        self.chunks.concat()
    }
}

impl GenerationObserver for Collector {
    fn on_chunk(&mut self, chunk: String) -> ControlFlow<()> {
        self.chunks.push(chunk);
        match self.stop_after {
            Some(n) if self.chunks.len() >= n => ControlFlow::Break(()),
            _ => ControlFlow::Continue(()),
        }
    }
}
