//! Integration tests for promptcache-engine contracts.
//!
//! Validates:
//! - LanguageModel can be implemented by mock backends and used as a trait object
//! - Default `new_empty_state` and `extend_state` behave as the cache expects
//! - GenerateParameters deserialize with defaults
//! - Error types display correctly and carry context

use promptcache_engine::*;
use promptcache_kv::{KVShape, KVSlice};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Mock Backends
// ---------------------------------------------------------------------------

/// Writes each token's id into every layer and predicts `last + 1`.
struct CountingModel {
    layers: usize,
    steps: AtomicUsize,
}

impl CountingModel {
    fn new(layers: usize) -> Self {
        Self {
            layers,
            steps: AtomicUsize::new(0),
        }
    }
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
    ) -> Result<TokenId> {
        self.steps.fetch_add(1, Ordering::SeqCst);
        let data: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        let shape = KVShape::new(1, 1, tokens.len(), 1);
        for layer in state.iter_mut() {
            layer.append(KVSlice::new(&data, shape)?, KVSlice::new(&data, shape)?)?;
        }

        let (keys, _) = state
            .layer(0)
            .and_then(|l| l.views())
            .ok_or_else(|| EngineError::Inference("empty state".to_string()))?;
        if keys.is_empty() {
            return Err(EngineError::Inference("empty state".to_string()));
        }
        Ok(keys.get(0, 0, keys.len() - 1, 0) as TokenId + 1)
    }
}

/// A backend that always fails.
struct FailingModel;

impl LanguageModel for FailingModel {
    fn name(&self) -> &str {
        "failing"
    }

    fn layer_count(&self) -> usize {
        1
    }

    fn decode_step(
        &self,
        _tokens: &[TokenId],
        _params: &GenerateParameters,
        _state: &mut LayerStates,
    ) -> Result<TokenId> {
        Err(EngineError::Inference("no model loaded".to_string()))
    }
}

// ---------------------------------------------------------------------------
// LanguageModel
// ---------------------------------------------------------------------------

#[test]
fn empty_state_matches_layer_count() {
    let model = CountingModel::new(4);
    let state = model.new_empty_state(DEFAULT_GROWTH_STEP);
    assert_eq!(state.n_layers(), 4);
    assert_eq!(state.offset(), 0);
}

#[test]
fn decode_step_appends_to_every_layer() {
    let model = CountingModel::new(3);
    let mut state = model.new_empty_state(8);
    let next = model
        .decode_step(&[1, 2, 3], &GenerateParameters::default(), &mut state)
        .unwrap();
    assert_eq!(next, 4);
    assert_eq!(state.offset(), 3);
    assert!(state.iter().all(|l| l.capacity() == 8));
}

#[test]
fn decode_step_with_empty_tokens_continues_from_state() {
    let model = CountingModel::new(2);
    let mut state = model.new_empty_state(8);
    model
        .decode_step(&[5, 6], &GenerateParameters::default(), &mut state)
        .unwrap();
    let next = model
        .decode_step(&[], &GenerateParameters::default(), &mut state)
        .unwrap();
    assert_eq!(next, 7);
    assert_eq!(state.offset(), 2);
}

#[test]
fn extend_state_default_absorbs_tokens() {
    let model = CountingModel::new(2);
    let mut state = model.new_empty_state(8);
    model.extend_state(&[9, 10], &mut state).unwrap();
    assert_eq!(state.offset(), 2);
    assert_eq!(model.steps.load(Ordering::SeqCst), 1);
}

#[test]
fn models_work_as_trait_objects() {
    let models: Vec<Arc<dyn LanguageModel>> =
        vec![Arc::new(CountingModel::new(1)), Arc::new(FailingModel)];
    let names: Vec<&str> = models.iter().map(|m| m.name()).collect();
    assert_eq!(names, vec!["counting", "failing"]);
}

#[test]
fn failing_model_propagates_inference_error() {
    let model = FailingModel;
    let mut state = model.new_empty_state(DEFAULT_GROWTH_STEP);
    let err = model
        .decode_step(&[1], &GenerateParameters::default(), &mut state)
        .unwrap_err();
    assert!(matches!(err, EngineError::Inference(_)));
    assert_eq!(err.to_string(), "Inference failed: no model loaded");
}

#[test]
fn kv_errors_convert_into_engine_errors() {
    let err: EngineError = KVError::InvalidTrim {
        count: 3,
        offset: 1,
    }
    .into();
    assert!(matches!(err, EngineError::State(_)));
    assert!(err.to_string().contains("Cannot trim 3 positions"));
}

// ---------------------------------------------------------------------------
// Parameters and keys
// ---------------------------------------------------------------------------

#[test]
fn params_deserialize_with_defaults() {
    let params: GenerateParameters = serde_json::from_str(r#"{"max_tokens": 50}"#).unwrap();
    assert_eq!(params.max_tokens, 50);
    assert_eq!(params.temperature, 0.7);
    assert_eq!(params.top_p, 0.9);
    assert!(params.stop_tokens.is_empty());
}

#[test]
fn params_deserialize_stop_tokens() {
    let params: GenerateParameters =
        serde_json::from_str(r#"{"temperature": 0.0, "stop_tokens": [2]}"#).unwrap();
    assert!(params.is_stop_token(2));
    assert_eq!(params.temperature, 0.0);
}

#[test]
fn model_key_same_params_same_key() {
    let params = GenerateParameters::greedy();
    assert_eq!(ModelKey::new("m", &params), ModelKey::new("m", &params));
    assert_ne!(ModelKey::new("m", &params), ModelKey::new("n", &params));
}

#[test]
fn custom_model_key() {
    let key = ModelKey::custom("llama-3-8b/greedy");
    assert_eq!(key.to_string(), "llama-3-8b/greedy");
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[test]
fn tokenizer_as_trait_object() {
    let tok: Arc<dyn Tokenizer> = Arc::new(WhitespaceTokenizer::new());
    let ids = tok
        .encode(&PromptInput::Chat(vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hi"),
        ]))
        .unwrap();
    assert_eq!(ids.len(), 5);

    let mut state = DecodingState::new();
    let text: String = ids
        .iter()
        .filter_map(|&id| tok.decode_token(id, &mut state).unwrap())
        .collect();
    assert_eq!(text, "<|system|> be brief <|user|> hi");
}
