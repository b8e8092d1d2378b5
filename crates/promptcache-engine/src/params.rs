//! Decoding parameters and the cache identity key derived from them.

use std::fmt;

use serde::Deserialize;

use crate::TokenId;

/// Generation parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct GenerateParameters {
    /// Upper bound on generated tokens.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Temperature for softmax scaling (0.0 = greedy).
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Top-P (nucleus) threshold. 1.0 = disabled.
    #[serde(default = "default_top_p")]
    pub top_p: f32,

    /// Tokens that end generation.
    #[serde(default)]
    pub stop_tokens: Vec<TokenId>,
}

fn default_max_tokens() -> usize {
    256
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}

impl Default for GenerateParameters {
    fn default() -> Self {
        GenerateParameters {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            stop_tokens: Vec::new(),
        }
    }
}

impl GenerateParameters {
    /// Greedy decoding (temperature = 0).
    pub fn greedy() -> Self {
        GenerateParameters {
            temperature: 0.0,
            top_p: 1.0,
            ..Default::default()
        }
    }

    pub fn with_max_tokens(mut self, n: usize) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_stop_tokens(mut self, tokens: Vec<TokenId>) -> Self {
        self.stop_tokens = tokens;
        self
    }

    pub fn is_stop_token(&self, token: TokenId) -> bool {
        self.stop_tokens.contains(&token)
    }
}

/// Identity of the model and the decoding parameters that make cached state reusable.
///
/// Two generations may share cached state only when their keys are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelKey(String);

impl ModelKey {
    /// Key combining the model name with temperature and top-p.
    pub fn new(model_name: &str, params: &GenerateParameters) -> Self {
        ModelKey(format!(
            "{model_name}-{}-{}",
            params.temperature, params.top_p
        ))
    }

    /// Caller-supplied key.
    pub fn custom(key: impl Into<String>) -> Self {
        ModelKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
