//! Tokenization contracts.
//!
//! - `Tokenizer`: prompt encoding and incremental detokenization
//! - Structured prompt input (plain text or chat history)
//! - Streaming decoding state carried across calls
//! - `WhitespaceTokenizer`, a vocabulary-building tokenizer for tests and demos

use std::collections::HashMap;
use std::sync::RwLock;

use crate::{EngineError, Result, TokenId};

/// A chat message with role and content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".into(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "assistant".into(),
            content: content.into(),
        }
    }
}

/// Structured input to a generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptInput {
    Text(String),
    Chat(Vec<ChatMessage>),
}

impl From<&str> for PromptInput {
    fn from(text: &str) -> Self {
        PromptInput::Text(text.to_string())
    }
}

impl From<String> for PromptInput {
    fn from(text: String) -> Self {
        PromptInput::Text(text)
    }
}

impl From<Vec<ChatMessage>> for PromptInput {
    fn from(messages: Vec<ChatMessage>) -> Self {
        PromptInput::Chat(messages)
    }
}

/// Core tokenizer trait. Implementations can be swapped without changing the cache.
pub trait Tokenizer: Send + Sync {
    /// Encode structured input (including any chat template) into token IDs.
    fn encode(&self, input: &PromptInput) -> Result<Vec<TokenId>>;

    /// Decode one generated token, carrying partial state between calls.
    ///
    /// Returns `None` when the token does not complete a printable chunk yet.
    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> Result<Option<String>>;
}

/// Streaming decoding state for one generation.
#[derive(Debug, Clone, Default)]
pub struct DecodingState {
    buffer: String,
    emitted_any: bool,
}

impl DecodingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// Record an emitted chunk.
    pub fn push(&mut self, chunk: &str) {
        self.buffer.push_str(chunk);
        self.emitted_any = true;
    }

    pub fn emitted_any(&self) -> bool {
        self.emitted_any
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.emitted_any = false;
    }
}

/// Reference whitespace tokenizer for testing.
///
/// - Splits on whitespace, assigning IDs in first-seen order
/// - Renders chat messages as `<|role|>` markers followed by content words
/// - Deterministic for a given sequence of inputs
pub struct WhitespaceTokenizer {
    state: RwLock<VocabState>,
}

#[derive(Debug, Default)]
struct VocabState {
    vocab: HashMap<TokenId, String>,
    reverse_vocab: HashMap<String, TokenId>,
    next_id: TokenId,
}

impl WhitespaceTokenizer {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(VocabState::default()),
        }
    }

    /// Look up a word's ID, if it has been seen.
    pub fn token_id(&self, word: &str) -> Option<TokenId> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.reverse_vocab.get(word).copied())
    }

    pub fn vocab_size(&self) -> usize {
        self.state.read().map(|s| s.vocab.len()).unwrap_or(0)
    }

    fn encode_words<'a>(&self, words: impl Iterator<Item = &'a str>) -> Result<Vec<TokenId>> {
        let mut state = self
            .state
            .write()
            .map_err(|_| EngineError::Tokenization("tokenizer lock poisoned".to_string()))?;

        let mut ids = Vec::new();
        for word in words {
            let id = if let Some(id) = state.reverse_vocab.get(word) {
                *id
            } else {
                let id = state.next_id;
                state.next_id += 1;
                state.reverse_vocab.insert(word.to_string(), id);
                state.vocab.insert(id, word.to_string());
                id
            };
            ids.push(id);
        }
        Ok(ids)
    }
}

impl Default for WhitespaceTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer for WhitespaceTokenizer {
    fn encode(&self, input: &PromptInput) -> Result<Vec<TokenId>> {
        match input {
            PromptInput::Text(text) => self.encode_words(text.split_whitespace()),
            PromptInput::Chat(messages) => {
                let rendered: Vec<String> = messages
                    .iter()
                    .map(|m| format!("<|{}|> {}", m.role, m.content))
                    .collect();
                self.encode_words(rendered.iter().flat_map(|m| m.split_whitespace()))
            }
        }
    }

    fn decode_token(&self, token: TokenId, state: &mut DecodingState) -> Result<Option<String>> {
        let word = {
            let vocab = self
                .state
                .read()
                .map_err(|_| EngineError::Tokenization("tokenizer lock poisoned".to_string()))?;
            vocab
                .vocab
                .get(&token)
                .cloned()
                .ok_or_else(|| EngineError::Tokenization(format!("invalid token id {token}")))?
        };

        let chunk = if state.emitted_any() {
            format!(" {word}")
        } else {
            word
        };
        state.push(&chunk);
        Ok(Some(chunk))
    }
}
