//! Tokenizers and chat templating.
//!
//! The engine only needs to turn chat turns into prompt tokens and to decode
//! single tokens for display. [`ChatTokenizer`] is that boundary.
//! [`HfChatTokenizer`] wraps a HuggingFace `tokenizer.json` with the Gemma
//! turn template; [`WordTokenizer`] is a whitespace vocabulary for demos and
//! tests.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;

use crate::error::{Error, Result};
use crate::Token;

/// Speaker of a chat turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Model,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Gemma has no system role; a system preamble is folded into the first
/// user turn.
fn fold_system_turns(turns: &[ChatTurn]) -> Vec<ChatTurn> {
    let mut preamble = Vec::new();
    let mut folded: Vec<ChatTurn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match turn.role {
            Role::System => preamble.push(turn.content.as_str()),
            Role::User if !preamble.is_empty() => {
                let content = format!("{}\n\n{}", preamble.join("\n\n"), turn.content);
                preamble.clear();
                folded.push(ChatTurn::user(content));
            }
            _ => folded.push(turn.clone()),
        }
    }
    folded
}

/// Prompt encoding and display decoding.
pub trait ChatTokenizer: Send {
    /// Encode turns with the model's chat template, ending with the
    /// generation prompt for the model's reply.
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<Vec<Token>>;

    /// Decode tokens to text.
    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String>;

    /// End-of-turn token, if the vocabulary defines one.
    fn eot_token_id(&self) -> Option<Token> {
        None
    }
}

const START_OF_TURN: &str = "<start_of_turn>";
const END_OF_TURN: &str = "<end_of_turn>";

/// HuggingFace tokenizer with the Gemma chat template.
pub struct HfChatTokenizer {
    inner: Tokenizer,
}

impl HfChatTokenizer {
    pub fn new(inner: Tokenizer) -> Self {
        Self { inner }
    }

    /// Load a `tokenizer.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let inner = Tokenizer::from_file(path.as_ref())
            .map_err(|e| Error::Tokenization(format!("failed to load tokenizer: {e}")))?;
        Ok(Self::new(inner))
    }

    /// Render turns as Gemma chat markup.
    pub fn render(turns: &[ChatTurn]) -> String {
        let mut text = String::from("<bos>");
        for turn in fold_system_turns(turns) {
            let role = match turn.role {
                Role::Model => "model",
                _ => "user",
            };
            text.push_str(&format!(
                "{START_OF_TURN}{role}\n{}{END_OF_TURN}\n",
                turn.content.trim()
            ));
        }
        text.push_str(START_OF_TURN);
        text.push_str("model\n");
        text
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

impl ChatTokenizer for HfChatTokenizer {
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<Vec<Token>> {
        let text = Self::render(turns);
        let encoding = self
            .inner
            .encode(text.as_str(), false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        let ids = encoding.get_ids().to_vec();
        if ids.is_empty() {
            return Err(Error::Tokenization("Empty prompt".to_string()));
        }
        Ok(ids)
    }

    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String> {
        self.inner
            .decode(tokens, skip_special)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    fn eot_token_id(&self) -> Option<Token> {
        self.inner.token_to_id(END_OF_TURN)
    }
}

/// Whitespace tokenizer over a fixed word list.
///
/// Ids `0..FIRST_WORD_ID` are reserved: `<unk>`, `<start_of_turn>`,
/// `<end_of_turn>`, `user`, `model`. Decoded words carry a leading space so
/// that concatenating single-token decodes reads as text.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    words: Vec<String>,
    ids: HashMap<String, Token>,
}

impl WordTokenizer {
    pub const UNK: Token = 0;
    pub const START_OF_TURN: Token = 1;
    pub const END_OF_TURN: Token = 2;
    pub const FIRST_WORD_ID: Token = 5;

    pub fn new<I, S>(words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let reserved = ["<unk>", START_OF_TURN, END_OF_TURN, "user", "model"];
        let mut all: Vec<String> = reserved.iter().map(|w| w.to_string()).collect();
        for word in words {
            let word = word.into();
            if !all.contains(&word) {
                all.push(word);
            }
        }
        let ids = all
            .iter()
            .enumerate()
            .map(|(i, w)| (w.clone(), i as Token))
            .collect();
        Self { words: all, ids }
    }

    pub fn vocab_size(&self) -> usize {
        self.words.len()
    }

    pub fn token_to_id(&self, word: &str) -> Token {
        self.ids.get(word).copied().unwrap_or(Self::UNK)
    }

    fn is_special(token: Token) -> bool {
        matches!(token, Self::UNK | Self::START_OF_TURN | Self::END_OF_TURN)
    }
}

impl ChatTokenizer for WordTokenizer {
    fn apply_chat_template(&self, turns: &[ChatTurn]) -> Result<Vec<Token>> {
        let mut ids = Vec::new();
        for turn in fold_system_turns(turns) {
            ids.push(Self::START_OF_TURN);
            ids.push(match turn.role {
                Role::Model => self.token_to_id("model"),
                _ => self.token_to_id("user"),
            });
            ids.extend(turn.content.split_whitespace().map(|w| self.token_to_id(w)));
            ids.push(Self::END_OF_TURN);
        }
        ids.push(Self::START_OF_TURN);
        ids.push(self.token_to_id("model"));
        Ok(ids)
    }

    fn decode(&self, tokens: &[Token], skip_special: bool) -> Result<String> {
        let mut text = String::new();
        for &token in tokens {
            let word = self.words.get(token as usize).ok_or_else(|| {
                Error::Tokenization(format!(
                    "token {token} outside vocabulary of {}",
                    self.words.len()
                ))
            })?;
            if skip_special && Self::is_special(token) {
                continue;
            }
            text.push(' ');
            text.push_str(word);
        }
        Ok(text)
    }

    fn eot_token_id(&self) -> Option<Token> {
        Some(Self::END_OF_TURN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gemma_template() {
        let text = HfChatTokenizer::render(&[ChatTurn::system("be brief"), ChatTurn::user("hi")]);
        assert_eq!(
            text,
            "<bos><start_of_turn>user\nbe brief\n\nhi<end_of_turn>\n<start_of_turn>model\n"
        );
    }

    #[test]
    fn test_word_tokenizer_template() {
        let tok = WordTokenizer::new(["the", "cat"]);
        let ids = tok.apply_chat_template(&[ChatTurn::user("the cat sat")]).unwrap();
        // <sot> user the cat <unk> <eot> <sot> model
        assert_eq!(ids, vec![1, 3, 5, 6, 0, 2, 1, 4]);
    }

    #[test]
    fn test_word_tokenizer_decode() {
        let tok = WordTokenizer::new(["the", "cat"]);
        assert_eq!(tok.decode(&[5, 6, 2], true).unwrap(), " the cat");
        assert_eq!(tok.decode(&[5, 2], false).unwrap(), " the <end_of_turn>");
        assert!(tok.decode(&[99], true).is_err());
    }
}
