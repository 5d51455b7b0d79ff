//! Token counting (C3 detail): per-model tokenizers with a heuristic
//! fallback, so memory's token accounting matches the provider's within a
//! small constant wherever a real tokenizer is available.

use std::sync::Arc;

use super::models::{ModelCatalog, TokenizerKind};

/// Counts tokens in raw text for a given model identifier.
pub trait TokenCounter: Send + Sync {
    fn count_text(&self, model: &str, text: &str) -> u32;
}

/// Default counter: `cl100k_base` for Claude/GPT-like models, chars/4 for
/// anything unrecognized.
pub struct DefaultTokenCounter {
    catalog: Arc<ModelCatalog>,
    cl100k: tiktoken_rs::CoreBPE,
}

impl DefaultTokenCounter {
    pub fn new(catalog: Arc<ModelCatalog>) -> Self {
        let cl100k = tiktoken_rs::cl100k_base().expect("failed to load cl100k tokenizer");
        Self { catalog, cl100k }
    }
}

impl TokenCounter for DefaultTokenCounter {
    fn count_text(&self, model: &str, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }
        let info = self.catalog.info_for(model);
        match info.tokenizer {
            TokenizerKind::Claude | TokenizerKind::GptLike => {
                self.cl100k.encode_ordinary(text).len() as u32
            }
            TokenizerKind::Heuristic => (text.chars().count() as f64 / 4.0).ceil() as u32,
        }
    }
}
