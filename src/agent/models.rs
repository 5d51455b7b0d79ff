//! Model metadata: context windows and tokenizer selection for the models
//! the reference [`crate::agent::anthropic::AnthropicProvider`] speaks, plus
//! an "unknown" fallback used for anything else.

use std::collections::HashMap;

/// Tokenizer family used to estimate a model's token count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerKind {
    /// Claude and other GPT-like BPE tokenizers, approximated with cl100k.
    Claude,
    GptLike,
    /// Fallback heuristic (chars / 4) for unrecognized models.
    Heuristic,
}

/// Metadata about a specific model.
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub max_context_tokens: u32,
    pub default_max_output_tokens: u32,
    pub tokenizer: TokenizerKind,
    pub supports_thinking: bool,
}

impl ModelInfo {
    pub fn new(
        name: impl Into<String>,
        max_context_tokens: u32,
        default_max_output_tokens: u32,
        tokenizer: TokenizerKind,
    ) -> Self {
        Self {
            name: name.into(),
            max_context_tokens,
            default_max_output_tokens,
            tokenizer,
            supports_thinking: false,
        }
    }

    pub fn with_thinking(mut self) -> Self {
        self.supports_thinking = true;
        self
    }
}

/// Catalog of known models, keyed by name, with a heuristic fallback for
/// anything not registered.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: HashMap<String, ModelInfo>,
}

impl ModelCatalog {
    pub fn new() -> Self {
        let mut catalog = Self {
            models: HashMap::new(),
        };
        catalog.seed_defaults();
        catalog
    }

    pub fn get(&self, model: &str) -> Option<&ModelInfo> {
        self.models.get(model)
    }

    /// Model info, falling back to a conservative heuristic entry for
    /// anything not in the catalog.
    pub fn info_for(&self, model: &str) -> ModelInfo {
        self.get(model).cloned().unwrap_or_else(|| {
            ModelInfo::new(model, 128_000, 4_096, TokenizerKind::Heuristic)
        })
    }

    pub fn register(&mut self, info: ModelInfo) {
        self.models.insert(info.name.clone(), info);
    }

    pub fn list(&self) -> Vec<&str> {
        self.models.keys().map(|s| s.as_str()).collect()
    }

    fn seed_defaults(&mut self) {
        self.register(
            ModelInfo::new("claude-opus-4-5-20251101", 200_000, 16_384, TokenizerKind::Claude)
                .with_thinking(),
        );
        self.register(
            ModelInfo::new("claude-sonnet-4-5-20250929", 200_000, 16_384, TokenizerKind::Claude)
                .with_thinking(),
        );
        self.register(
            ModelInfo::new("claude-haiku-4-5-20251001", 200_000, 8_192, TokenizerKind::Claude)
                .with_thinking(),
        );
        self.register(
            ModelInfo::new("claude-sonnet-4-20250514", 200_000, 8_192, TokenizerKind::Claude)
                .with_thinking(),
        );
        self.register(
            ModelInfo::new("claude-3-5-haiku-20241022", 200_000, 8_192, TokenizerKind::Claude),
        );
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_returns_registered_entry() {
        let catalog = ModelCatalog::new();
        let info = catalog.get("claude-sonnet-4-5-20250929").unwrap();
        assert_eq!(info.max_context_tokens, 200_000);
        assert!(info.supports_thinking);
    }

    #[test]
    fn unknown_model_falls_back_to_heuristic() {
        let catalog = ModelCatalog::new();
        let info = catalog.info_for("some-future-model");
        assert_eq!(info.tokenizer, TokenizerKind::Heuristic);
        assert_eq!(info.max_context_tokens, 128_000);
    }
}
