//! Provider abstraction: the streaming/non-streaming LLM call surface.
//!
//! Providers return language-model chunks, never agent
//! [`super::event::Event`]s — the core owns event shape and turns chunks
//! into events.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use super::cancel::CancellationToken;
use super::message::Message;
use crate::error::ForgeError;

/// A content chunk's role in the provider's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Thinking,
    Message,
}

/// One piece of a streamed completion.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    pub content_delta: String,
    pub kind: ChunkKind,
    pub finished: bool,
}

pub type StreamBox = Pin<Box<dyn Stream<Item = Result<StreamChunk, ForgeError>> + Send>>;

/// Static facts about a model a provider can drive, independent of the
/// full [`super::models::ModelInfo`] catalog entry (which also carries
/// tokenizer selection).
#[derive(Debug, Clone)]
pub struct ProviderModelInfo {
    pub name: String,
    pub max_tokens: u32,
    pub supports_streaming: bool,
}

/// Unified LLM provider interface: `stream`/`complete` over a full message
/// history, both cancellation-aware.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn model_info(&self) -> ProviderModelInfo;

    /// Stream a completion for the given message history. The returned
    /// stream ends (with a `Cancelled` error as its final item) promptly
    /// after `cancel` fires.
    async fn stream(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<StreamBox, ForgeError>;

    /// Non-streaming completion: the concatenated message text once the
    /// full response has arrived.
    async fn complete(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<String, ForgeError>;
}
