//! Context strategies: token-budget pruning and buffered tool-call
//! summarization, applied after each iteration, before the next prompt is
//! built.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::broadcast;

use super::cancel::CancellationToken;
use super::event::Event;
use super::memory::Memory;
use super::message::{Message, Role};
use super::parser;
use super::provider::Provider;
use crate::config::ContextConfig;
use crate::error::ForgeError;

/// A contiguous run of tool-call/tool-result pairs eligible for
/// summarization together.
struct Group {
    start: usize,
    end: usize,
    text: String,
}

/// Applies pruning then buffered summarization (Open Question 1: pruning
/// runs first since it is the cheap operation and shrinks the candidate set
/// summarization would otherwise have to consider).
pub struct ContextStrategies {
    config: ContextConfig,
    memory: Arc<Memory>,
    provider: Arc<dyn Provider>,
    events: broadcast::Sender<Event>,
}

impl ContextStrategies {
    pub fn new(
        config: ContextConfig,
        memory: Arc<Memory>,
        provider: Arc<dyn Provider>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            config,
            memory,
            provider,
            events,
        }
    }

    pub async fn apply(&self, cancel: CancellationToken) -> Result<(), ForgeError> {
        self.prune();
        self.summarize_buffered(cancel).await
    }

    fn prune(&self) {
        if self.memory.estimated_tokens() > self.config.max_context_tokens {
            let target = (self.config.max_context_tokens as f64 * 0.7) as u32;
            self.memory.prune_to(target);
        }
    }

    async fn summarize_buffered(&self, cancel: CancellationToken) -> Result<(), ForgeError> {
        let messages = self.memory.get_all();
        let pairs = find_tool_pairs(&messages);
        if pairs.is_empty() {
            return Ok(());
        }

        let tail = messages.len();
        let buffered: Vec<(usize, usize)> = pairs
            .into_iter()
            .filter(|(_, end)| tail.saturating_sub(end + 1) >= self.config.messages_old_threshold)
            .collect();

        if buffered.is_empty() {
            return Ok(());
        }

        let oldest_distance = buffered
            .iter()
            .map(|(_, end)| tail.saturating_sub(end + 1))
            .max()
            .unwrap_or(0);

        let should_trigger = buffered.len() >= self.config.min_tool_calls_to_summarize
            || oldest_distance >= self.config.max_tool_call_distance;
        if !should_trigger {
            return Ok(());
        }

        let groups = group_contiguous(&buffered, &messages);
        let total = groups.len();
        // Groups complete concurrently, in no particular order, so the
        // `index` emitted with each progress event must come from a shared
        // completion counter rather than each group's static position —
        // otherwise two groups racing to finish could emit indices
        // out of order.
        let completed = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let results = join_all(groups.iter().map(|group| {
            let provider = self.provider.clone();
            let cancel = cancel.clone();
            let events = self.events.clone();
            let text = group.text.clone();
            let completed = completed.clone();
            async move {
                let prompt = vec![Message::user(
                    format!(
                        "Summarize the following tool invocation and its result in one or two sentences, preserving any facts a later step might need:\n\n{text}"
                    ),
                    Utc::now(),
                )];
                let outcome = provider.complete(prompt, cancel).await;
                let index = completed.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                let _ = events.send(Event::SummarizationProgress { index, total });
                outcome
            }
        }))
        .await;

        let mut first_error = None;
        for (group, result) in groups.into_iter().zip(results.into_iter()).rev() {
            match result {
                Ok(summary_text) => {
                    let summary = Message::assistant(summary_text, Utc::now());
                    self.memory.replace_range(group.start, group.end + 1, summary);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Locate (assistant_index, tool_index) pairs: an assistant message whose
/// content contains a `<tool>` block immediately followed by its `Role::Tool`
/// result.
fn find_tool_pairs(messages: &[Message]) -> Vec<(usize, usize)> {
    let mut pairs = Vec::new();
    for i in 0..messages.len().saturating_sub(1) {
        let is_call = messages[i].role == Role::Assistant
            && parser::find_tool_block(&messages[i].content).is_some();
        let is_result = messages[i + 1].role == Role::Tool;
        if is_call && is_result {
            pairs.push((i, i + 1));
        }
    }
    pairs
}

/// Merge adjacent buffered pairs into contiguous groups, concatenating their
/// message text for the summarization prompt.
fn group_contiguous(buffered: &[(usize, usize)], messages: &[Message]) -> Vec<Group> {
    let mut groups: Vec<Group> = Vec::new();
    for &(start, end) in buffered {
        let text = format!("{}\n{}", messages[start].content, messages[end].content);
        match groups.last_mut() {
            Some(last) if last.end + 1 == start => {
                last.end = end;
                last.text.push('\n');
                last.text.push_str(&text);
            }
            _ => groups.push(Group { start, end, text }),
        }
    }
    groups
}
