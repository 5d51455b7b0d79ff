//! Conversation memory: an ordered, thread-safe log of [`Message`]s
//! with token accounting and role-preserving pruning.

use std::sync::{Arc, RwLock};

use super::message::{Message, Role};
use super::tokens::TokenCounter;

/// Per-message token overhead charged by [`Memory::estimated_tokens`],
/// independent of content length.
const MESSAGE_OVERHEAD: u32 = 4;
/// One-shot charge added to a non-empty log, representing the provider's
/// reply-priming tokens.
const REPLY_PRIMING: u32 = 3;

/// Ordered conversation log. Readers take a shared lock; the sole writers
/// are the loop controller (`append`) and the summarization strategy
/// (`replace_range`, under an exclusive lock).
pub struct Memory {
    model: String,
    counter: Arc<dyn TokenCounter>,
    messages: RwLock<Vec<Message>>,
}

impl Memory {
    pub fn new(model: impl Into<String>, counter: Arc<dyn TokenCounter>) -> Self {
        Self {
            model: model.into(),
            counter,
            messages: RwLock::new(Vec::new()),
        }
    }

    /// Insert a message at the tail. Insertion order is preserved.
    pub fn append(&self, message: Message) {
        self.messages.write().unwrap().push(message);
    }

    /// Snapshot of the full log in insertion order.
    pub fn get_all(&self) -> Vec<Message> {
        self.messages.read().unwrap().clone()
    }

    /// The last `n` messages, preserving their relative order.
    pub fn recent(&self, n: usize) -> Vec<Message> {
        let guard = self.messages.read().unwrap();
        let len = guard.len();
        guard[len.saturating_sub(n)..].to_vec()
    }

    /// All messages of a single role, in insertion order.
    pub fn filter(&self, role: Role) -> Vec<Message> {
        self.messages
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.role == role)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pure function of the message list: non-negative, monotone under
    /// append. An empty log yields exactly zero.
    pub fn estimated_tokens(&self) -> u32 {
        let guard = self.messages.read().unwrap();
        if guard.is_empty() {
            return 0;
        }
        let mut total = REPLY_PRIMING;
        for message in guard.iter() {
            total += MESSAGE_OVERHEAD;
            total += self.counter.count_text(&self.model, role_str(message.role));
            total += self.counter.count_text(&self.model, &message.content);
        }
        total
    }

    /// Remove the oldest non-system messages until the estimate is at or
    /// below `target`, or only the system message remains.
    pub fn prune_to(&self, target: u32) {
        let mut guard = self.messages.write().unwrap();
        loop {
            if Self::estimate_locked(&self.model, &self.counter, &guard) <= target {
                break;
            }
            match guard.iter().position(|m| m.role != Role::System) {
                Some(idx) => {
                    guard.remove(idx);
                }
                None => break,
            }
        }
    }

    /// Replace a contiguous range `[start, end)` with a single summary
    /// message, preserving the range's original position in the log. Used
    /// by the buffered tool-call summarization strategy under an exclusive
    /// write.
    pub fn replace_range(&self, start: usize, end: usize, summary: Message) {
        let mut guard = self.messages.write().unwrap();
        if start >= end || end > guard.len() {
            return;
        }
        guard.splice(start..end, std::iter::once(summary));
    }

    fn estimate_locked(model: &str, counter: &Arc<dyn TokenCounter>, messages: &[Message]) -> u32 {
        if messages.is_empty() {
            return 0;
        }
        let mut total = REPLY_PRIMING;
        for message in messages {
            total += MESSAGE_OVERHEAD;
            total += counter.count_text(model, role_str(message.role));
            total += counter.count_text(model, &message.content);
        }
        total
    }
}

fn role_str(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}
