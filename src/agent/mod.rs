//! The agent loop engine: prompt assembly, streamed tool-call parsing, and
//! conversation memory for LLM-driven agents.

pub mod anthropic;
pub mod approval;
pub mod cancel;
pub mod context_strategies;
pub mod controller;
pub mod event;
pub mod memory;
pub mod message;
pub mod models;
pub mod parser;
pub mod prompt;
pub mod provider;
pub mod stream_processor;
pub mod tokens;
pub mod tools;

pub use controller::AgentLoopController;
pub use event::Event;
pub use message::{Message, Role};
