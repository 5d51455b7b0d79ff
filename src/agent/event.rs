//! Event taxonomy emitted to presentation layers.
//!
//! Events carry only values; there is no shared mutable state reachable
//! through an `Event`. The stream processor and controller are the only
//! producers, broadcasting to every subscriber in insertion order.

use serde_json::Value;
use uuid::Uuid;

/// Decision returned by an approval gate for a pending tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// A single point in the agent loop's event stream.
///
/// Within one iteration, exactly one of `MessageEnd` or `ToolCall` (followed
/// by `ToolResult`/`ToolError`) occurs before `IterationEnd`; `Thinking*`
/// events, if present, precede any `Message*` or tool events.
#[derive(Debug, Clone)]
pub enum Event {
    // ── Lifecycle ────────────────────────────────────────────────────────
    TurnStart,
    TurnEnd,
    IterationStart { iteration: usize },
    IterationEnd { iteration: usize },

    // ── Model output ─────────────────────────────────────────────────────
    ThinkingStart,
    ThinkingChunk(String),
    ThinkingEnd,
    MessageStart,
    MessageChunk(String),
    MessageEnd,

    // ── Tool ─────────────────────────────────────────────────────────────
    /// Emitted at most once per iteration, as soon as early detection (or
    /// full parse) surfaces a tool name. `tool_name` is `None` only for the
    /// rare case where the early-detect scan itself hasn't resolved a name
    /// yet but buffering has begun.
    ToolCallStart {
        tool_name: Option<String>,
        partial_args: Option<String>,
    },
    ToolCall { name: String, args: Value },
    ToolResult { name: String, text: String },
    ToolError { name: String, error: String },

    // ── Control ──────────────────────────────────────────────────────────
    ApprovalRequest { id: Uuid, tool: String, args: Value },
    ApprovalResolved { id: Uuid, decision: ApprovalDecision },
    Error { kind: String, detail: String },
    SummarizationProgress { index: usize, total: usize },
}
