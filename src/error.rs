//! Crate-wide error taxonomy.
//!
//! Recoverable variants feed back into the next loop iteration as ephemeral
//! error context (see `agent::controller`); fatal variants end the turn.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ForgeError {
    // ── Recoverable: fed back to the model as error context ────────────────
    #[error("the previous response contained no <tool> block")]
    NoToolCall,

    #[error("the <tool> block could not be parsed: {0}")]
    MalformedToolCall(String),

    #[error("unknown tool '{name}'; valid tools are: {valid}")]
    UnknownTool { name: String, valid: String },

    #[error("arguments for '{tool}' failed validation: {detail}")]
    InvalidArguments { tool: String, detail: String },

    #[error("tool '{tool}' failed: {detail}")]
    ToolExecutionFailure { tool: String, detail: String },

    #[error("the tool call was denied")]
    Denied,

    // ── Fatal: ends the turn ────────────────────────────────────────────────
    #[error("provider request failed: {0}")]
    ProviderFailure(String),

    #[error("operation was cancelled")]
    Cancelled,

    #[error("circuit breaker tripped: {count} consecutive identical failures")]
    CircuitBreakerTripped { count: usize },

    #[error("iteration cap of {0} reached without a loop-breaking tool call")]
    IterationCapReached(usize),

    // ── Infrastructure ──────────────────────────────────────────────────────
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("event channel closed")]
    ChannelClosed,
}

impl From<std::io::Error> for ForgeError {
    fn from(e: std::io::Error) -> Self {
        ForgeError::Io(e.to_string())
    }
}

impl ForgeError {
    /// Whether this error is recoverable (feeds the next iteration) or
    /// fatal (ends the turn). Infrastructure variants are treated as fatal.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ForgeError::NoToolCall
                | ForgeError::MalformedToolCall(_)
                | ForgeError::UnknownTool { .. }
                | ForgeError::InvalidArguments { .. }
                | ForgeError::ToolExecutionFailure { .. }
                | ForgeError::Denied
        )
    }

    /// Kind-specific trailer appended after the base error message when
    /// building the next prompt's ephemeral error context.
    pub fn guidance(&self) -> &'static str {
        match self {
            ForgeError::NoToolCall => {
                "You must invoke exactly one tool using the documented <tool> XML format."
            }
            ForgeError::MalformedToolCall(_) => {
                "Re-emit the <tool> block with well-formed XML and a single <tool_name>."
            }
            ForgeError::UnknownTool { .. } => "Choose one of the listed tool names exactly.",
            ForgeError::InvalidArguments { .. } => {
                "Re-check the tool's parameter schema and retry with corrected arguments."
            }
            ForgeError::ToolExecutionFailure { .. } => {
                "Analyze what went wrong and try a different approach."
            }
            ForgeError::Denied => "The tool call was denied by the user; try a different action.",
            _ => "",
        }
    }

    /// Renders the full ephemeral error-context block for recoverable errors.
    pub fn render_context(&self) -> String {
        format!(
            "The previous iteration failed: {}. {}",
            self,
            self.guidance()
        )
        .trim_end()
        .to_string()
    }

    /// Stable signature used by the circuit breaker's error ring. Distinct
    /// error *kinds and details* must hash differently; repeats of the exact
    /// same failure must hash identically.
    pub fn signature(&self) -> u64 {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        let mut hasher = DefaultHasher::new();
        self.render_context().hash(&mut hasher);
        hasher.finish()
    }
}

pub type Result<T> = std::result::Result<T, ForgeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::no_tool_call(ForgeError::NoToolCall, true)]
    #[case::malformed(ForgeError::MalformedToolCall("bad xml".to_string()), true)]
    #[case::unknown_tool(ForgeError::UnknownTool { name: "x".to_string(), valid: "a, b".to_string() }, true)]
    #[case::invalid_args(ForgeError::InvalidArguments { tool: "x".to_string(), detail: "missing field".to_string() }, true)]
    #[case::tool_failure(ForgeError::ToolExecutionFailure { tool: "x".to_string(), detail: "boom".to_string() }, true)]
    #[case::denied(ForgeError::Denied, true)]
    #[case::provider(ForgeError::ProviderFailure("network".to_string()), false)]
    #[case::cancelled(ForgeError::Cancelled, false)]
    #[case::breaker(ForgeError::CircuitBreakerTripped { count: 5 }, false)]
    #[case::iteration_cap(ForgeError::IterationCapReached(25), false)]
    fn recoverable_matches_taxonomy(#[case] error: ForgeError, #[case] expected: bool) {
        assert_eq!(error.is_recoverable(), expected);
    }

    #[test]
    fn identical_errors_share_a_signature() {
        let a = ForgeError::ToolExecutionFailure {
            tool: "calc".to_string(),
            detail: "cannot divide by zero".to_string(),
        };
        let b = a.clone();
        assert_eq!(a.signature(), b.signature());
    }

    #[test]
    fn distinct_errors_have_distinct_signatures() {
        let a = ForgeError::ToolExecutionFailure {
            tool: "calc".to_string(),
            detail: "cannot divide by zero".to_string(),
        };
        let b = ForgeError::ToolExecutionFailure {
            tool: "calc".to_string(),
            detail: "overflow".to_string(),
        };
        assert_ne!(a.signature(), b.signature());
    }

    #[test]
    fn recoverable_render_context_never_empty() {
        let err = ForgeError::NoToolCall;
        let rendered = err.render_context();
        assert!(rendered.starts_with("The previous iteration failed:"));
        assert!(rendered.contains("must invoke"));
    }
}
