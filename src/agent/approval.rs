//! Approval gate.
//!
//! Classifies each call against an ordered list of declarative
//! [`ApprovalRule`]s evaluated top to bottom, plus an async decision point
//! for rules that require a human answer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::cancel::CancellationToken;
use crate::error::ForgeError;

/// A single ordered rule. The first matching rule in the configured list
/// wins; a tool call matching no rule falls through to `Ask`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum ApprovalRule {
    /// Matches every call; always auto-approves. Typically placed first for
    /// fully trusted tools.
    AlwaysAllow { tool: String },
    /// Matches when the call's `path` argument starts with one of the given
    /// prefixes.
    PathPrefix { tool: String, prefixes: Vec<String> },
    /// Matches when the call's `command` argument starts with one of the
    /// given prefixes.
    CommandPrefix { tool: String, prefixes: Vec<String> },
    /// Matches any call to the named tool, unconditionally requiring
    /// approval (or denying, if `allow` is false).
    PerTool { tool: String, allow: bool },
}

impl ApprovalRule {
    fn tool(&self) -> &str {
        match self {
            ApprovalRule::AlwaysAllow { tool } => tool,
            ApprovalRule::PathPrefix { tool, .. } => tool,
            ApprovalRule::CommandPrefix { tool, .. } => tool,
            ApprovalRule::PerTool { tool, .. } => tool,
        }
    }

    fn matches(&self, tool_name: &str, args: &Value) -> Option<ApprovalVerdict> {
        if self.tool() != tool_name {
            return None;
        }
        match self {
            ApprovalRule::AlwaysAllow { .. } => Some(ApprovalVerdict::AutoApprove),
            ApprovalRule::PathPrefix { prefixes, .. } => {
                let path = args.get("path").and_then(|v| v.as_str())?;
                prefixes
                    .iter()
                    .any(|p| path.starts_with(p.as_str()))
                    .then_some(ApprovalVerdict::AutoApprove)
            }
            ApprovalRule::CommandPrefix { prefixes, .. } => {
                let command = args.get("command").and_then(|v| v.as_str())?;
                prefixes
                    .iter()
                    .any(|p| command.starts_with(p.as_str()))
                    .then_some(ApprovalVerdict::AutoApprove)
            }
            ApprovalRule::PerTool { allow, .. } => Some(if *allow {
                ApprovalVerdict::AutoApprove
            } else {
                ApprovalVerdict::AutoDeny
            }),
        }
    }
}

/// Outcome of classifying a tool call against the configured rule list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalVerdict {
    AutoApprove,
    AutoDeny,
    Ask,
}

/// A human's answer to an `Ask` verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Evaluates tool calls against policy and, for calls requiring a human
/// decision, waits for one to arrive (or for cancellation).
#[async_trait]
pub trait ApprovalGate: Send + Sync {
    fn classify(&self, tool_name: &str, args: &Value) -> ApprovalVerdict;
    /// Waits for the decision identified by `id` to resolve, or for
    /// `cancel` to fire first.
    async fn decide(
        &self,
        id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ApprovalDecision, ForgeError>;
}

/// Ordered-rule gate backed by a single-shot channel per pending request,
/// resolved by whatever presentation layer calls [`RuleBasedGate::resolve`].
pub struct RuleBasedGate {
    rules: Vec<ApprovalRule>,
    pending: std::sync::Mutex<std::collections::HashMap<Uuid, oneshot::Sender<ApprovalDecision>>>,
}

impl RuleBasedGate {
    pub fn new(rules: Vec<ApprovalRule>) -> Self {
        Self {
            rules,
            pending: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Resolve a pending `Ask` request from the presentation layer. No-op if
    /// the id is unknown or already resolved.
    pub fn resolve(&self, id: Uuid, decision: ApprovalDecision) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(decision);
        }
    }
}

#[async_trait]
impl ApprovalGate for RuleBasedGate {
    fn classify(&self, tool_name: &str, args: &Value) -> ApprovalVerdict {
        for rule in &self.rules {
            if let Some(verdict) = rule.matches(tool_name, args) {
                return verdict;
            }
        }
        ApprovalVerdict::Ask
    }

    async fn decide(
        &self,
        id: Uuid,
        cancel: CancellationToken,
    ) -> Result<ApprovalDecision, ForgeError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        tokio::select! {
            result = rx => result.map_err(|_| ForgeError::ChannelClosed),
            _ = cancel.cancelled() => {
                self.pending.lock().unwrap().remove(&id);
                Err(ForgeError::Cancelled)
            }
        }
    }
}

/// Trivial gate that approves everything without asking; used in tests and
/// non-interactive demonstration contexts.
pub struct AlwaysApprove;

#[async_trait]
impl ApprovalGate for AlwaysApprove {
    fn classify(&self, _tool_name: &str, _args: &Value) -> ApprovalVerdict {
        ApprovalVerdict::AutoApprove
    }

    async fn decide(
        &self,
        _id: Uuid,
        _cancel: CancellationToken,
    ) -> Result<ApprovalDecision, ForgeError> {
        Ok(ApprovalDecision::Approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn always_allow_matches_named_tool_only() {
        let gate = RuleBasedGate::new(vec![ApprovalRule::AlwaysAllow {
            tool: "converse".to_string(),
        }]);
        assert_eq!(
            gate.classify("converse", &json!({})),
            ApprovalVerdict::AutoApprove
        );
        assert_eq!(gate.classify("shell", &json!({})), ApprovalVerdict::Ask);
    }

    #[test]
    fn path_prefix_rule_matches_prefix() {
        let gate = RuleBasedGate::new(vec![ApprovalRule::PathPrefix {
            tool: "read_file".to_string(),
            prefixes: vec!["/workspace/".to_string()],
        }]);
        assert_eq!(
            gate.classify("read_file", &json!({"path": "/workspace/a.rs"})),
            ApprovalVerdict::AutoApprove
        );
        assert_eq!(
            gate.classify("read_file", &json!({"path": "/etc/passwd"})),
            ApprovalVerdict::Ask
        );
    }

    #[test]
    fn per_tool_deny_wins_over_fallthrough() {
        let gate = RuleBasedGate::new(vec![ApprovalRule::PerTool {
            tool: "shell".to_string(),
            allow: false,
        }]);
        assert_eq!(gate.classify("shell", &json!({})), ApprovalVerdict::AutoDeny);
    }

    #[test]
    fn first_matching_rule_wins() {
        let gate = RuleBasedGate::new(vec![
            ApprovalRule::AlwaysAllow {
                tool: "shell".to_string(),
            },
            ApprovalRule::PerTool {
                tool: "shell".to_string(),
                allow: false,
            },
        ]);
        assert_eq!(gate.classify("shell", &json!({})), ApprovalVerdict::AutoApprove);
    }

    #[tokio::test]
    async fn decide_resolves_on_external_answer() {
        let gate = std::sync::Arc::new(RuleBasedGate::new(vec![]));
        let id = Uuid::new_v4();
        let gate2 = gate.clone();
        let handle = tokio::spawn(async move { gate2.decide(id, CancellationToken::new()).await });
        tokio::task::yield_now().await;
        gate.resolve(id, ApprovalDecision::Approve);
        let result = handle.await.unwrap();
        assert_eq!(result.unwrap(), ApprovalDecision::Approve);
    }

    #[tokio::test]
    async fn decide_errors_on_cancellation() {
        let gate = RuleBasedGate::new(vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = gate.decide(Uuid::new_v4(), cancel).await;
        assert!(matches!(result, Err(ForgeError::Cancelled)));
    }
}
