//! Tool registry & dispatcher.
//!
//! A uniform `Tool` trait registry plus three always-present built-ins.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use super::approval::{ApprovalDecision as GateDecision, ApprovalGate, ApprovalVerdict};
use super::cancel::CancellationToken;
use super::event::{ApprovalDecision as EventDecision, Event};
use super::parser::ToolCall;
use crate::error::ForgeError;

static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").unwrap());

/// Metadata a tool exposes to the prompt builder and registry validation.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub loop_breaking: bool,
}

/// Interface implemented by embedders (and the three built-ins).
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON-Schema object describing accepted parameters.
    fn schema(&self) -> Value;
    /// Whether a successful execution ends the turn.
    fn loop_breaking(&self) -> bool;
    async fn execute(&self, cancel: CancellationToken, arguments: Value) -> Result<String, ForgeError>;
}

/// Lookup-by-name registry. Validates uniqueness and schema syntax at
/// registration time; the three built-ins are always present and cannot be
/// overridden.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// A registry seeded with only the three built-ins.
    pub fn new() -> Self {
        let mut registry = Self {
            tools: HashMap::new(),
        };
        registry
            .tools
            .insert("task_completion".to_string(), Arc::new(TaskCompletion) as Arc<dyn Tool>);
        registry
            .tools
            .insert("ask_question".to_string(), Arc::new(AskQuestion) as Arc<dyn Tool>);
        registry
            .tools
            .insert("converse".to_string(), Arc::new(Converse) as Arc<dyn Tool>);
        registry
    }

    /// Register an embedder-provided tool. Fails if the name is malformed,
    /// already registered, or collides with a built-in.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ForgeError> {
        let name = tool.name();
        if name.is_empty() || !NAME_PATTERN.is_match(name) {
            return Err(ForgeError::InvalidArguments {
                tool: name.to_string(),
                detail: "tool name must match [a-z_][a-z0-9_]*".to_string(),
            });
        }
        if self.tools.contains_key(name) {
            return Err(ForgeError::InvalidArguments {
                tool: name.to_string(),
                detail: "a tool with this name is already registered".to_string(),
            });
        }
        if !tool.schema().is_object() {
            return Err(ForgeError::InvalidArguments {
                tool: name.to_string(),
                detail: "tool schema must be a JSON object".to_string(),
            });
        }
        self.tools.insert(name.to_string(), tool);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// All registered tools' schemas, sorted by name for a stable prompt.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let tool = &self.tools[name];
                ToolSchema {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.schema(),
                    loop_breaking: tool.loop_breaking(),
                }
            })
            .collect()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of one dispatch: the tool's result (or the error it failed
/// with) plus whether the turn should end after this iteration.
pub struct DispatchOutcome {
    pub result: Result<String, ForgeError>,
    pub loop_breaking: bool,
}

/// Looks up, validates, approves, and executes a parsed tool call (C7
/// dispatch steps 1-6).
pub struct Dispatcher {
    registry: Arc<ToolRegistry>,
    approval: Arc<dyn ApprovalGate>,
    events: tokio::sync::broadcast::Sender<Event>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        approval: Arc<dyn ApprovalGate>,
        events: tokio::sync::broadcast::Sender<Event>,
    ) -> Self {
        Self {
            registry,
            approval,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub async fn dispatch(&self, call: ToolCall, cancel: CancellationToken) -> DispatchOutcome {
        let tool = match self.registry.get(&call.tool_name) {
            Some(tool) => tool,
            None => {
                let valid = self.registry.names().join(", ");
                return DispatchOutcome {
                    result: Err(ForgeError::UnknownTool {
                        name: call.tool_name,
                        valid,
                    }),
                    loop_breaking: false,
                };
            }
        };

        let schema = tool.schema();
        let arguments = match super::parser::decode_arguments(&call.arguments_xml, Some(&schema)) {
            Ok(v) => v,
            Err(_) => {
                return DispatchOutcome {
                    result: Err(ForgeError::InvalidArguments {
                        tool: call.tool_name.clone(),
                        detail: "arguments could not be decoded".to_string(),
                    }),
                    loop_breaking: tool.loop_breaking(),
                };
            }
        };

        if let Err(detail) = validate_arguments(&schema, &arguments) {
            let _ = self.events.send(Event::ToolError {
                name: call.tool_name.clone(),
                error: detail.clone(),
            });
            return DispatchOutcome {
                result: Err(ForgeError::InvalidArguments {
                    tool: call.tool_name.clone(),
                    detail,
                }),
                loop_breaking: tool.loop_breaking(),
            };
        }

        match self.approval.classify(&call.tool_name, &arguments) {
            ApprovalVerdict::AutoDeny => {
                let _ = self.events.send(Event::ToolError {
                    name: call.tool_name.clone(),
                    error: "denied by policy".to_string(),
                });
                return DispatchOutcome {
                    result: Err(ForgeError::Denied),
                    loop_breaking: tool.loop_breaking(),
                };
            }
            ApprovalVerdict::AutoApprove => {}
            ApprovalVerdict::Ask => {
                let id = uuid::Uuid::new_v4();
                let _ = self.events.send(Event::ApprovalRequest {
                    id,
                    tool: call.tool_name.clone(),
                    args: arguments.clone(),
                });
                let decision = self.approval.decide(id, cancel.clone()).await;
                match decision {
                    Err(_) => {
                        return DispatchOutcome {
                            result: Err(ForgeError::Cancelled),
                            loop_breaking: tool.loop_breaking(),
                        };
                    }
                    Ok(GateDecision::Reject) => {
                        let _ = self.events.send(Event::ApprovalResolved {
                            id,
                            decision: EventDecision::Reject,
                        });
                        let _ = self.events.send(Event::ToolError {
                            name: call.tool_name.clone(),
                            error: "denied".to_string(),
                        });
                        return DispatchOutcome {
                            result: Err(ForgeError::Denied),
                            loop_breaking: tool.loop_breaking(),
                        };
                    }
                    Ok(GateDecision::Approve) => {
                        let _ = self.events.send(Event::ApprovalResolved {
                            id,
                            decision: EventDecision::Approve,
                        });
                    }
                }
            }
        }

        let outcome = tool.execute(cancel, arguments).await;
        match &outcome {
            Ok(text) => {
                let _ = self.events.send(Event::ToolResult {
                    name: call.tool_name.clone(),
                    text: text.clone(),
                });
            }
            Err(e) => {
                let _ = self.events.send(Event::ToolError {
                    name: call.tool_name.clone(),
                    error: e.to_string(),
                });
            }
        }

        DispatchOutcome {
            result: outcome.map_err(|e| ForgeError::ToolExecutionFailure {
                tool: call.tool_name.clone(),
                detail: e.to_string(),
            }),
            loop_breaking: tool.loop_breaking(),
        }
    }
}

/// Minimal JSON-Schema-shaped validator: checks required fields are
/// present, scalar/array types match `"type"`, and `maxItems`/`minItems`
/// bounds on arrays. Not a full JSON-Schema implementation; covers the
/// shapes the built-ins and typical embedder tools declare.
fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    let required = schema
        .get("required")
        .and_then(|r| r.as_array())
        .cloned()
        .unwrap_or_default();
    for req in &required {
        let key = req.as_str().unwrap_or_default();
        if args.get(key).is_none() {
            return Err(format!("missing required field '{key}'"));
        }
    }

    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (key, prop_schema) in props {
            let Some(value) = args.get(key) else {
                continue;
            };
            if let Some(expected_type) = prop_schema.get("type").and_then(|t| t.as_str()) {
                if !type_matches(expected_type, value) {
                    return Err(format!("field '{key}' must be of type {expected_type}"));
                }
                if expected_type == "array" {
                    if let Some(arr) = value.as_array() {
                        if let Some(max) = prop_schema.get("maxItems").and_then(|m| m.as_u64()) {
                            if arr.len() as u64 > max {
                                return Err(format!("field '{key}' exceeds maxItems {max}"));
                            }
                        }
                        if let Some(min) = prop_schema.get("minItems").and_then(|m| m.as_u64()) {
                            if (arr.len() as u64) < min {
                                return Err(format!("field '{key}' has fewer than minItems {min}"));
                            }
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}

// ── Built-ins ────────────────────────────────────────────────────────────

struct TaskCompletion;

#[async_trait]
impl Tool for TaskCompletion {
    fn name(&self) -> &str {
        "task_completion"
    }

    fn description(&self) -> &str {
        "Signal that the task is complete and surface the final result to the user."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "result": {"type": "string"}
            },
            "required": ["result"]
        })
    }

    fn loop_breaking(&self) -> bool {
        true
    }

    async fn execute(&self, _cancel: CancellationToken, arguments: Value) -> Result<String, ForgeError> {
        let result = arguments
            .get("result")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if result.trim().is_empty() {
            return Err(ForgeError::ToolExecutionFailure {
                tool: self.name().to_string(),
                detail: "result must not be empty".to_string(),
            });
        }
        Ok(result.to_string())
    }
}

struct AskQuestion;

#[async_trait]
impl Tool for AskQuestion {
    fn name(&self) -> &str {
        "ask_question"
    }

    fn description(&self) -> &str {
        "Ask the user a clarifying question, optionally with up to four suggested answers."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": {"type": "string"},
                "suggestions": {
                    "type": "array",
                    "items": {"type": "string"},
                    "maxItems": 4
                }
            },
            "required": ["question"]
        })
    }

    fn loop_breaking(&self) -> bool {
        true
    }

    async fn execute(&self, _cancel: CancellationToken, arguments: Value) -> Result<String, ForgeError> {
        let question = arguments
            .get("question")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        if question.trim().is_empty() {
            return Err(ForgeError::ToolExecutionFailure {
                tool: self.name().to_string(),
                detail: "question must not be empty".to_string(),
            });
        }

        let mut text = question.to_string();
        if let Some(suggestions) = arguments.get("suggestions").and_then(|v| v.as_array()) {
            if !suggestions.is_empty() {
                text.push('\n');
                for (i, s) in suggestions.iter().enumerate() {
                    let s = s.as_str().unwrap_or_default();
                    text.push_str(&format!("{}. {}\n", i + 1, s));
                }
                text = text.trim_end().to_string();
            }
        }
        Ok(text)
    }
}

struct Converse;

#[async_trait]
impl Tool for Converse {
    fn name(&self) -> &str {
        "converse"
    }

    fn description(&self) -> &str {
        "Send a conversational message to the user and end the turn."
    }

    fn schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "message": {"type": "string"}
            },
            "required": ["message"]
        })
    }

    fn loop_breaking(&self) -> bool {
        true
    }

    async fn execute(&self, _cancel: CancellationToken, arguments: Value) -> Result<String, ForgeError> {
        let message = arguments
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::approval::AlwaysApprove;

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(ToolRegistry::new());
        let approval = Arc::new(AlwaysApprove) as Arc<dyn ApprovalGate>;
        let (tx, _rx) = tokio::sync::broadcast::channel(32);
        Dispatcher::new(registry, approval, tx)
    }

    #[tokio::test]
    async fn dispatches_converse_happy_path() {
        let dispatcher = dispatcher();
        let call = ToolCall {
            server_name: "local".to_string(),
            tool_name: "converse".to_string(),
            arguments_xml: "<message>Hi there!</message>".to_string(),
        };
        let outcome = dispatcher.dispatch(call, CancellationToken::new()).await;
        assert!(outcome.loop_breaking);
        assert_eq!(outcome.result.unwrap(), "Hi there!");
    }

    #[tokio::test]
    async fn unknown_tool_is_reported() {
        let dispatcher = dispatcher();
        let call = ToolCall {
            server_name: "local".to_string(),
            tool_name: "does_not_exist".to_string(),
            arguments_xml: String::new(),
        };
        let outcome = dispatcher.dispatch(call, CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(ForgeError::UnknownTool { .. })));
    }

    #[tokio::test]
    async fn ask_question_rejects_five_suggestions_at_validation() {
        let dispatcher = dispatcher();
        let call = ToolCall {
            server_name: "local".to_string(),
            tool_name: "ask_question".to_string(),
            arguments_xml: "<question>Pick one</question><suggestions><item>a</item><item>b</item><item>c</item><item>d</item><item>e</item></suggestions>".to_string(),
        };
        let outcome = dispatcher.dispatch(call, CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(ForgeError::InvalidArguments { .. })));
    }

    #[tokio::test]
    async fn ask_question_rejects_empty_question_at_execution() {
        let dispatcher = dispatcher();
        let call = ToolCall {
            server_name: "local".to_string(),
            tool_name: "ask_question".to_string(),
            arguments_xml: "<question></question>".to_string(),
        };
        let outcome = dispatcher.dispatch(call, CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(ForgeError::ToolExecutionFailure { .. })));
    }

    #[tokio::test]
    async fn task_completion_requires_nonempty_result() {
        let dispatcher = dispatcher();
        let call = ToolCall {
            server_name: "local".to_string(),
            tool_name: "task_completion".to_string(),
            arguments_xml: "<result>  </result>".to_string(),
        };
        let outcome = dispatcher.dispatch(call, CancellationToken::new()).await;
        assert!(matches!(outcome.result, Err(ForgeError::ToolExecutionFailure { .. })));
    }

    #[test]
    fn registry_rejects_duplicate_builtin_name() {
        struct Fake;
        #[async_trait]
        impl Tool for Fake {
            fn name(&self) -> &str {
                "converse"
            }
            fn description(&self) -> &str {
                "fake"
            }
            fn schema(&self) -> Value {
                json!({"type": "object"})
            }
            fn loop_breaking(&self) -> bool {
                false
            }
            async fn execute(&self, _cancel: CancellationToken, _arguments: Value) -> Result<String, ForgeError> {
                Ok(String::new())
            }
        }
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(Fake)).is_err());
    }

    #[test]
    fn registry_rejects_malformed_name() {
        struct Fake;
        #[async_trait]
        impl Tool for Fake {
            fn name(&self) -> &str {
                "NotValid"
            }
            fn description(&self) -> &str {
                "fake"
            }
            fn schema(&self) -> Value {
                json!({"type": "object"})
            }
            fn loop_breaking(&self) -> bool {
                false
            }
            async fn execute(&self, _cancel: CancellationToken, _arguments: Value) -> Result<String, ForgeError> {
                Ok(String::new())
            }
        }
        let mut registry = ToolRegistry::new();
        assert!(registry.register(Arc::new(Fake)).is_err());
    }
}
