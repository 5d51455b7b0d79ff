//! Prompt builder: deterministic assembly of the system prompt, tool
//! schemas, custom instructions, and an optional ephemeral error-context
//! block.
//!
//! `PromptBuilder::build` is a pure function of its stored fields: building
//! twice with the same inputs yields byte-identical output, so it never
//! gathers a timestamp or other non-deterministic context itself. Any
//! environment/platform context the embedder wants included is gathered
//! once by the caller and handed in as an already-rendered string.

use super::tools::ToolSchema;

/// Assembles the deterministic per-iteration prompt text.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    system_prompt_text: String,
    custom_instructions: Vec<String>,
    /// Pre-rendered environment/platform context, gathered once by the
    /// caller at process start; never regenerated here.
    environment_context: Option<String>,
}

impl PromptBuilder {
    pub fn new(system_prompt_text: impl Into<String>) -> Self {
        Self {
            system_prompt_text: system_prompt_text.into(),
            custom_instructions: Vec::new(),
            environment_context: None,
        }
    }

    pub fn with_custom_instructions(mut self, instructions: Vec<String>) -> Self {
        self.custom_instructions = instructions;
        self
    }

    pub fn with_environment_context(mut self, context: impl Into<String>) -> Self {
        self.environment_context = Some(context.into());
        self
    }

    /// Build the prompt text for one iteration: base header, custom
    /// instructions, `<available_tools>`, and an optional `<error_context>`
    /// ephemeral block carrying the previous iteration's failure. The
    /// result never includes timestamps or randomness.
    pub fn build(&self, tools: &[ToolSchema], error_context: Option<&str>) -> String {
        let mut parts = Vec::new();

        parts.push(self.system_prompt_text.clone());

        if let Some(env) = &self.environment_context {
            parts.push(format!("<environment>\n{env}\n</environment>"));
        }

        if !self.custom_instructions.is_empty() {
            parts.push(format!(
                "<custom_instructions>\n{}\n</custom_instructions>",
                self.custom_instructions.join("\n")
            ));
        }

        parts.push(render_available_tools(tools));

        if let Some(err) = error_context {
            parts.push(format!("<error_context>\n{err}\n</error_context>"));
        }

        parts.join("\n\n")
    }
}

/// Serialize each registered tool's schema into a stable XML shape.
/// Iteration order follows the slice order the caller passes in, so the
/// registry is responsible for handing tools in a stable order (name sort)
/// if determinism across runs matters.
fn render_available_tools(tools: &[ToolSchema]) -> String {
    let mut body = String::from("<available_tools>\n");
    for tool in tools {
        body.push_str(&format!(
            "  <tool>\n    <name>{}</name>\n    <description>{}</description>\n    <parameters>{}</parameters>\n    <loop_breaking>{}</loop_breaking>\n  </tool>\n",
            tool.name,
            tool.description,
            tool.parameters,
            tool.loop_breaking,
        ));
    }
    body.push_str("</available_tools>");
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::ToolSchema;

    fn sample_tools() -> Vec<ToolSchema> {
        vec![ToolSchema {
            name: "converse".to_string(),
            description: "Send a message to the user.".to_string(),
            parameters: serde_json::json!({"type": "object"}),
            loop_breaking: true,
        }]
    }

    #[test]
    fn build_is_deterministic() {
        let builder = PromptBuilder::new("You are Forge.")
            .with_custom_instructions(vec!["Be concise.".to_string()]);
        let tools = sample_tools();
        let a = builder.build(&tools, Some("boom"));
        let b = builder.build(&tools, Some("boom"));
        assert_eq!(a, b);
    }

    #[test]
    fn omits_error_context_when_none() {
        let builder = PromptBuilder::new("You are Forge.");
        let prompt = builder.build(&[], None);
        assert!(!prompt.contains("<error_context>"));
    }

    #[test]
    fn includes_tool_schema() {
        let builder = PromptBuilder::new("You are Forge.");
        let prompt = builder.build(&sample_tools(), None);
        assert!(prompt.contains("<name>converse</name>"));
        assert!(prompt.contains("<loop_breaking>true</loop_breaking>"));
    }
}
