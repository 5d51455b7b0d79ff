//! Runtime configuration: agent loop limits, context budgets, and approval
//! policy. Plain data loaded once at construction time; never mutated
//! behind a shared lock (see Design Notes on global mutable state).

use std::path::{Path, PathBuf};

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::agent::approval::ApprovalRule;
use crate::error::{ForgeError, Result};

const CONFIG_DIR: &str = "forge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Configuration {
    pub loop_limits: LoopLimits,
    pub context: ContextConfig,
    pub prompt: PromptConfig,
    pub approval_policy: Vec<ApprovalRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopLimits {
    /// Hard cap on iterations per turn.
    pub max_iterations: usize,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self { max_iterations: 25 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Token budget driving pruning and summarization.
    pub max_context_tokens: u32,
    /// Messages-from-tail age, in message count, before a tool-call pair is
    /// eligible for buffered summarization.
    pub messages_old_threshold: usize,
    /// Minimum number of eligible pairs before a summarization pass triggers.
    pub min_tool_calls_to_summarize: usize,
    /// Oldest-pair age, in message count, that forces a summarization pass
    /// even if `min_tool_calls_to_summarize` has not been reached.
    pub max_tool_call_distance: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 150_000,
            messages_old_threshold: 20,
            min_tool_calls_to_summarize: 10,
            max_tool_call_distance: 40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub system_prompt_text: String,
    pub custom_instructions: Vec<String>,
    /// Whether `thinking_*` events are forwarded to subscribers. Never
    /// affects what gets persisted to memory - thinking text is never
    /// written to memory regardless of this flag.
    pub thinking_visible: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            system_prompt_text: "You are Forge, an agent that completes tasks by invoking tools \
                one at a time and observing their results."
                .to_string(),
            custom_instructions: Vec::new(),
            thinking_visible: true,
        }
    }
}

impl Configuration {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| ForgeError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| ForgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `~/.config/forge/config.toml` on Linux, the platform equivalent
    /// elsewhere, resolved via `directories::BaseDirs`.
    pub fn default_path() -> Result<PathBuf> {
        BaseDirs::new()
            .map(|dirs| dirs.config_dir().join(CONFIG_DIR).join(CONFIG_FILE))
            .ok_or_else(|| ForgeError::Config("could not determine config directory".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let config = Configuration::default();
        assert_eq!(config.loop_limits.max_iterations, 25);
        assert!(config.context.max_context_tokens > 0);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Configuration::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Configuration = toml::from_str(&toml_str).unwrap();
        assert_eq!(
            parsed.loop_limits.max_iterations,
            config.loop_limits.max_iterations
        );
    }

    #[test]
    fn load_nonexistent_file_returns_default() {
        let config = Configuration::load(Path::new("/nonexistent/forge/config.toml")).unwrap();
        assert_eq!(config.loop_limits.max_iterations, 25);
    }

    #[test]
    fn save_then_load_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Configuration::default();
        config.loop_limits.max_iterations = 7;
        config.prompt.custom_instructions.push("Prefer terse answers.".to_string());
        config.save(&path).unwrap();

        let loaded = Configuration::load(&path).unwrap();
        assert_eq!(loaded.loop_limits.max_iterations, 7);
        assert_eq!(loaded.prompt.custom_instructions, config.prompt.custom_instructions);
    }
}
