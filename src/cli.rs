//! Command-line surface for the reference demonstration binary.
//!
//! This is a thin harness, not a full product: no TUI, no slash commands,
//! no settings overlay, just enough wiring to drive one
//! [`crate::agent::AgentLoopController`] from stdin.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "forge")]
#[command(author = "RidgetopAI")]
#[command(version)]
#[command(about = "Reference harness for the Forge agent loop engine", long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file. Defaults to the platform config
    /// directory (see `Configuration::default_path`) if unset and the file
    /// doesn't exist there either, built-in defaults are used.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Anthropic API key. Overrides the `ANTHROPIC_API_KEY` environment
    /// variable.
    #[arg(long, env = "ANTHROPIC_API_KEY", hide_env_values = true)]
    pub anthropic_api_key: Option<String>,

    /// Model identifier passed to the Anthropic provider.
    #[arg(long, default_value = "claude-sonnet-4-5-20250929")]
    pub model: String,

    /// Maximum output tokens requested per completion.
    #[arg(long, default_value_t = 8_192)]
    pub max_tokens: u32,

    /// Override `max_iterations` from the loaded configuration.
    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Auto-approve every tool call instead of consulting the configured
    /// approval policy. Useful for unattended demonstration runs.
    #[arg(long, default_value_t = false)]
    pub auto_approve: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
