mod agent;
mod cli;
mod config;
mod error;

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use agent::anthropic::AnthropicProvider;
use agent::approval::{AlwaysApprove, ApprovalGate, RuleBasedGate};
use agent::controller::{AgentLoopController, TurnOutcome};
use agent::event::Event;
use agent::memory::Memory;
use agent::models::ModelCatalog;
use agent::prompt::PromptBuilder;
use agent::provider::Provider;
use agent::tokens::DefaultTokenCounter;
use agent::tools::ToolRegistry;
use cli::Cli;
use config::Configuration;

/// `~/.local/share/forge/logs/` on Linux, the platform equivalent elsewhere.
fn log_dir() -> PathBuf {
    directories::ProjectDirs::from("com", "ridgetopai", "forge")
        .map(|dirs| dirs.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("/tmp/forge/logs"))
}

/// Structured logging to a daily-rotating file. The core itself never
/// writes to stdout/stderr directly;
/// this binary reserves stdout for the event stream it prints below.
fn init_logging(log_level: &str) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let log_path = log_dir();
    std::fs::create_dir_all(&log_path)?;

    let file_appender =
        tracing_appender::rolling::RollingFileAppender::new(tracing_appender::rolling::Rotation::DAILY, &log_path, "forge.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!(dir = %log_path.display(), "logging initialized");
    Ok(guard)
}

/// Render one event to a single human-readable line for the demonstration
/// binary's stdout. A real embedder would route these to a UI instead.
fn render_event(event: &Event) -> Option<String> {
    match event {
        Event::TurnStart => Some("--- turn start ---".to_string()),
        Event::TurnEnd => Some("--- turn end ---".to_string()),
        Event::IterationStart { iteration } => Some(format!("[iteration {iteration}]")),
        Event::IterationEnd { .. } => None,
        Event::ThinkingStart => Some("(thinking)".to_string()),
        Event::ThinkingChunk(text) => Some(format!("  {text}")),
        Event::ThinkingEnd => None,
        Event::MessageStart => None,
        Event::MessageChunk(text) => Some(text.clone()),
        Event::MessageEnd => None,
        Event::ToolCallStart { tool_name, .. } => {
            Some(format!("-> calling {}...", tool_name.as_deref().unwrap_or("?")))
        }
        Event::ToolCall { name, args } => Some(format!("-> {name}({args})")),
        Event::ToolResult { name, text } => Some(format!("<- {name}: {text}")),
        Event::ToolError { name, error } => Some(format!("<- {name} failed: {error}")),
        Event::ApprovalRequest { tool, .. } => Some(format!("approval requested for '{tool}'")),
        Event::ApprovalResolved { decision, .. } => Some(format!("approval resolved: {decision:?}")),
        Event::Error { kind, detail } => Some(format!("error [{kind}]: {detail}")),
        Event::SummarizationProgress { index, total } => {
            Some(format!("summarizing ({index}/{total})..."))
        }
    }
}

async fn print_events(mut rx: broadcast::Receiver<Event>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                if let Some(line) = render_event(&event) {
                    println!("{line}");
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();
    let _log_guard = init_logging(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => Configuration::load(path)?,
        None => match Configuration::default_path() {
            Ok(path) => Configuration::load(&path)?,
            Err(_) => Configuration::default(),
        },
    };
    if let Some(max_iterations) = cli.max_iterations {
        config.loop_limits.max_iterations = max_iterations;
    }

    let api_key = cli
        .anthropic_api_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("an Anthropic API key is required (--anthropic-api-key or ANTHROPIC_API_KEY)"))?;

    let provider: Arc<dyn Provider> = Arc::new(AnthropicProvider::new(api_key, cli.model.clone(), cli.max_tokens));

    let catalog = Arc::new(ModelCatalog::new());
    let counter = Arc::new(DefaultTokenCounter::new(catalog));
    let memory = Arc::new(Memory::new(cli.model.clone(), counter));

    let prompt_builder = PromptBuilder::new(config.prompt.system_prompt_text.clone())
        .with_custom_instructions(config.prompt.custom_instructions.clone());

    let registry = Arc::new(ToolRegistry::new());

    let approval: Arc<dyn ApprovalGate> = if cli.auto_approve {
        Arc::new(AlwaysApprove)
    } else {
        Arc::new(RuleBasedGate::new(config.approval_policy.clone()))
    };

    let (events_tx, events_rx) = broadcast::channel(1024);
    tokio::spawn(print_events(events_rx));

    let controller = AgentLoopController::new(
        memory,
        prompt_builder,
        provider,
        registry,
        approval,
        config.context.clone(),
        config.loop_limits.clone(),
        cli.model.clone(),
        events_tx,
    );

    println!("Forge reference harness. Type a task and press enter (Ctrl-D to exit).");
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        print!("> ");
        io::stdout().flush()?;
        line.clear();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        let cancel = agent::cancel::CancellationToken::new();
        match controller.run_turn(input.to_string(), cancel).await {
            TurnOutcome::Ok(text) => println!("\n{text}\n"),
            TurnOutcome::Fatal(err) => {
                tracing::warn!(%err, "turn ended fatally");
                println!("\n(turn failed: {err})\n");
            }
        }
    }

    Ok(())
}
