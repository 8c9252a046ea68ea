//! agentloop CLI entry point
//!
//! Thin bootstrap: wires the Anthropic client, a file session store and a
//! stdout event printer around the engine. Tool registries are supplied by
//! embedding applications; the bare CLI runs with engine tools only.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use serde_json::Value;
use tracing::info;

use agentloop::cli::{Cli, Command};
use agentloop::config::EngineConfig;
use agentloop::events::{AgentEventKind, EventBus};
use agentloop::llm::AnthropicClient;
use agentloop::r#loop::AgentEngine;
use agentloop::tools::{ToolContext, ToolRegistry, ToolResult};
use agentloop::{RunSpec, ToolDefinition};
use sessionstore::FileSessionStore;

/// Registry with no external tools; the engine's own tools (report,
/// reflect_on_progress) still work. Embedders bring their own registry.
struct EmptyToolRegistry;

#[async_trait]
impl ToolRegistry for EmptyToolRegistry {
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }

    async fn execute(&self, name: &str, _input: Value, _ctx: &ToolContext) -> ToolResult {
        ToolResult::error(format!("Unknown tool: {name}"))
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn print_events(bus: &Arc<EventBus>) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = rx.recv().await {
            match &event.kind {
                AgentEventKind::IterationStart { iteration, .. } => {
                    println!("{} iteration {}", "▸".blue(), iteration);
                }
                AgentEventKind::ToolStart { tool_name, .. } => {
                    println!("  {} {}", "tool".dimmed(), tool_name);
                }
                AgentEventKind::ToolError { tool_name, error, .. } => {
                    println!("  {} {} {}", "tool".red(), tool_name, error.dimmed());
                }
                AgentEventKind::StatusChange { status, detail } => {
                    println!("{} {} {}", "·".dimmed(), status.yellow(), detail.dimmed());
                }
                AgentEventKind::SynthesisForced { reason } => {
                    println!("{} forced synthesis ({reason})", "!".yellow());
                }
                _ => {}
            }
        }
    })
}

/// Default config location: `~/.config/agentloop/config.yaml`.
fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("agentloop").join("config.yaml"))
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_yaml_file(path)?,
        None => match default_config_path().filter(|p| p.exists()) {
            Some(path) => EngineConfig::from_yaml_file(path)?,
            None => EngineConfig::default(),
        },
    };

    let Command::Run {
        task,
        dir,
        session,
        tier,
        trace,
    } = cli.command;

    let dir: PathBuf = dir.canonicalize().context("working directory does not exist")?;
    let llm = Arc::new(AnthropicClient::from_env(
        "ANTHROPIC_API_KEY",
        "https://api.anthropic.com",
        Duration::from_secs(120),
    )?);
    let store = Arc::new(FileSessionStore::open(sessionstore::default_memory_dir(&dir))?);

    let engine = AgentEngine::new(config, llm, Arc::new(EmptyToolRegistry), store);
    let printer = print_events(engine.bus());

    let spec = RunSpec::new(session, dir, task).with_tier(tier.into());
    info!(agent_id = %spec.agent_id, "starting run");
    let result = engine.execute(spec).await;
    printer.abort();

    println!();
    if result.success {
        println!("{}", "✓ completed".green().bold());
    } else {
        println!(
            "{} {}",
            "✗ failed".red().bold(),
            result.error.as_deref().unwrap_or("").dimmed()
        );
    }
    println!(
        "{}",
        format!(
            "iterations: {}, tokens: {}, files read/modified/created: {}/{}/{}",
            result.iterations,
            result.tokens_used,
            result.files_read.len(),
            result.files_modified.len(),
            result.files_created.len()
        )
        .dimmed()
    );
    println!("\n{}", result.summary);

    if trace {
        println!("\n{}", "trace:".dimmed());
        for event in &result.trace {
            println!("{}", serde_json::to_string(event)?);
        }
    }

    if result.success { Ok(()) } else { std::process::exit(1) }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);
    run(cli).await
}
