//! CLI command definitions

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::llm::Tier;

/// agentloop - bounded execution engine for autonomous LLM agents
#[derive(Parser)]
#[command(
    name = "al",
    about = "Run an autonomous agent task inside a bounded, observable loop",
    version
)]
pub struct Cli {
    /// Path to config file (YAML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Run one task to completion
    Run {
        /// The task text
        task: String,

        /// Working directory (scope root)
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Session id for persistent memory and KPI baselines
        #[arg(short, long, default_value = "default")]
        session: String,

        /// Starting model tier
        #[arg(short, long, value_enum, default_value = "small")]
        tier: CliTier,

        /// Print the collected trace after the run
        #[arg(long)]
        trace: bool,
    },
}

/// Tier argument.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliTier {
    Small,
    Medium,
    Large,
}

impl From<CliTier> for Tier {
    fn from(tier: CliTier) -> Self {
        match tier {
            CliTier::Small => Tier::Small,
            CliTier::Medium => Tier::Medium,
            CliTier::Large => Tier::Large,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = Cli::parse_from(["al", "run", "where is Foo"]);
        let Command::Run { task, session, tier, .. } = cli.command;
        assert_eq!(task, "where is Foo");
        assert_eq!(session, "default");
        assert!(matches!(tier, CliTier::Small));
    }
}
