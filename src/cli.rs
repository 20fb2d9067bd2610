//! CLI command definitions

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// opsagent - LLM-driven administration of remote Unix hosts
#[derive(Parser)]
#[command(
    name = "opsagent",
    about = "LLM-driven administration agent for remote Unix hosts",
    version
)]
pub struct Cli {
    /// Path to the agent config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the server profile file
    #[arg(short, long, global = true)]
    pub server: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Write starter config and server profile files
    Init,

    /// Inspect or validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show provider availability and agent statistics
    Status,

    /// Plan and execute a goal on the target host
    Execute {
        /// The goal, in natural language
        goal: String,

        /// Analyze and report without executing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Show past executions
    History {
        /// Number of entries to show
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },

    /// Remove stale history and error records
    Cleanup {
        /// Drop records older than this many days
        #[arg(short, long, default_value_t = 7)]
        days: i64,
    },

    /// Read goals interactively from stdin
    Interactive,
}

/// Configuration subcommands
#[derive(Subcommand)]
pub enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Check the configuration files for problems
    Validate,
    /// Open the config file in $EDITOR
    Edit,
}
