//! CLI interface for Cadence
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for the Cadence binary.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Cadence Workflow Orchestrator
///
/// Decomposes a task description into a graph of role-tagged steps, runs
/// them against a step backend, and forwards compacted context between
/// steps.
#[derive(Parser, Debug)]
#[command(name = "cadence")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Plan and execute a task
    Run {
        /// The task description
        description: String,

        /// Declared task type (feature, bug_fix, review, custom, auto)
        #[arg(long, default_value = "auto")]
        task_type: String,

        /// Execution mode override (sequential, parallel, graph)
        #[arg(long)]
        mode: Option<String>,

        /// Delegate planning to the backend instead of the heuristic
        /// templates
        #[arg(long)]
        plan_with_model: bool,

        /// Print the planned workflow without executing it
        #[arg(long)]
        dry_run: bool,
    },

    /// Show recent tasks
    History {
        /// Maximum number of tasks to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}
