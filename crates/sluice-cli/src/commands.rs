//! CLI command definitions.

use crate::config::OutputFormat;
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline file and compile its graph
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "sluice.yaml")]
        path: PathBuf,
    },

    /// Print the compiled execution graph
    Graph {
        /// Path to pipeline file
        #[arg(default_value = "sluice.yaml")]
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Print the JSON schema of pipeline files
    Schema,

    /// Run a single task on the local docker daemon
    Task(TaskArgs),

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Args, Debug)]
pub struct TaskArgs {
    /// Shell script to run
    #[arg(required_unless_present = "plugin")]
    pub script: Option<String>,

    /// Container image
    #[arg(short, long)]
    pub image: Option<String>,

    /// Plugin to run instead of a script
    #[arg(short, long)]
    pub plugin: Option<String>,

    /// Directory holding plugins
    #[arg(long)]
    pub plugin_dir: Option<PathBuf>,

    /// Input passed as an environment variable (KEY=VALUE)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,

    /// Seconds before the task is killed
    #[arg(short, long, default_value_t = sluice_core::task::DEFAULT_TASK_TIMEOUT_SECS)]
    pub timeout: u64,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}
