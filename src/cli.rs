use clap::{Parser, Subcommand};

use crate::config::{Autonomy, Backend};

#[derive(Parser)]
#[command(
    name = "shellpilot",
    version,
    about = "LLM-backed terminal assistant: chat, command completion, and a safety-gated agent"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Interactive session (default when no subcommand is given)
    Session {
        /// Session name to load and save
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Run one task through the agent loop
    Agent {
        /// The task, in plain language
        #[arg(required = true)]
        task: Vec<String>,
        #[arg(long, default_value = "default")]
        session: String,
        /// Run unattended (no confirmation prompts unless safe mode insists)
        #[arg(long)]
        auto: bool,
        /// Override the step budget for this run
        #[arg(long)]
        max_steps: Option<usize>,
        /// Disable safe mode for this run
        #[arg(long)]
        no_safe_mode: bool,
    },
    /// Ask a question; nothing is executed
    Chat {
        #[arg(required = true)]
        message: Vec<String>,
        #[arg(long, default_value = "default")]
        session: String,
    },
    /// Suggest shell commands for a partial or natural-language input
    Complete {
        #[arg(required = true)]
        input: Vec<String>,
        /// Number of suggestions
        #[arg(short, long, default_value_t = 5)]
        count: usize,
    },
    /// Inspect or change the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub enum ConfigAction {
    /// Write a fresh default config file
    Init,
    /// Print the active configuration
    Show,
    /// Update configuration fields
    Set {
        /// Backend kind; switching also applies that backend's default
        /// URL and model unless given explicitly
        #[arg(long)]
        backend: Option<Backend>,
        #[arg(long)]
        base_url: Option<String>,
        #[arg(long)]
        model: Option<String>,
        /// Environment variable to read the API key from
        #[arg(long)]
        api_key_env: Option<String>,
        /// API key stored directly in the config file
        #[arg(long)]
        api_key: Option<String>,
        #[arg(long)]
        max_steps: Option<usize>,
        #[arg(long)]
        max_idle_steps: Option<usize>,
        #[arg(long)]
        safe_mode: Option<bool>,
        #[arg(long)]
        autonomy: Option<Autonomy>,
        #[arg(long)]
        command_timeout_secs: Option<u64>,
    },
}
