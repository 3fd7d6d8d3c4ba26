mod agent;
mod cli;
mod config;
mod error;
mod executor;
mod history;
mod llm;
mod mode;
mod prompts;
mod safety;
mod ui;
mod util;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, ConfigAction};
use crate::config::{Autonomy, Config, backend_defaults};
use crate::llm::HttpModel;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("shellpilot=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Session {
        session: "default".to_string(),
    });

    match command {
        Commands::Config { action } => handle_config(action),
        Commands::Session { session } => {
            let cfg = config::load_config_or_default()?;
            let model = HttpModel::from_config(&cfg)?;
            mode::run_session(&cfg, &model, &session).await
        }
        Commands::Agent {
            task,
            session,
            auto,
            max_steps,
            no_safe_mode,
        } => {
            let mut cfg = config::load_config_or_default()?;
            if auto {
                cfg.autonomy = Autonomy::Automatic;
            }
            if no_safe_mode {
                cfg.safe_mode = false;
            }
            if let Some(n) = max_steps {
                cfg.max_steps = n;
            }
            let model = HttpModel::from_config(&cfg)?;
            mode::run_agent_task(&cfg, &model, &session, &task.join(" ")).await
        }
        Commands::Chat { message, session } => {
            let cfg = config::load_config_or_default()?;
            let model = HttpModel::from_config(&cfg)?;
            let mut history = history::load_session_or_default(&session)?;
            let reply =
                mode::run_chat_turn(&cfg, &model, &mut history, &message.join(" ")).await?;
            println!("{reply}");
            history::save_session(&session, &history)
        }
        Commands::Complete { input, count } => {
            let cfg = config::load_config_or_default()?;
            let model = HttpModel::from_config(&cfg)?;
            mode::run_complete(&cfg, &model, &input.join(" "), count).await
        }
    }
}

fn handle_config(action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init => {
            let cfg = Config::default();
            config::save_config(&cfg)?;
            println!("wrote {}", config::config_path()?.display());
        }
        ConfigAction::Show => {
            let cfg = config::load_config_or_default()?;
            print!("{}", toml::to_string_pretty(&cfg)?);
        }
        ConfigAction::Set {
            backend,
            base_url,
            model,
            api_key_env,
            api_key,
            max_steps,
            max_idle_steps,
            safe_mode,
            autonomy,
            command_timeout_secs,
        } => {
            let mut cfg = config::load_config_or_default()?;
            if let Some(backend) = backend {
                cfg.backend = backend;
                let (url, default_model, key_env) = backend_defaults(backend);
                if base_url.is_none() {
                    cfg.base_url = url;
                }
                if model.is_none() {
                    cfg.model = default_model;
                }
                if api_key_env.is_none() {
                    cfg.api_key_env = key_env;
                }
            }
            if let Some(v) = base_url {
                cfg.base_url = v;
            }
            if let Some(v) = model {
                cfg.model = v;
            }
            if let Some(v) = api_key_env {
                cfg.api_key_env = v;
            }
            if let Some(v) = api_key {
                cfg.api_key = Some(v);
            }
            if let Some(v) = max_steps {
                cfg.max_steps = v;
            }
            if let Some(v) = max_idle_steps {
                cfg.max_idle_steps = v;
            }
            if let Some(v) = safe_mode {
                cfg.safe_mode = v;
            }
            if let Some(v) = autonomy {
                cfg.autonomy = v;
            }
            if let Some(v) = command_timeout_secs {
                cfg.command_timeout_secs = v;
            }
            config::save_config(&cfg)?;
            println!("updated {}", config::config_path()?.display());
        }
    }
    Ok(())
}
