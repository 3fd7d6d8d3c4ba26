use anyhow::{Context, Result};
use tokio::sync::watch;
use tracing::debug;

use crate::agent::{AgentLoop, RunReport, RunStatus};
use crate::config::Config;
use crate::history::{self, History};
use crate::llm::{ChatMessage, LanguageModel};
use crate::prompts;
use crate::safety::SafetyPolicy;
use crate::ui::ConsoleUi;
use crate::util::{WorkingStatus, ask_or_eof};

/// The three ways to talk to the assistant. Chat answers questions and never
/// executes anything; complete suggests commands; agent runs the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Chat,
    Complete,
    Agent,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Chat => "chat",
            Mode::Complete => "complete",
            Mode::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<Mode> {
        match s.trim().to_lowercase().as_str() {
            "chat" => Some(Mode::Chat),
            "complete" => Some(Mode::Complete),
            "agent" => Some(Mode::Agent),
            _ => None,
        }
    }
}

fn spawn_interrupt_watcher() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

fn print_report(report: &RunReport) {
    let label = match report.status {
        RunStatus::Succeeded => "done",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
        RunStatus::Running | RunStatus::AwaitingConfirmation => "pending",
    };
    println!(
        "[{label}] {} ({} command{})",
        report.reason,
        report.steps_taken,
        if report.steps_taken == 1 { "" } else { "s" }
    );
}

/// One-shot `agent` subcommand: run a task to completion and persist the
/// session.
pub async fn run_agent_task(
    cfg: &Config,
    model: &dyn LanguageModel,
    session: &str,
    task: &str,
) -> Result<()> {
    let mut history = history::load_session_or_default(session)?;
    let policy = SafetyPolicy::from_config(cfg)?;
    let mut ui = ConsoleUi;
    let workdir = std::env::current_dir().context("cannot resolve current directory")?;
    let interrupt = spawn_interrupt_watcher();

    let report = AgentLoop::new(
        cfg,
        model,
        &policy,
        &mut ui,
        &mut history,
        interrupt,
        workdir,
    )
    .run(task)
    .await?;
    print_report(&report);
    history::save_session(session, &history)?;
    Ok(())
}

/// One chat exchange against the shared session history. Nothing said here
/// is classified or executed.
pub async fn run_chat_turn(
    cfg: &Config,
    model: &dyn LanguageModel,
    history: &mut History,
    message: &str,
) -> Result<String> {
    history.compact(cfg.history_max_messages, cfg.history_max_chars);
    history.push_user(message);
    let spinner = WorkingStatus::start("thinking");
    let reply = model
        .generate(&prompts::chat_system_prompt(), &history.messages)
        .await;
    spinner.finish();
    let reply = reply?;
    history.push_assistant(reply.clone());
    Ok(reply)
}

/// Print up to `count` command suggestions for a partial or natural-language
/// request, seeded with recent shell history.
pub async fn run_complete(
    cfg: &Config,
    model: &dyn LanguageModel,
    input: &str,
    count: usize,
) -> Result<()> {
    let history_lines = prompts::load_recent_shell_history(cfg.complete_history_lines);
    debug!(lines = history_lines.len(), "loaded shell history context");
    let prompt = prompts::complete_prompt(input, &history_lines);
    let spinner = WorkingStatus::start("completing");
    let reply = model
        .generate(&prompts::complete_system_prompt(), &[ChatMessage::user(prompt)])
        .await;
    spinner.finish();
    let suggestions = parse_suggestions(&reply?, count);
    if suggestions.is_empty() {
        println!("(no suggestions)");
        return Ok(());
    }
    for s in suggestions {
        println!("{s}");
    }
    Ok(())
}

/// Normalize a suggestion response into bare command lines: fences,
/// numbering, bullets and comment lines are stripped, duplicates dropped.
pub fn parse_suggestions(text: &str, count: usize) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for line in text.lines() {
        if out.len() >= count {
            break;
        }
        let mut line = line.trim();
        if line.is_empty() || line.starts_with("```") || line.starts_with('#') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("- ") {
            line = rest.trim();
        }
        let mut chars = line.char_indices().peekable();
        let mut digits_end = 0;
        while let Some((i, c)) = chars.peek().copied() {
            if c.is_ascii_digit() {
                digits_end = i + 1;
                chars.next();
            } else {
                break;
            }
        }
        if digits_end > 0
            && let Some(rest) = line[digits_end..]
                .strip_prefix('.')
                .or_else(|| line[digits_end..].strip_prefix(')'))
        {
            line = rest.trim();
        }
        if line.is_empty() || out.iter().any(|s| s == line) {
            continue;
        }
        out.push(line.to_string());
    }
    out
}

const REPL_HELP: &str = "\
commands:
  /mode [chat|complete|agent]   show or switch mode
  /session list                 list saved sessions
  /session use <name>           switch to another session
  /session rm <name>            delete a saved session
  /new                          start the session over
  /clear                        alias for /new
  /help                         this text
  /exit                         leave (Ctrl-D works too)";

/// Interactive REPL over the shared session history. Plain input goes to the
/// current mode; `/` lines are handled locally.
pub async fn run_session(cfg: &Config, model: &dyn LanguageModel, session: &str) -> Result<()> {
    let mut session = session.to_string();
    let mut history = history::load_session_or_default(&session)?;
    let policy = SafetyPolicy::from_config(cfg)?;
    let mut mode = Mode::Agent;

    println!(
        "shellpilot ({}) session `{session}`. /help for commands.",
        model.name()
    );

    loop {
        let Some(line) = ask_or_eof(&format!("{}> ", mode.as_str()))? else {
            break;
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('/') {
            if !handle_slash(rest, &mut mode, &mut session, &mut history)? {
                break;
            }
            continue;
        }

        let outcome = match mode {
            Mode::Chat => match run_chat_turn(cfg, model, &mut history, &line).await {
                Ok(reply) => {
                    println!("{reply}");
                    Ok(())
                }
                Err(err) => Err(err),
            },
            Mode::Complete => run_complete(cfg, model, &line, 5).await,
            Mode::Agent => {
                let mut ui = ConsoleUi;
                let interrupt = spawn_interrupt_watcher();
                // Each run starts back in the invoking directory; the cwd
                // cursor only persists between steps within one run.
                let workdir =
                    std::env::current_dir().context("cannot resolve current directory")?;
                let mut agent = AgentLoop::new(
                    cfg,
                    model,
                    &policy,
                    &mut ui,
                    &mut history,
                    interrupt,
                    workdir,
                );
                match agent.run(&line).await {
                    Ok(report) => {
                        print_report(&report);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }
        };
        if let Err(err) = outcome {
            eprintln!("error: {err:#}");
        }
        history::save_session(&session, &history)?;
    }

    history::save_session(&session, &history)?;
    println!("bye.");
    Ok(())
}

fn handle_slash(
    input: &str,
    mode: &mut Mode,
    session: &mut String,
    history: &mut History,
) -> Result<bool> {
    let mut parts = input.split_whitespace();
    let cmd = parts.next().unwrap_or_default();
    match cmd {
        "exit" | "quit" => return Ok(false),
        "help" => println!("{REPL_HELP}"),
        "mode" => match parts.next() {
            None => println!("mode: {}", mode.as_str()),
            Some(name) => match Mode::parse(name) {
                Some(m) => {
                    *mode = m;
                    println!("mode: {}", mode.as_str());
                }
                None => println!("unknown mode `{name}` (chat, complete, agent)"),
            },
        },
        "new" | "clear" => {
            history.clear();
            println!("session cleared.");
        }
        "session" => match (parts.next(), parts.next()) {
            (Some("list"), _) => {
                let names = history::list_saved_sessions()?;
                if names.is_empty() {
                    println!("(no saved sessions)");
                }
                for name in names {
                    let marker = if name == history::sanitize_session_name(session) {
                        " *"
                    } else {
                        ""
                    };
                    println!("{name}{marker}");
                }
            }
            (Some("use"), Some(name)) => {
                history::save_session(session, history)?;
                *history = history::load_session_or_default(name)?;
                *session = name.to_string();
                println!("session: {session}");
            }
            (Some("rm"), Some(name)) => {
                if history::remove_session_file(name)? {
                    println!("removed `{name}`.");
                } else {
                    println!("no session named `{name}`.");
                }
            }
            _ => println!("usage: /session list | use <name> | rm <name>"),
        },
        other => println!("unknown command `/{other}`. /help for commands."),
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_names_round_trip() {
        for mode in [Mode::Chat, Mode::Complete, Mode::Agent] {
            assert_eq!(Mode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(Mode::parse("AGENT"), Some(Mode::Agent));
        assert_eq!(Mode::parse("autopilot"), None);
    }

    #[test]
    fn suggestions_strip_fences_and_numbering() {
        let text = "```\n1. git status\n2) git log --oneline\n- git diff\n# a comment\n```";
        let s = parse_suggestions(text, 5);
        assert_eq!(s, vec!["git status", "git log --oneline", "git diff"]);
    }

    #[test]
    fn suggestions_are_deduplicated_and_capped() {
        let text = "ls\nls\npwd\nwhoami\ndate";
        let s = parse_suggestions(text, 3);
        assert_eq!(s, vec!["ls", "pwd", "whoami"]);
    }

    #[test]
    fn empty_reply_yields_no_suggestions() {
        assert!(parse_suggestions("```\n```", 5).is_empty());
    }

    #[test]
    fn zero_count_yields_no_suggestions() {
        assert!(parse_suggestions("ls\npwd\n", 0).is_empty());
    }
}
