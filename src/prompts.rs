use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;

use crate::error::AgentError;
use crate::executor::ExecutionResult;
use crate::util::clip_output;

const OBSERVATION_CLIP: usize = 8000;

fn environment_preamble(workdir: &Path) -> String {
    let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
    format!(
        "Environment: os={}, shell={}, cwd={}",
        env::consts::OS,
        shell,
        workdir.display()
    )
}

pub fn agent_system_prompt(automatic: bool, workdir: &Path) -> String {
    let mut prompt = String::new();
    prompt.push_str(
        "You are a terminal assistant that completes tasks by running shell commands, \
         one at a time.\n",
    );
    prompt.push_str(&environment_preamble(workdir));
    prompt.push_str(
        "\n\nRespond with exactly one JSON object per turn, inside a ```json fence:\n\
         - To run a command: {\"thought\": \"why\", \"command\": \"the shell command\"}\n\
         - When the task is complete: {\"status\": \"success\", \"summary\": \"what was done\"}\n\
         - When the task cannot be completed: {\"status\": \"failed\", \"summary\": \"why\"}\n",
    );
    if automatic {
        prompt.push_str(
            "You are running unattended. Never ask the user anything; \
             choose the most reasonable interpretation and proceed.\n",
        );
    } else {
        prompt.push_str(
            "- To ask the user a question before proceeding: \
             {\"status\": \"interaction\", \"message\": \"the question\"}\n",
        );
    }
    prompt.push_str(
        "Rules: one command per turn, no interactive editors or pagers, \
         prefer narrow commands over broad ones, and never invent output you did not observe.",
    );
    prompt
}

pub fn chat_system_prompt() -> String {
    "You are a terminal assistant in chat mode. Answer questions about shells, \
     tools, and systems concisely. You may suggest commands as plain text, but \
     nothing you write is executed."
        .to_string()
}

pub fn complete_system_prompt() -> String {
    format!(
        "You are a shell command completion engine on {}. Given a partial or \
         natural-language request and the user's recent command history, reply \
         with candidate commands only, one per line, most likely first. \
         No explanations, no numbering, no code fences.",
        env::consts::OS
    )
}

pub fn task_prompt(task: &str) -> String {
    format!("Task: {task}\nWork step by step and report when done.")
}

pub fn complete_prompt(input: &str, history_lines: &[String]) -> String {
    let history = if history_lines.is_empty() {
        "(no history)".to_string()
    } else {
        history_lines.join("\n")
    };
    format!("Recent commands:\n{history}\n\nRequest: {input}")
}

/// Rendered execution result fed back to the model as the next observation.
pub fn observation(command: &str, result: &ExecutionResult) -> String {
    let mut out = format!(
        "Executed: {command}\nExit code: {}\n",
        result.exit_code
    );
    if result.timed_out {
        out.push_str(&format!(
            "{}\n",
            AgentError::ExecutionTimeout(result.elapsed)
        ));
    }
    if !result.stdout.trim().is_empty() {
        out.push_str("Stdout:\n");
        out.push_str(&clip_output(&result.stdout, OBSERVATION_CLIP));
        out.push('\n');
    }
    if !result.stderr.trim().is_empty() {
        out.push_str("Stderr:\n");
        out.push_str(&clip_output(&result.stderr, OBSERVATION_CLIP));
        out.push('\n');
    }
    if result.stdout.trim().is_empty() && result.stderr.trim().is_empty() {
        out.push_str("(no output)\n");
    }
    out.push_str(&format!("Working directory: {}\n", result.workdir.display()));
    out.push_str(
        "Continue with the next command, or report status when the task is complete.",
    );
    out
}

/// Recent shell history for completion context. Honors HISTFILE, falls back
/// to the common zsh/bash locations, tolerates the zsh `: ts:0;cmd` format.
pub fn load_recent_shell_history(max_lines: usize) -> Vec<String> {
    let path = env::var("HISTFILE").ok().or_else(|| {
        let home = dirs::home_dir()?;
        for name in [".zsh_history", ".bash_history"] {
            let candidate = home.join(name);
            if candidate.exists() {
                return Some(candidate.to_string_lossy().to_string());
            }
        }
        None
    });
    let Some(path) = path else {
        return Vec::new();
    };
    let Ok(text) = fs::read_to_string(&path) else {
        return Vec::new();
    };
    parse_shell_history(&text, max_lines)
}

/// Most recent first, deduplicated, capped at `max_lines`.
pub fn parse_shell_history(text: &str, max_lines: usize) -> Vec<String> {
    let mut recent: Vec<String> = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let cmd = if line.starts_with(": ") && line.contains(';') {
            // zsh extended history: `: <timestamp>:<elapsed>;<command>`
            match line.split_once(';') {
                Some((_, cmd)) => cmd.trim(),
                None => line,
            }
        } else {
            line
        };
        if !cmd.is_empty() {
            recent.push(cmd.to_string());
        }
    }

    let mut seen = HashSet::new();
    let mut ordered = Vec::new();
    for cmd in recent.into_iter().rev() {
        if seen.insert(cmd.clone()) {
            ordered.push(cmd);
        }
        if ordered.len() == max_lines {
            break;
        }
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    #[test]
    fn parses_zsh_extended_history() {
        let text = ": 1700000000:0;git status\n: 1700000001:0;ls -la\nplain command\n";
        let lines = parse_shell_history(text, 10);
        assert_eq!(lines, vec!["plain command", "ls -la", "git status"]);
    }

    #[test]
    fn history_is_deduplicated_most_recent_first() {
        let text = "ls\ngit status\nls\n";
        let lines = parse_shell_history(text, 10);
        assert_eq!(lines, vec!["ls", "git status"]);
    }

    #[test]
    fn history_respects_the_cap() {
        let text = "a\nb\nc\nd\n";
        let lines = parse_shell_history(text, 2);
        assert_eq!(lines, vec!["d", "c"]);
    }

    #[test]
    fn observation_includes_streams_and_cwd() {
        let r = ExecutionResult {
            exit_code: 0,
            stdout: "file.txt\n".to_string(),
            stderr: String::new(),
            elapsed: Duration::from_millis(12),
            timed_out: false,
            workdir: PathBuf::from("/tmp"),
        };
        let obs = observation("ls", &r);
        assert!(obs.contains("Executed: ls"));
        assert!(obs.contains("file.txt"));
        assert!(obs.contains("Working directory: /tmp"));
    }

    #[test]
    fn observation_marks_timeouts() {
        let r = ExecutionResult {
            exit_code: 124,
            stdout: String::new(),
            stderr: String::new(),
            elapsed: Duration::from_secs(30),
            timed_out: true,
            workdir: PathBuf::from("/tmp"),
        };
        let obs = observation("sleep 100", &r);
        assert!(obs.contains("timed out"));
    }
}
