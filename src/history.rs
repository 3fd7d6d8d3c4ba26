use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::executor::ExecutionResult;
use crate::llm::ChatMessage;
use crate::safety::SafetyVerdict;
use crate::util::truncate_with_suffix;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepAction {
    Command(String),
    FinalAnswer(String),
    Clarification(String),
}

/// One plan→classify→execute cycle. Steps are append-only; past steps are
/// never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub index: usize,
    pub action: StepAction,
    #[serde(default)]
    pub verdict: Option<SafetyVerdict>,
    #[serde(default)]
    pub result: Option<ExecutionResult>,
    pub at: DateTime<Utc>,
}

/// Ordered record of a session: the conversation transcript the model sees
/// plus the structured step log. Shared by all three modes so switching
/// modes mid-session keeps context.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct History {
    pub messages: Vec<ChatMessage>,
    pub steps: Vec<Step>,
}

impl History {
    pub fn push_user(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.messages.push(ChatMessage::assistant(content));
    }

    pub fn record_step(
        &mut self,
        action: StepAction,
        verdict: Option<SafetyVerdict>,
        result: Option<ExecutionResult>,
    ) {
        let step = Step {
            index: self.steps.len(),
            action,
            verdict,
            result,
            at: Utc::now(),
        };
        self.steps.push(step);
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.steps.clear();
    }

    /// Fold older messages into a short summary once the transcript exceeds
    /// its budgets, keeping the most recent tail verbatim.
    pub fn compact(&mut self, max_messages: usize, max_chars: usize) {
        let max_messages = max_messages.max(4);
        let max_chars = max_chars.max(2000);
        let total_chars = self
            .messages
            .iter()
            .map(|m| m.content.chars().count())
            .sum::<usize>();
        if self.messages.len() <= max_messages && total_chars <= max_chars {
            return;
        }
        if self.messages.len() < 8 {
            return;
        }

        let tail_keep = (max_messages / 2)
            .max(6)
            .min(self.messages.len().saturating_sub(1));
        let split_at = self.messages.len().saturating_sub(tail_keep);
        if split_at == 0 {
            return;
        }

        let summary = summarize_messages(&self.messages[..split_at]);
        let mut compacted = Vec::with_capacity(tail_keep + 1);
        compacted.push(ChatMessage::assistant(format!("[session-summary]\n{summary}")));
        compacted.extend_from_slice(&self.messages[split_at..]);
        self.messages = compacted;
    }
}

fn summarize_messages(messages: &[ChatMessage]) -> String {
    let mut lines = Vec::new();
    for m in messages.iter().rev().take(20).rev() {
        let role = if m.role == "user" { "user" } else { "assistant" };
        let short = truncate_with_suffix(m.content.trim(), 220, "...");
        lines.push(format!("- {}: {}", role, short.replace('\n', " ")));
    }
    let mut out = String::new();
    out.push_str("Compressed earlier context:\n");
    out.push_str(&lines.join("\n"));
    truncate_with_suffix(&out, 4000, "...\n[summary truncated]")
}

pub fn sessions_dir() -> Result<PathBuf> {
    Ok(crate::config::config_dir()?.join("sessions"))
}

pub fn sanitize_session_name(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.is_empty() { "session".to_string() } else { s }
}

pub fn load_session_or_default(session: &str) -> Result<History> {
    load_session_in(&sessions_dir()?, session)
}

pub fn save_session(session: &str, history: &History) -> Result<()> {
    save_session_in(&sessions_dir()?, session, history)
}

pub fn list_saved_sessions() -> Result<Vec<String>> {
    list_sessions_in(&sessions_dir()?)
}

pub fn remove_session_file(session: &str) -> Result<bool> {
    let path = sessions_dir()?.join(format!("{}.json", sanitize_session_name(session)));
    if !path.exists() {
        return Ok(false);
    }
    fs::remove_file(&path).with_context(|| format!("Failed to remove {}", path.display()))?;
    Ok(true)
}

fn load_session_in(dir: &Path, session: &str) -> Result<History> {
    let path = dir.join(format!("{}.json", sanitize_session_name(session)));
    if !path.exists() {
        return Ok(History::default());
    }
    let text =
        fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    let parsed: History = serde_json::from_str(&text)
        .with_context(|| format!("Invalid session JSON: {}", path.display()))?;
    Ok(parsed)
}

fn save_session_in(dir: &Path, session: &str, history: &History) -> Result<()> {
    let path = dir.join(format!("{}.json", sanitize_session_name(session)));
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create session dir {}", dir.display()))?;
    let text = serde_json::to_string_pretty(history)?;
    fs::write(&path, text).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn list_sessions_in(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("Failed to read session dir {}", dir.display()))?
    {
        let entry = entry.with_context(|| format!("Failed to read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            names.push(stem.to_string());
        }
    }
    names.sort();
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steps_are_append_only_with_increasing_indexes() {
        let mut h = History::default();
        h.record_step(StepAction::Command("ls".into()), None, None);
        h.record_step(StepAction::FinalAnswer("done".into()), None, None);
        assert_eq!(h.steps.len(), 2);
        assert_eq!(h.steps[0].index, 0);
        assert_eq!(h.steps[1].index, 1);
    }

    #[test]
    fn session_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = History::default();
        h.push_user("list files");
        h.push_assistant("{\"command\": \"ls\"}");
        h.record_step(
            StepAction::Command("ls".into()),
            Some(SafetyVerdict::Safe),
            None,
        );
        save_session_in(dir.path(), "test one", &h).unwrap();

        let loaded = load_session_in(dir.path(), "test one").unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.steps.len(), 1);

        let names = list_sessions_in(dir.path()).unwrap();
        assert_eq!(names, vec!["test_one".to_string()]);
    }

    #[test]
    fn missing_session_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let h = load_session_in(dir.path(), "nope").unwrap();
        assert!(h.messages.is_empty());
    }

    #[test]
    fn compaction_keeps_the_tail_and_adds_a_summary() {
        let mut h = History::default();
        for i in 0..30 {
            h.push_user(format!("message number {i} with some padding text"));
        }
        h.compact(10, 2000);
        assert!(h.messages.len() < 30);
        assert!(h.messages[0].content.starts_with("[session-summary]"));
        assert!(
            h.messages
                .last()
                .unwrap()
                .content
                .contains("message number 29")
        );
    }

    #[test]
    fn small_histories_are_left_alone() {
        let mut h = History::default();
        h.push_user("hi");
        h.compact(10, 2000);
        assert_eq!(h.messages.len(), 1);
    }
}
