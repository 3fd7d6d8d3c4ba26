use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::config::Config;
use crate::config::resolve_api_key;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

/// The reasoning capability the loop consumes. One method, two shipped
/// implementations (remote endpoint, local server) selected at config time;
/// tests supply scripted variants.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;
    async fn generate(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<String>;
}

/// OpenAI-compatible chat-completions client. Covers both the remote and the
/// local backend; the only difference is the URL and whether a key is sent.
pub struct HttpModel {
    base_url: String,
    model: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpModel {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let api_key = resolve_api_key(cfg)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.llm_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            base_url: cfg.base_url.clone(),
            model: cfg.model.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl LanguageModel for HttpModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, system_prompt: &str, history: &[ChatMessage]) -> Result<String> {
        let mut messages = vec![json!({"role": "system", "content": system_prompt})];
        for m in history {
            messages.push(json!({"role": m.role, "content": m.content}));
        }
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.2,
        });

        debug!(model = %self.model, messages = history.len(), "requesting completion");
        let mut req = self.client.post(&self.base_url).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .with_context(|| format!("Request failed: {}", self.base_url))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.context("Failed to read response body")?;
            bail!("API error {}: {}", status, text);
        }

        let text = resp.text().await.context("Failed to read response body")?;
        let val: Value = serde_json::from_str(&text).context("Invalid JSON response")?;
        let out = extract_content(&val).context("Cannot parse response content")?;
        Ok(out.trim().to_string())
    }
}

fn extract_content(value: &Value) -> Option<String> {
    let content = value.get("choices")?.get(0)?.get("message")?.get("content")?;

    match content {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => {
            let mut out = String::new();
            for item in items {
                if item.get("type").and_then(|t| t.as_str()) == Some("text")
                    && let Some(t) = item.get("text").and_then(|t| t.as_str())
                {
                    out.push_str(t);
                }
            }
            if out.is_empty() { None } else { Some(out) }
        }
        _ => None,
    }
}

/// One decoded planning step: exactly a command, a final answer, or a
/// clarification question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Command {
        command: String,
        thought: Option<String>,
    },
    FinalAnswer {
        summary: String,
        success: bool,
    },
    Clarification {
        question: String,
    },
}

/// Decode a model response into a `Plan`. The contract is a single JSON
/// object, fenced or inline, with either a `command` field or a `status`
/// field (`success` / `failed` / `interaction`). Returns `None` for anything
/// else; the loop surfaces that as a clarification instead of guessing.
pub fn parse_plan(response: &str) -> Option<Plan> {
    for block in fenced_json_blocks(response) {
        if let Ok(value) = serde_json::from_str::<Value>(&block)
            && let Some(plan) = plan_from_value(&value)
        {
            return Some(plan);
        }
    }

    // Fallback: first balanced top-level JSON object in free text.
    let bytes = response.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let Some(end) = find_matching_brace(response, i) else {
            i += 1;
            continue;
        };
        let candidate = &response[i..=end];
        if let Ok(value) = serde_json::from_str::<Value>(candidate)
            && let Some(plan) = plan_from_value(&value)
        {
            return Some(plan);
        }
        i = end + 1;
    }
    None
}

fn plan_from_value(value: &Value) -> Option<Plan> {
    let map = value.as_object()?;
    if let Some(status) = map.get("status").and_then(|v| v.as_str()) {
        if status == "interaction" {
            let question = map
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .trim()
                .to_string();
            if question.is_empty() {
                return None;
            }
            return Some(Plan::Clarification { question });
        }
        let summary = map
            .get("summary")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim()
            .to_string();
        return Some(Plan::FinalAnswer {
            summary,
            success: status == "success",
        });
    }
    let command = map.get("command").and_then(|v| v.as_str())?.trim();
    if command.is_empty() {
        return None;
    }
    let thought = map
        .get("thought")
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());
    Some(Plan::Command {
        command: command.to_string(),
        thought,
    })
}

fn fenced_json_blocks(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let open = "```json";
    let close = "```";
    let mut i = 0usize;
    while i < text.len() {
        let Some(pos) = text[i..].find(open) else {
            break;
        };
        let body_start = i + pos + open.len();
        let Some(end_rel) = text[body_start..].find(close) else {
            break;
        };
        let block = text[body_start..body_start + end_rel].trim();
        if !block.is_empty() {
            out.push(block.to_string());
        }
        i = body_start + end_rel + close.len();
    }
    out
}

fn find_matching_brace(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    if bytes.get(start).copied() != Some(b'{') {
        return None;
    }
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                if depth == 0 {
                    return None;
                }
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_command() {
        let text = "Let me check.\n```json\n{\"thought\": \"list it\", \"command\": \"ls -la\"}\n```";
        let plan = parse_plan(text).unwrap();
        assert_eq!(
            plan,
            Plan::Command {
                command: "ls -la".to_string(),
                thought: Some("list it".to_string()),
            }
        );
    }

    #[test]
    fn parses_inline_final_answer() {
        let text = "{\"status\": \"success\", \"summary\": \"Done\"}";
        let plan = parse_plan(text).unwrap();
        assert_eq!(
            plan,
            Plan::FinalAnswer {
                summary: "Done".to_string(),
                success: true,
            }
        );
    }

    #[test]
    fn parses_clarification() {
        let text = "```json\n{\"status\": \"interaction\", \"message\": \"Which directory?\"}\n```";
        assert_eq!(
            parse_plan(text).unwrap(),
            Plan::Clarification {
                question: "Which directory?".to_string()
            }
        );
    }

    #[test]
    fn prose_is_not_a_plan() {
        assert!(parse_plan("I think you should run ls.").is_none());
    }

    #[test]
    fn nested_braces_in_strings_do_not_confuse_the_scanner() {
        let text = "noise {\"command\": \"awk '{print $1}' file\"} trailing";
        let plan = parse_plan(text).unwrap();
        assert_eq!(
            plan,
            Plan::Command {
                command: "awk '{print $1}' file".to_string(),
                thought: None,
            }
        );
    }

    #[test]
    fn failed_status_maps_to_unsuccessful_answer() {
        let text = "{\"status\": \"failed\", \"summary\": \"cannot proceed\"}";
        assert_eq!(
            parse_plan(text).unwrap(),
            Plan::FinalAnswer {
                summary: "cannot proceed".to_string(),
                success: false,
            }
        );
    }

    #[test]
    fn extracts_plain_string_content() {
        let val: Value = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hello"}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(&val).unwrap(), "hello");
    }

    #[test]
    fn extracts_segmented_content() {
        let val: Value = serde_json::from_str(
            r#"{"choices":[{"message":{"content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(&val).unwrap(), "ab");
    }
}
