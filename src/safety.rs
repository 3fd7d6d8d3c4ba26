use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::Config;

/// Risk verdict for one proposed command. `Dangerous` requires confirmation
/// under interactive autonomy (and whenever safe mode is on); `Blocked` has
/// no confirmation path at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SafetyVerdict {
    Safe,
    Dangerous(String),
    Blocked(String),
}

impl SafetyVerdict {
    pub fn is_blocked(&self) -> bool {
        matches!(self, SafetyVerdict::Blocked(_))
    }

    pub fn is_dangerous(&self) -> bool {
        matches!(self, SafetyVerdict::Dangerous(_))
    }

    fn rank(&self) -> u8 {
        match self {
            SafetyVerdict::Safe => 0,
            SafetyVerdict::Dangerous(_) => 1,
            SafetyVerdict::Blocked(_) => 2,
        }
    }

    /// Keep the worse of the two verdicts.
    fn escalate(self, other: SafetyVerdict) -> SafetyVerdict {
        if other.rank() > self.rank() { other } else { self }
    }
}

struct Rule {
    pattern: Regex,
    reason: &'static str,
}

struct UserRule {
    pattern: Regex,
    source: String,
}

/// Pattern catalogue split into two tiers. Built once at startup from the
/// built-in defaults plus config-supplied extras; adding a rule never
/// touches the loop.
pub struct SafetyPolicy {
    blocked: Vec<Rule>,
    dangerous: Vec<Rule>,
    user_blocked: Vec<UserRule>,
    user_dangerous: Vec<UserRule>,
    home: Option<PathBuf>,
}

const BLOCKED_RULES: &[(&str, &str)] = &[
    (
        r"rm\s+(-\S+\s+)*-[a-zA-Z]*r[a-zA-Z]*\s+/(\s|$)",
        "recursive delete of the filesystem root",
    ),
    (
        r"rm\s+(-\S+\s+)*/(bin|boot|dev|etc|lib|proc|root|sbin|sys|usr|var)\b",
        "delete of a system directory",
    ),
    (
        r"rm\s+(-\S+\s+)*(~|\$HOME)/?(\s|$)",
        "recursive delete of the home directory",
    ),
    (r"\bmkfs(\.[a-z0-9]+)?\b", "filesystem format"),
    (r"\bfdisk\b", "disk partition operation"),
    (r"\bparted\b", "disk partition operation"),
    (r"\bwipefs\b", "filesystem signature wipe"),
    (r"\bdd\s+[^;|&]*of=/dev/", "raw write to a block device"),
    (r">\s*/dev/sd[a-z]", "raw write to a block device"),
    (
        r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb",
    ),
    (
        r"\bsudo\s+(-\S+\s+)*(rm|dd|mkfs\S*|fdisk|parted|chmod|chown|shutdown|reboot)\b",
        "privilege escalation around a destructive command",
    ),
    (
        r"chmod\s+(-\S+\s+)*[0-7]{3,4}\s+/(\s|$)",
        "permission change on the filesystem root",
    ),
];

const DANGEROUS_RULES: &[(&str, &str)] = &[
    (
        r"git\s+push\s+[^;|&]*(--force\b|\s-f\b)",
        "force push rewrites remote history",
    ),
    (
        r"\bgit\s+(reset\s+--hard|clean\s+-[a-zA-Z]*f[a-zA-Z]*)\b",
        "discards local changes",
    ),
    (r"\brm\s+-[a-zA-Z]*r[a-zA-Z]*\b", "recursive delete"),
    (r"\bchmod\s+-R\b", "recursive permission change"),
    (r"\bchown\s+-R\b", "recursive ownership change"),
    (r"\bmv\s+[^;|&]*\*", "bulk move/rename with a glob"),
    (r"\b(killall|pkill)\b", "kills processes by name"),
    (
        r"\b(shutdown|reboot|halt|poweroff)\b",
        "stops or restarts the machine",
    ),
    (
        r"\bsystemctl\s+(stop|disable|mask)\b",
        "stops or disables a system service",
    ),
    (r"\bservice\s+\S+\s+stop\b", "stops a system service"),
    (r"\biptables\s+-[FX]\b", "flushes firewall rules"),
];

impl SafetyPolicy {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            blocked: compile_rules(BLOCKED_RULES)?,
            dangerous: compile_rules(DANGEROUS_RULES)?,
            user_blocked: compile_user_rules(&cfg.blocked_patterns)?,
            user_dangerous: compile_user_rules(&cfg.dangerous_patterns)?,
            home: dirs::home_dir().map(|h| h.canonicalize().unwrap_or(h)),
        })
    }

    /// Classify a command in a working directory. Pure function of the
    /// policy and its inputs; no side effects.
    pub fn classify(&self, command: &str, cwd: &Path) -> SafetyVerdict {
        // Patterns like a fork bomb span separators, so the whole command is
        // checked first, then each sub-command of a pipeline or chain.
        let mut verdict = self.classify_segment(command.trim(), cwd);
        if verdict.is_blocked() {
            return verdict;
        }
        for segment in split_segments(command) {
            verdict = verdict.escalate(self.classify_segment(&segment, cwd));
            if verdict.is_blocked() {
                return verdict;
            }
        }
        verdict
    }

    fn classify_segment(&self, segment: &str, cwd: &Path) -> SafetyVerdict {
        for rule in &self.blocked {
            if rule.pattern.is_match(segment) {
                return SafetyVerdict::Blocked(rule.reason.to_string());
            }
        }
        for rule in &self.user_blocked {
            if rule.pattern.is_match(segment) {
                return SafetyVerdict::Blocked(format!("matches denylist pattern `{}`", rule.source));
            }
        }
        if let Some(reason) = self.relative_wipe(segment, cwd) {
            return SafetyVerdict::Blocked(reason);
        }
        for rule in &self.dangerous {
            if rule.pattern.is_match(segment) {
                return SafetyVerdict::Dangerous(rule.reason.to_string());
            }
        }
        for rule in &self.user_dangerous {
            if rule.pattern.is_match(segment) {
                return SafetyVerdict::Dangerous(format!(
                    "matches configured pattern `{}`",
                    rule.source
                ));
            }
        }
        SafetyVerdict::Safe
    }

    /// `rm -rf .` (or `*`) is only catastrophic when the cursor sits on the
    /// filesystem root or the home directory. Paths are canonicalized so a
    /// symlinked or non-normalized cwd still matches.
    fn relative_wipe(&self, segment: &str, cwd: &Path) -> Option<String> {
        let mut tokens = segment.split_whitespace();
        if tokens.next()? != "rm" {
            return None;
        }
        let mut recursive = false;
        let mut targets = Vec::new();
        for tok in tokens {
            if let Some(flags) = tok.strip_prefix('-') {
                if flags.contains('r') || flags.contains('R') {
                    recursive = true;
                }
            } else {
                targets.push(tok);
            }
        }
        if !recursive {
            return None;
        }
        let wipes_here = targets
            .iter()
            .any(|t| matches!(*t, "." | "./" | "*" | "./*"));
        if !wipes_here {
            return None;
        }
        let cwd = cwd.canonicalize().unwrap_or_else(|_| cwd.to_path_buf());
        if cwd == Path::new("/") {
            return Some("recursive delete of the filesystem root".to_string());
        }
        if self.home.as_deref() == Some(cwd.as_path()) {
            return Some("recursive delete of the home directory".to_string());
        }
        None
    }
}

fn compile_rules(rules: &[(&str, &'static str)]) -> Result<Vec<Rule>> {
    rules
        .iter()
        .map(|(pattern, reason)| {
            Ok(Rule {
                pattern: Regex::new(pattern)
                    .with_context(|| format!("invalid built-in safety pattern: {pattern}"))?,
                reason,
            })
        })
        .collect()
}

fn compile_user_rules(patterns: &[String]) -> Result<Vec<UserRule>> {
    patterns
        .iter()
        .map(|pattern| {
            Ok(UserRule {
                pattern: Regex::new(pattern)
                    .with_context(|| format!("invalid safety pattern in config: {pattern}"))?,
                source: pattern.clone(),
            })
        })
        .collect()
}

/// Split a compound command at unquoted `;`, `&` and `|` so each
/// sub-command gets its own verdict.
pub fn split_segments(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;
    let mut in_double = false;
    for ch in command.chars() {
        match ch {
            '\'' if !in_double => {
                in_single = !in_single;
                cur.push(ch);
            }
            '"' if !in_single => {
                in_double = !in_double;
                cur.push(ch);
            }
            ';' | '|' | '&' if !in_single && !in_double => {
                if !cur.trim().is_empty() {
                    out.push(cur.trim().to_string());
                }
                cur.clear();
            }
            _ => cur.push(ch),
        }
    }
    if !cur.trim().is_empty() {
        out.push(cur.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::from_config(&Config::default()).unwrap()
    }

    fn classify(cmd: &str) -> SafetyVerdict {
        policy().classify(cmd, Path::new("/tmp"))
    }

    #[test]
    fn everyday_commands_are_safe() {
        assert_eq!(classify("ls -la"), SafetyVerdict::Safe);
        assert_eq!(classify("grep -rn main src/"), SafetyVerdict::Safe);
        assert_eq!(classify("cargo build 2>&1 | tail -n 20"), SafetyVerdict::Safe);
        assert_eq!(classify("rm notes.txt"), SafetyVerdict::Safe);
    }

    #[test]
    fn root_delete_is_blocked() {
        assert!(classify("rm -rf /").is_blocked());
        assert!(classify("rm -fr /").is_blocked());
        assert!(classify("rm -rf /usr").is_blocked());
        assert!(classify("rm -rf ~").is_blocked());
        assert!(classify("rm -rf $HOME").is_blocked());
    }

    #[test]
    fn disk_and_fork_bomb_are_blocked() {
        assert!(classify("mkfs.ext4 /dev/sda1").is_blocked());
        assert!(classify("dd if=/dev/zero of=/dev/sda bs=1M").is_blocked());
        assert!(classify(":(){ :|:& };:").is_blocked());
        assert!(classify("sudo rm -rf /var/log").is_blocked());
    }

    #[test]
    fn second_tier_is_dangerous() {
        assert!(classify("git push --force origin main").is_dangerous());
        assert!(classify("git push -f").is_dangerous());
        assert!(classify("rm -rf ./target").is_dangerous());
        assert!(classify("chmod -R 755 .").is_dangerous());
        assert!(classify("systemctl stop nginx").is_dangerous());
    }

    #[test]
    fn blocked_subcommand_blocks_the_whole_chain() {
        assert!(classify("echo ok && rm -rf /").is_blocked());
        assert!(classify("ls; rm -rf /etc; echo done").is_blocked());
    }

    #[test]
    fn dangerous_subcommand_escalates_a_benign_pipeline() {
        let v = classify("find . -name '*.bak' | xargs rm -rf");
        assert!(v.is_dangerous(), "got {v:?}");
    }

    #[test]
    fn relative_wipe_depends_on_cwd() {
        let p = policy();
        assert!(p.classify("rm -rf .", Path::new("/")).is_blocked());
        // Anywhere else it is merely a recursive delete.
        assert!(p.classify("rm -rf .", Path::new("/tmp/scratch")).is_dangerous());
    }

    #[test]
    fn relative_wipe_sees_through_symlinks_and_dot_paths() {
        let p = policy();
        assert!(p.classify("rm -rf .", Path::new("/.")).is_blocked());

        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("rootlink");
        std::os::unix::fs::symlink("/", &link).unwrap();
        assert!(p.classify("rm -rf .", &link).is_blocked());
    }

    #[test]
    fn classifier_is_deterministic() {
        let p = policy();
        let a = p.classify("git push --force", Path::new("/tmp"));
        let b = p.classify("git push --force", Path::new("/tmp"));
        assert_eq!(a, b);
    }

    #[test]
    fn config_patterns_extend_the_catalogue() {
        let mut cfg = Config::default();
        cfg.blocked_patterns = vec![r"\bdrop\s+database\b".to_string()];
        cfg.dangerous_patterns = vec![r"\bterraform\s+apply\b".to_string()];
        let p = SafetyPolicy::from_config(&cfg).unwrap();
        assert!(p.classify("mysql -e 'drop database prod'", Path::new("/tmp")).is_blocked());
        assert!(p.classify("terraform apply", Path::new("/tmp")).is_dangerous());
    }

    #[test]
    fn quoted_separators_do_not_split() {
        let segs = split_segments("echo 'a; b | c' && ls");
        assert_eq!(segs, vec!["echo 'a; b | c'".to_string(), "ls".to_string()]);
    }
}
