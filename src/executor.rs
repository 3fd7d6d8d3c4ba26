use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::safety::split_segments;

/// Synthetic exit code reported for a timed-out command, matching the
/// convention of coreutils `timeout`.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const KILL_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
    pub timed_out: bool,
    /// Working directory after the command ran. Differs from the input only
    /// for directory-changing commands; the loop carries it into the next step.
    pub workdir: PathBuf,
}

impl ExecutionResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// How a supervised execution ended: the command ran to completion (possibly
/// timing out), or the user interrupted it and the process group was torn
/// down before it finished.
#[derive(Debug)]
pub enum ExecOutcome {
    Finished(ExecutionResult),
    Interrupted,
}

/// Run a command under the host shell in `cwd`, capturing stdout and stderr
/// separately. On timeout the process group is terminated (TERM, short
/// grace, then KILL) and the result carries `timed_out = true`; that is a
/// recoverable condition, not an error. An interrupt signaled on `interrupt`
/// tears the process group down the same way and yields
/// `ExecOutcome::Interrupted`.
pub async fn execute(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    interrupt: Option<&mut watch::Receiver<bool>>,
) -> Result<ExecOutcome> {
    let changes_dir = changes_directory(command);
    // Directory changes only survive the child shell if we ask it where it
    // ended up; the trailing pwd line is stripped from the captured output.
    let wrapped = if changes_dir {
        format!("{command} && pwd")
    } else {
        command.to_string()
    };

    let start = Instant::now();
    let mut cmd = Command::new("sh");
    cmd.args(["-lc", &wrapped])
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(%command, cwd = %cwd.display(), "executing");
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to run command: {command}"))?;
    let mut stdout_pipe = child.stdout.take().context("child stdout missing")?;
    let mut stderr_pipe = child.stderr.take().context("child stderr missing")?;

    let mut out_buf = Vec::new();
    let mut err_buf = Vec::new();

    let io_and_wait = async {
        let (o, e) = tokio::join!(
            stdout_pipe.read_to_end(&mut out_buf),
            stderr_pipe.read_to_end(&mut err_buf)
        );
        o.context("failed to read stdout")?;
        e.context("failed to read stderr")?;
        child.wait().await.context("failed to wait on child")
    };
    let interrupted = async {
        match interrupt {
            Some(rx) => {
                if rx.wait_for(|v| *v).await.is_err() {
                    // Sender gone; nothing can interrupt anymore.
                    std::future::pending::<()>().await;
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    let finished = tokio::select! {
        res = tokio::time::timeout(timeout, io_and_wait) => Some(res),
        _ = interrupted => None,
    };

    let (exit_code, timed_out) = match finished {
        Some(Ok(status)) => {
            let status = status?;
            (status.code().unwrap_or(-1), false)
        }
        Some(Err(_)) => {
            warn!(%command, ?timeout, "command timed out, terminating process group");
            terminate(&mut child).await;
            (TIMEOUT_EXIT_CODE, true)
        }
        None => {
            warn!(%command, "interrupted, terminating process group");
            terminate(&mut child).await;
            return Ok(ExecOutcome::Interrupted);
        }
    };

    let mut stdout = String::from_utf8_lossy(&out_buf).to_string();
    let stderr = String::from_utf8_lossy(&err_buf).to_string();

    let mut workdir = cwd.to_path_buf();
    if changes_dir
        && exit_code == 0
        && !timed_out
        && let Some((rest, last)) = split_last_line(&stdout)
    {
        let candidate = PathBuf::from(last.trim());
        if candidate.is_dir() {
            workdir = candidate;
            stdout = rest;
        }
    }

    Ok(ExecOutcome::Finished(ExecutionResult {
        exit_code,
        stdout,
        stderr,
        elapsed: start.elapsed(),
        timed_out,
        workdir,
    }))
}

async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let group = format!("-{pid}");
        let _ = std::process::Command::new("kill")
            .args(["-TERM", "--", &group])
            .status();
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
        let _ = std::process::Command::new("kill")
            .args(["-KILL", "--", &group])
            .status();
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn changes_directory(command: &str) -> bool {
    split_segments(command).iter().any(|seg| {
        matches!(
            seg.split_whitespace().next(),
            Some("cd") | Some("pushd") | Some("popd")
        )
    })
}

fn split_last_line(text: &str) -> Option<(String, String)> {
    let trimmed = text.trim_end_matches(['\n', '\r']);
    if trimmed.is_empty() {
        return None;
    }
    match trimmed.rfind('\n') {
        Some(idx) => Some((
            format!("{}\n", &trimmed[..idx]),
            trimmed[idx + 1..].to_string(),
        )),
        None => Some((String::new(), trimmed.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_secs(10);

    async fn run(command: &str, cwd: &Path, timeout: Duration) -> ExecutionResult {
        match execute(command, cwd, timeout, None).await.unwrap() {
            ExecOutcome::Finished(r) => r,
            ExecOutcome::Interrupted => panic!("unexpected interrupt"),
        }
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let cwd = std::env::temp_dir();
        let r = run("echo hello", &cwd, T).await;
        assert_eq!(r.exit_code, 0);
        assert!(r.succeeded());
        assert_eq!(r.stdout.trim(), "hello");
        assert!(r.stderr.is_empty());
        assert!(!r.timed_out);
    }

    #[tokio::test]
    async fn separates_stderr_from_stdout() {
        let cwd = std::env::temp_dir();
        let r = run("echo out; echo err 1>&2", &cwd, T).await;
        assert_eq!(r.stdout.trim(), "out");
        assert_eq!(r.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn reports_nonzero_exit() {
        let cwd = std::env::temp_dir();
        let r = run("exit 3", &cwd, T).await;
        assert_eq!(r.exit_code, 3);
        assert!(!r.succeeded());
    }

    #[tokio::test]
    async fn timeout_is_recoverable() {
        let cwd = std::env::temp_dir();
        let r = run("sleep 30", &cwd, Duration::from_millis(200)).await;
        assert!(r.timed_out);
        assert_eq!(r.exit_code, TIMEOUT_EXIT_CODE);
        assert!(r.elapsed < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn interrupt_stops_a_running_command() {
        let cwd = std::env::temp_dir();
        let (tx, mut rx) = watch::channel(false);
        let (outcome, _) = tokio::join!(
            execute("sleep 30", &cwd, Duration::from_secs(30), Some(&mut rx)),
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(true);
            }
        );
        assert!(matches!(outcome.unwrap(), ExecOutcome::Interrupted));
    }

    #[tokio::test]
    async fn interrupt_signals_the_whole_group_gracefully() {
        // A trapped TERM proves the group got a chance to exit cleanly
        // instead of being killed outright.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("got-term");
        let cmd = format!("trap 'touch {}' TERM; sleep 30 & wait", marker.display());
        let (tx, mut rx) = watch::channel(false);
        let (outcome, _) = tokio::join!(
            execute(&cmd, dir.path(), Duration::from_secs(30), Some(&mut rx)),
            async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                let _ = tx.send(true);
            }
        );
        assert!(matches!(outcome.unwrap(), ExecOutcome::Interrupted));
        assert!(marker.exists());
    }

    #[tokio::test]
    async fn cd_reports_the_new_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("inner");
        std::fs::create_dir(&sub).unwrap();
        let r = run("cd inner", dir.path(), T).await;
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.workdir.canonicalize().unwrap(), sub.canonicalize().unwrap());
        // The injected pwd line never leaks into the observation.
        assert!(r.stdout.trim().is_empty());
    }

    #[tokio::test]
    async fn cd_chain_keeps_user_visible_output() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("inner");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("marker.txt"), "x").unwrap();
        let r = run("cd inner && ls", dir.path(), T).await;
        assert!(r.stdout.contains("marker.txt"));
        assert_eq!(r.workdir.canonicalize().unwrap(), sub.canonicalize().unwrap());
    }

    #[tokio::test]
    async fn plain_commands_keep_the_cwd_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let r = run("echo hi", dir.path(), T).await;
        assert_eq!(r.workdir, dir.path());
    }
}
