use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

pub fn ask(label: &str) -> Result<String> {
    print!("{label}");
    io::stdout().flush().context("Failed to flush stdout")?;
    let mut input = String::new();
    io::stdin()
        .read_line(&mut input)
        .context("Failed to read stdin")?;
    Ok(input.trim_end_matches(['\n', '\r']).to_string())
}

/// Like `ask`, but returns `None` on end of input (Ctrl-D).
pub fn ask_or_eof(label: &str) -> Result<Option<String>> {
    print!("{label}");
    io::stdout().flush().context("Failed to flush stdout")?;
    let mut input = String::new();
    let n = io::stdin()
        .read_line(&mut input)
        .context("Failed to read stdin")?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim_end_matches(['\n', '\r']).to_string()))
}

pub fn truncate_with_suffix(text: &str, max_chars: usize, suffix: &str) -> String {
    let mut count = 0usize;
    let mut cut_at = text.len();
    for (idx, _) in text.char_indices() {
        if count == max_chars {
            cut_at = idx;
            break;
        }
        count += 1;
    }
    if count < max_chars {
        text.to_string()
    } else {
        format!("{}{}", &text[..cut_at], suffix)
    }
}

pub fn clip_output(text: &str, max_chars: usize) -> String {
    truncate_with_suffix(text, max_chars, "...\n[truncated]")
}

/// Single-line spinner printed while waiting on the model or a command.
/// Plain text only; rendering stays out of the core loop.
pub struct WorkingStatus {
    label: String,
    start: Instant,
    done: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
    finished: bool,
}

impl WorkingStatus {
    pub fn start(label: impl Into<String>) -> Self {
        let label = label.into();
        let start = Instant::now();
        let done = Arc::new(AtomicBool::new(false));
        let done_flag = Arc::clone(&done);
        let thread_label = label.clone();

        let handle = thread::spawn(move || {
            while !done_flag.load(Ordering::Relaxed) {
                print!("\r({} {}s)", thread_label, start.elapsed().as_secs());
                let _ = io::stdout().flush();
                thread::sleep(Duration::from_secs(1));
            }
        });

        Self {
            label,
            start,
            done,
            handle: Some(handle),
            finished: false,
        }
    }

    pub fn finish(mut self) {
        self.stop_thread();
        println!("\r({} done, {}s)", self.label, self.start.elapsed().as_secs());
        let _ = io::stdout().flush();
        self.finished = true;
    }

    fn stop_thread(&mut self) {
        self.done.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkingStatus {
    fn drop(&mut self) {
        if !self.finished {
            self.stop_thread();
            print!("\r");
            let _ = io::stdout().flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_keeps_short_text() {
        assert_eq!(truncate_with_suffix("abc", 10, "..."), "abc");
    }

    #[test]
    fn truncate_cuts_on_char_boundary() {
        let s = "héllo wörld";
        let t = truncate_with_suffix(s, 4, "...");
        assert_eq!(t, "héll...");
    }
}
