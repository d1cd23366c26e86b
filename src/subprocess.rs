//! Uniform invocation, capture, timing, and error-mapping for the
//! external CLIs this plugin shells out to (`nix`, `rsync`, `mount`,
//! `umount`, `mountpoint`, `nix_init_db`, ...). Every caller goes
//! through [`run`] or [`try_run`] so timing, logging, and transcript
//! capture stay uniform; nothing else in this crate spawns a process
//! directly.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::Level;

const SLOW_COMMAND_THRESHOLD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct SubprocessOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
    pub combined: String,
    pub elapsed: Duration,
}

impl SubprocessOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Whether stdout/stderr lines are forwarded to the log stream as they
/// arrive, or only buffered for the caller to inspect.
#[derive(Clone, Copy)]
pub enum Capture {
    Console(Level),
    Captured,
}

/// Run `program` with `args`, draining stdout and stderr concurrently.
/// Never returns an error for a non-zero exit — that's for [`try_run`].
pub async fn run(program: &str, args: &[String], capture: Capture) -> Result<SubprocessOutput> {
    log_command(program, args, capture);

    let start = Instant::now();
    let mut child = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");

    let stdout_lines = Arc::new(Mutex::new(Vec::new()));
    let stderr_lines = Arc::new(Mutex::new(Vec::new()));
    let combined_lines = Arc::new(Mutex::new(Vec::new()));

    let stdout_drain = drain(BufReader::new(stdout), stdout_lines.clone(), combined_lines.clone(), capture);
    let stderr_drain = drain(BufReader::new(stderr), stderr_lines.clone(), combined_lines.clone(), capture);

    let (_, _, status) = tokio::join!(stdout_drain, stderr_drain, child.wait());
    let status = status.context("failed waiting for child process")?;

    let elapsed = start.elapsed();
    if elapsed > SLOW_COMMAND_THRESHOLD {
        tracing::info!(
            command = %command_prefix(program, args),
            elapsed_secs = elapsed.as_secs_f64(),
            "command exceeded 5s"
        );
    }

    Ok(SubprocessOutput {
        status: status.code().unwrap_or(-1),
        stdout: stdout_lines.lock().await.join("\n"),
        stderr: stderr_lines.lock().await.join("\n"),
        combined: combined_lines.lock().await.join("\n"),
        elapsed,
    })
}

/// Like [`run`], but converts a non-zero exit into an error carrying
/// only the command prefix and exit status — short enough to cross
/// the RPC boundary as a `Status` message (§7). The full transcript is
/// logged here, not folded into the error, since it never belongs on
/// the wire. Callers above this layer MUST NOT re-wrap the resulting
/// error with another command prefix (§7 propagation policy).
pub async fn try_run(program: &str, args: &[String], capture: Capture) -> Result<SubprocessOutput> {
    let output = run(program, args, capture).await?;
    if !output.success() {
        tracing::error!(
            command = %command_prefix(program, args),
            status = output.status,
            transcript = %output.combined,
            "command failed"
        );
        anyhow::bail!("{} failed (status={})", command_prefix(program, args), output.status);
    }
    Ok(output)
}

async fn drain(
    mut reader: BufReader<impl tokio::io::AsyncRead + Unpin>,
    lines: Arc<Mutex<Vec<String>>>,
    combined: Arc<Mutex<Vec<String>>>,
    capture: Capture,
) {
    let mut line = String::new();
    loop {
        line.clear();
        let read = match reader.read_line(&mut line).await {
            Ok(n) => n,
            Err(_) => break,
        };
        if read == 0 {
            break;
        }
        let trimmed = line.trim_end_matches(['\n', '\r']).to_string();
        if let Capture::Console(level) = capture {
            log_line(level, &trimmed);
        }
        lines.lock().await.push(trimmed.clone());
        combined.lock().await.push(trimmed);
    }
}

fn log_line(level: Level, line: &str) {
    match level {
        Level::TRACE => tracing::trace!("{line}"),
        Level::DEBUG => tracing::debug!("{line}"),
        Level::INFO => tracing::info!("{line}"),
        Level::WARN => tracing::warn!("{line}"),
        Level::ERROR => tracing::error!("{line}"),
    }
}

fn log_command(program: &str, args: &[String], capture: Capture) {
    let level = match capture {
        Capture::Console(level) => level,
        Capture::Captured => Level::DEBUG,
    };
    let line = command_line(program, args);
    log_line(level, &format!("running: {line}"));
}

fn command_line(program: &str, args: &[String]) -> String {
    let mut words = vec![program.to_string()];
    words.extend(args.iter().cloned());
    shlex::try_join(words.iter().map(String::as_str)).unwrap_or_else(|_| words.join(" "))
}

/// First few words of the command, used in error messages so a failed
/// `nix build ...` with a 200-element closure list doesn't fill the
/// status message.
fn command_prefix(program: &str, args: &[String]) -> String {
    let mut words = vec![program.to_string()];
    words.extend(args.iter().take(4).cloned());
    let mut line = shlex::try_join(words.iter().map(String::as_str)).unwrap_or_else(|_| words.join(" "));
    if args.len() > 4 {
        line.push_str(" ...");
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_status() {
        let out = run("echo", &["hello".to_string()], Capture::Captured)
            .await
            .unwrap();
        assert_eq!(out.status, 0);
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn try_run_fails_on_nonzero_exit() {
        let err = try_run("false", &[], Capture::Captured).await.unwrap_err();
        assert!(err.to_string().contains("failed"));
    }

    #[test]
    fn command_prefix_truncates_long_arg_lists() {
        let args: Vec<String> = (0..10).map(|i| i.to_string()).collect();
        let prefix = command_prefix("nix", &args);
        assert!(prefix.ends_with("..."));
    }
}
