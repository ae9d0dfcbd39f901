//! Child process runner with a hard timeout and bounded output capture.

use std::io::{Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Bytes discarded beyond the capture limit, stdout and stderr combined.
    pub truncated: usize,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Spawn `argv`, feed `stdin`, and wait at most `timeout`.
///
/// Readers for stdout/stderr start before stdin is written so a child that
/// fills its output pipe while input is still being fed cannot deadlock.
/// A child still running at the deadline is killed and reported with
/// `timed_out = true`.
#[instrument(
    skip_all,
    fields(program = argv.first().map(String::as_str), timeout_ms = timeout.as_millis() as u64)
)]
pub fn run_with_input(
    argv: &[String],
    stdin: &[u8],
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<ProcessOutput> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command"))?;
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().with_context(|| format!("spawn {program}"))?;
    debug!(pid = child.id(), "child spawned");

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    let stdout_handle = thread::spawn(move || read_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_limited(stderr, output_limit_bytes));

    {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(err) = child_stdin.write_all(stdin) {
            // The child may exit without reading its input; its status decides.
            warn!(err = %err, "child closed stdin early");
        }
    }

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for child")? {
        Some(status) => status,
        None => {
            warn!(timeout_ms = timeout.as_millis() as u64, "child timed out, killing");
            timed_out = true;
            child.kill().context("kill child")?;
            child.wait().context("wait for child after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_reader(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_reader(stderr_handle).context("join stderr")?;
    let truncated = stdout_truncated + stderr_truncated;
    if truncated > 0 {
        warn!(truncated, "child output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "child finished");
    Ok(ProcessOutput {
        status,
        stdout,
        stderr,
        truncated,
        timed_out,
    })
}

fn join_reader(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Drain `reader` fully, keeping at most `limit` bytes.
fn read_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let keep = n.min(limit.saturating_sub(buf.len()));
        buf.extend_from_slice(&chunk[..keep]);
        truncated += n - keep;
    }

    Ok((buf, truncated))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[test]
    fn echoes_stdin_back() {
        let output =
            run_with_input(&sh("cat"), b"hello", Duration::from_secs(5), 1024).expect("run");
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello");
        assert!(!output.timed_out);
    }

    #[test]
    fn kills_on_timeout() {
        let output = run_with_input(&sh("exec sleep 5"), b"", Duration::from_millis(100), 1024)
            .expect("run");
        assert!(output.timed_out);
    }

    #[test]
    fn bounds_captured_output() {
        let output =
            run_with_input(&sh("printf 'abcdefgh'"), b"", Duration::from_secs(5), 3).expect("run");
        assert_eq!(output.stdout, b"abc");
        assert_eq!(output.truncated, 5);
    }

    #[test]
    fn reports_exit_code_and_stderr() {
        let output = run_with_input(
            &sh("echo oops >&2; exit 75"),
            b"",
            Duration::from_secs(5),
            1024,
        )
        .expect("run");
        assert_eq!(output.status.code(), Some(75));
        assert_eq!(output.stderr_lossy(), "oops");
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(run_with_input(&[], b"", Duration::from_secs(1), 16).is_err());
    }
}
