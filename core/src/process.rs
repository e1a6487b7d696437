//! Subprocess execution
//!
//! Runs external programs (Python interpreters, pip, uv, conda, docker)
//! with captured stdout/stderr, optional stdin payload and an enforced
//! timeout.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default execution time limit (10 minutes; package installs are slow)
pub const DEFAULT_TIMEOUT_MS: u64 = 600_000;

/// Exit code reported when the process was killed on timeout
pub const TIMEOUT_EXIT_CODE: i32 = 124;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessArgs {
    /// Program to execute (looked up on PATH)
    pub program: String,
    /// Arguments passed verbatim
    pub args: Vec<String>,
    /// Working directory (optional, defaults to current dir)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
    /// Timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl ProcessArgs {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Shell-like rendering for logs and plans
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| {
            if a.contains(char::is_whitespace) {
                format!("'{}'", a)
            } else {
                a.clone()
            }
        }));
        parts.join(" ")
    }
}

/// Result of a finished process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// Exit code (0 = success, -1 when killed by a signal)
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration_ms: u64,
}

impl ProcessResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Execute a program, feeding `stdin` if given
///
/// Spawn failures (program not found, permission denied) are errors; a
/// non-zero exit code or a timeout is reported through [`ProcessResult`].
pub fn run_process(args: &ProcessArgs, stdin: Option<&[u8]>) -> Result<ProcessResult> {
    let start = Instant::now();
    debug!("Running: {}", args.display());

    let mut cmd = Command::new(&args.program);
    cmd.args(&args.args)
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(ref dir) = args.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to execute command: {}", args.program))?;

    let writer = match (stdin, child.stdin.take()) {
        (Some(payload), Some(mut pipe)) => {
            let payload = payload.to_vec();
            Some(thread::spawn(move || {
                // A child that exits without reading stdin closes the pipe; not an error here
                let _ = pipe.write_all(&payload);
            }))
        }
        _ => None,
    };
    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let timeout = Duration::from_millis(args.timeout_ms);
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait().context("Failed to poll child process")? {
            break status;
        }
        if start.elapsed() >= timeout {
            warn!("Command timed out after {}ms: {}", args.timeout_ms, args.program);
            timed_out = true;
            let _ = child.kill();
            break child.wait().context("Failed to reap timed out process")?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    if let Some(writer) = writer {
        let _ = writer.join();
    }
    let stdout = stdout_reader.map(join_reader).unwrap_or_default();
    let stderr = stderr_reader.map(join_reader).unwrap_or_default();

    Ok(ProcessResult {
        exit_code: if timed_out {
            TIMEOUT_EXIT_CODE
        } else {
            status.code().unwrap_or(-1)
        },
        stdout,
        stderr,
        timed_out,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: thread::JoinHandle<Vec<u8>>) -> String {
    handle
        .join()
        .map(|buf| String::from_utf8_lossy(&buf).into_owned())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_run_process_echo() {
        let args = ProcessArgs::new("sh").arg("-c").arg("echo 'hello world'");
        let result = run_process(&args, None).unwrap();
        assert_eq!(result.exit_code, 0);
        assert!(result.stdout.contains("hello world"));
        assert!(result.stderr.is_empty());
        assert!(result.success());
    }

    #[test]
    fn test_run_process_exit_code_and_stderr() {
        let args = ProcessArgs::new("sh").arg("-c").arg("echo 'error' >&2; exit 42");
        let result = run_process(&args, None).unwrap();
        assert_eq!(result.exit_code, 42);
        assert!(result.stderr.contains("error"));
        assert!(!result.success());
    }

    #[test]
    fn test_run_process_stdin() {
        let args = ProcessArgs::new("cat");
        let result = run_process(&args, Some(b"{\"a\": 1}")).unwrap();
        assert_eq!(result.stdout, "{\"a\": 1}");
    }

    #[test]
    fn test_run_process_timeout() {
        let args = ProcessArgs::new("sleep").arg("5").timeout_ms(100);
        let result = run_process(&args, None).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
    }

    #[test]
    fn test_missing_program_is_error() {
        let args = ProcessArgs::new("definitely-not-a-real-program-12345");
        assert!(run_process(&args, None).is_err());
    }

    #[test]
    fn test_display_quotes_whitespace() {
        let args = ProcessArgs::new("pip").args(["install", "a b"]);
        assert_eq!(args.display(), "pip install 'a b'");
    }
}
