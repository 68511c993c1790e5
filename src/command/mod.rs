//! Privileged OS command execution.
//!
//! Every adapter, route, DNS and firewall mutation goes through a
//! [`CommandRunner`]. The system runner kills the child process when the
//! caller's future is dropped, so a phase timeout never leaks a `netsh` or
//! `powershell` invocation.

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Substrings (lower-case) that mark an elevation failure.
const PRIVILEGE_PATTERNS: &[&str] = &[
    "access is denied",
    "access denied",
    "requires elevation",
    "requested operation requires elevation",
    "run as administrator",
    "administrator privileges",
    "administrative privileges",
    "permissiondenied",
    "not have sufficient privilege",
    "unauthorizedaccess",
];

/// A single OS command with its own budget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: Duration::from_secs(15),
        }
    }

    /// Run a PowerShell snippet non-interactively.
    pub fn powershell(script: impl Into<String>) -> Self {
        Self::new(
            "powershell",
            [
                "-NoProfile".to_string(),
                "-NonInteractive".to_string(),
                "-ExecutionPolicy".to_string(),
                "Bypass".to_string(),
                "-Command".to_string(),
                script.into(),
            ],
        )
    }

    pub fn netsh<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("netsh", args)
    }

    pub fn route<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new("route", args)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Single-line rendering used in logs, errors and operation logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self.command_line();
        // Long PowerShell scripts make unreadable log lines.
        if line.len() > 160 {
            let cut = line
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|i| *i <= 157)
                .last()
                .unwrap_or(0);
            write!(f, "{}...", &line[..cut])
        } else {
            f.write_str(&line)
        }
    }
}

/// Captured result of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Whether stdout/stderr mention insufficient rights.
    pub fn indicates_privilege_error(&self) -> bool {
        is_privilege_message(&self.stderr) || is_privilege_message(&self.stdout)
    }

    /// Turn a failed run into a typed error.
    pub fn check(self, spec: &CommandSpec) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let message = self.error_message();
        if self.indicates_privilege_error() {
            return Err(Error::Privilege {
                command: spec.to_string(),
                message,
            });
        }
        Err(Error::Command {
            command: spec.to_string(),
            message,
        })
    }

    /// Most useful line of diagnostics.
    pub fn error_message(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        let first = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        match self.status {
            Some(code) if first.is_empty() => format!("exit code {code}"),
            Some(code) => format!("{} (exit code {code})", first.trim()),
            None if first.is_empty() => "terminated".to_string(),
            None => first.trim().to_string(),
        }
    }
}

/// Check a message against the known elevation-failure patterns.
pub fn is_privilege_message(text: &str) -> bool {
    let lower = text.to_lowercase();
    PRIVILEGE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Quote a value for a single-quoted PowerShell string literal.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Blocking call-with-timeout into the OS.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command, returning its output whatever the exit status.
    ///
    /// Fails with [`Error::Timeout`] when the command exceeds its budget;
    /// the process is killed in that case.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command and fail on a non-zero exit status.
    async fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        self.run(spec).await?.check(spec)
    }
}

/// Run a mutation up to `attempts` times with jittered linear backoff.
///
/// Privilege errors are returned immediately; retrying cannot fix them.
pub async fn run_with_retry(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    attempts: u32,
    backoff: Duration,
) -> Result<CommandOutput> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match runner.run_checked(spec).await {
            Ok(out) => return Ok(out),
            Err(e) if attempt < attempts && !e.is_privilege() => {
                let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis() as u64 / 4);
                let delay = backoff * attempt + Duration::from_millis(jitter_ms);
                debug!(command = %spec, attempt, error = %e, "retrying in {:?}", delay);
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "run");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        let child = cmd.spawn().map_err(|e| Error::Command {
            command: spec.to_string(),
            message: format!("failed to start: {e}"),
        })?;

        // Dropping the future on timeout drops the child, which kills it.
        let output = timeout(spec.timeout, child.wait_with_output())
            .await
            .map_err(|_| Error::timeout(spec.to_string(), spec.timeout))??;

        let result = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(command = %spec, status = ?result.status, stdout = %result.stdout.trim(), "done");
        Ok(result)
    }
}
