//! Extension traits for [`std::process::Command`].
//!
//! The conventions here: commands are quiet by default (stdout and stderr
//! are captured, not inherited), a non-zero exit status is an error, and
//! the error message carries the command name plus whatever the process
//! wrote to stderr.

use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Keep at most this many trailing lines of stderr in error messages.
const MAX_STDERR_LINES: usize = 10;

pub trait CommandRunExt {
    /// Log (at debug level) the command we're about to execute.
    fn log_debug(&mut self) -> &mut Self;

    /// Synchronously execute the command; an error includes the exit status
    /// and captured stderr. Stdout is discarded.
    fn run(&mut self) -> Result<()>;

    /// Synchronously execute the command, returning its stdout.
    fn run_get_output(&mut self) -> Result<Vec<u8>>;

    /// Synchronously execute the command, returning its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Synchronously execute the command, deserializing its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

/// Render the trailing lines of captured stderr for an error message.
fn stderr_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(MAX_STDERR_LINES);
    lines[start..].join("\n")
}

fn command_name(cmd: &Command) -> String {
    cmd.get_program().to_string_lossy().into_owned()
}

fn validate(name: &str, status: std::process::ExitStatus, stderr: &[u8]) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let tail = stderr_tail(stderr);
    if tail.is_empty() {
        anyhow::bail!("`{name}` failed: {status}");
    }
    anyhow::bail!("`{name}` failed: {status}: {tail}");
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        let name = command_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning `{name}`"))?;
        validate(&name, output.status, &output.stderr)
    }

    fn run_get_output(&mut self) -> Result<Vec<u8>> {
        let name = command_name(self);
        let output = self
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("spawning `{name}`"))?;
        validate(&name, output.status, &output.stderr)?;
        Ok(output.stdout)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let name = command_name(self);
        let output = self.run_get_output()?;
        String::from_utf8(output).with_context(|| format!("`{name}` emitted invalid utf-8"))
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = command_name(self);
        let output = self.run_get_output()?;
        serde_json::from_slice(&output).with_context(|| format!("parsing JSON from `{name}`"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        Command::new("true").run().unwrap();
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let e = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = format!("{e}");
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("sh"), "{msg}");
    }

    #[test]
    fn test_run_get_string() {
        let s = Command::new("echo").arg("hello").run_get_string().unwrap();
        assert_eq!(s.trim(), "hello");
    }

    #[test]
    fn test_run_and_parse_json() {
        #[derive(serde::Deserialize)]
        struct V {
            a: u32,
        }
        let v: V = Command::new("echo")
            .arg(r#"{"a": 42}"#)
            .run_and_parse_json()
            .unwrap();
        assert_eq!(v.a, 42);
    }

    #[test]
    fn test_stderr_tail_truncates() {
        let many: String = (0..40).map(|i| format!("line{i}\n")).collect();
        let tail = stderr_tail(many.as_bytes());
        assert!(tail.starts_with("line30"));
        assert!(tail.ends_with("line39"));
    }
}
