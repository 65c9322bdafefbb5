//! Helpers intended for [`std::process::Command`].

use std::io::Write;
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, capturing stderr. If the process exits
    /// unsuccessfully, the captured stderr is included in the error.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Execute the child process and return its stdout as a string.
    fn run_get_string(&mut self) -> Result<String>;

    /// Execute the child process, feeding `input` on stdin, and return its stdout.
    /// The input is never placed on the command line.
    fn run_with_input(&mut self, input: &[u8]) -> Result<String>;

    /// Execute the child process and parse its stdout as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;

    /// Execute the child process and report whether it exited successfully.
    /// Only a failure to spawn is an error.
    fn run_succeeds(&mut self) -> Result<bool>;

    /// The command line quoted for a POSIX shell, suitable for showing to a human.
    fn to_string_pretty(&self) -> String;
}

fn check_output(cmd: &Command, output: &Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stderr = stderr.trim();
    let prog = cmd.get_program().to_string_lossy();
    if stderr.is_empty() {
        anyhow::bail!("Subprocess {prog} failed: {}", output.status)
    }
    anyhow::bail!("Subprocess {prog} failed: {}\n{stderr}", output.status)
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {}", self.to_string_pretty());
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let output = self
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        check_output(self, &output)
    }

    fn run_get_string(&mut self) -> Result<String> {
        let output = self
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        check_output(self, &output)?;
        String::from_utf8(output.stdout).context("Parsing subprocess output as UTF-8")
    }

    fn run_with_input(&mut self, input: &[u8]) -> Result<String> {
        let mut child = self
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        {
            // Dropping the handle closes stdin so the child sees EOF
            let mut stdin = child.stdin.take().context("Missing child stdin")?;
            stdin.write_all(input).context("Writing child stdin")?;
        }
        let output = child.wait_with_output()?;
        check_output(self, &output)?;
        String::from_utf8(output.stdout).context("Parsing subprocess output as UTF-8")
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let s = self.run_get_string()?;
        serde_json::from_str(&s).context("Parsing subprocess output as JSON")
    }

    fn run_succeeds(&mut self) -> Result<bool> {
        let output = self
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .with_context(|| format!("Spawning {}", self.to_string_pretty()))?;
        if !output.status.success() {
            tracing::debug!(
                "{} exited with {}: {}",
                self.get_program().to_string_lossy(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.status.success())
    }

    fn to_string_pretty(&self) -> String {
        std::iter::once(self.get_program())
            .chain(self.get_args())
            .map(|a| {
                let a = a.to_string_lossy();
                shlex::try_quote(&a)
                    .map(|q| q.into_owned())
                    .unwrap_or_else(|_| a.into_owned())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
