//! Helpers for running external commands.

use std::process::Command;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

/// Extension helpers for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log the full command line at debug level.
    fn log_debug(&mut self) -> &mut Self;

    /// Run the command, capturing stderr. A non-zero exit status
    /// becomes an error that carries the captured stderr.
    fn run_capture_stderr(&mut self) -> Result<()>;

    /// Run the command, returning its standard output. On failure the
    /// captured stderr is folded into the error.
    fn run_get_output(&mut self) -> Result<Vec<u8>>;

    /// Run the command and deserialize its standard output as JSON.
    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T>;
}

fn command_name(command: &Command) -> String {
    command.get_program().to_string_lossy().into_owned()
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("running {self:?}");
        self
    }

    fn run_capture_stderr(&mut self) -> Result<()> {
        let name = command_name(self);
        let output = self
            .output()
            .with_context(|| format!("failed to invoke {name}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{name} failed ({}): {}", output.status, stderr.trim());
        }
        Ok(())
    }

    fn run_get_output(&mut self) -> Result<Vec<u8>> {
        let name = command_name(self);
        let output = self
            .output()
            .with_context(|| format!("failed to invoke {name}"))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("{name} failed ({}): {}", output.status, stderr.trim());
        }
        Ok(output.stdout)
    }

    fn run_and_parse_json<T: DeserializeOwned>(&mut self) -> Result<T> {
        let name = command_name(self);
        let stdout = self.run_get_output()?;
        serde_json::from_slice(&stdout)
            .with_context(|| format!("failed to parse the output of {name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn run_get_output_captures_stdout() -> Result<()> {
        let out = Command::new("echo").arg("hello").run_get_output()?;
        assert_eq!(String::from_utf8(out)?, "hello\n");
        Ok(())
    }

    #[test]
    fn run_capture_stderr_reports_failure() {
        let err = Command::new("false").run_capture_stderr().unwrap_err();
        assert!(err.to_string().contains("false failed"));
    }

    #[test]
    fn run_missing_binary_is_invocation_error() {
        let err = Command::new("this-binary-does-not-exist-4bf1")
            .run_capture_stderr()
            .unwrap_err();
        assert!(err.to_string().contains("failed to invoke"));
    }

    #[test]
    fn run_and_parse_json_decodes() -> Result<()> {
        let value: serde_json::Value = Command::new("echo")
            .arg(r#"{"answer": 42}"#)
            .run_and_parse_json()?;
        assert_eq!(value["answer"], 42);
        Ok(())
    }

    #[test]
    fn run_and_parse_json_rejects_garbage() {
        let result: Result<serde_json::Value> =
            Command::new("echo").arg("not json").run_and_parse_json();
        let err = result.unwrap_err();
        assert!(err.to_string().contains("failed to parse the output"));
    }
}
