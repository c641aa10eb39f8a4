use crate::error::{Result, ToolError};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Trimmed stdout, falling back to stderr when a failing command printed
    /// nothing.
    pub fn text(&self) -> String {
        let out = self.stdout.trim();
        if !self.success() && out.is_empty() {
            return self.stderr.trim().to_string();
        }
        if out.is_empty() {
            "(no output)".to_string()
        } else {
            out.to_string()
        }
    }

    /// Like [`CommandOutput::text`] but keeps stderr and the exit code of a
    /// failing command visible.
    pub fn report(&self) -> String {
        let out = self.stdout.trim();
        if self.success() {
            return if out.is_empty() {
                "(no output)".to_string()
            } else {
                out.to_string()
            };
        }
        let err = self.stderr.trim();
        if out.is_empty() {
            format!("Error: {err}")
        } else {
            format!("{out}\n\nError (exit {}):\n{err}", self.exit_code)
        }
    }
}

/// Runs argv-style commands on the host. Seam for tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[&str], timeout: Duration) -> Result<CommandOutput>;

    /// Whether `program` resolves on this host.
    async fn exists(&self, program: &str) -> bool;
}

/// Runs a command and flattens every outcome into display text.
pub async fn run_text(runner: &dyn CommandRunner, argv: &[&str], timeout: Duration) -> String {
    match runner.run(argv, timeout).await {
        Ok(output) => output.text(),
        Err(err) => describe_failure(&err),
    }
}

/// Same as [`run_text`] with the stderr-preserving rendering.
pub async fn run_report(runner: &dyn CommandRunner, argv: &[&str], timeout: Duration) -> String {
    match runner.run(argv, timeout).await {
        Ok(output) => output.report(),
        Err(err) => describe_failure(&err),
    }
}

pub fn describe_failure(err: &ToolError) -> String {
    match err {
        ToolError::NotFound(program) => format!("Command not found: {program}"),
        ToolError::Timeout(_) => "Command timed out.".to_string(),
        ToolError::Blocked(pattern) => format!("Blocked by command policy (`{pattern}`)."),
        other => format!("Error: {other}"),
    }
}

pub fn require_string(args: &serde_json::Value, key: &str) -> Result<String> {
    let Some(v) = args.get(key) else {
        return Err(ToolError::InvalidArguments(format!("missing key: {key}")));
    };
    match v {
        serde_json::Value::String(s) => Ok(s.clone()),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub fn optional_string(args: &serde_json::Value, key: &str) -> Result<Option<String>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s.clone())),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be string, got {other:?}"
        ))),
    }
}

pub fn optional_string_list(args: &serde_json::Value, key: &str) -> Result<Option<Vec<String>>> {
    let Some(v) = args.get(key) else {
        return Ok(None);
    };
    match v {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Array(items) => items
            .iter()
            .map(|item| match item {
                serde_json::Value::String(s) => Ok(s.clone()),
                other => Err(ToolError::InvalidArguments(format!(
                    "key {key} must contain strings, got {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        other => Err(ToolError::InvalidArguments(format!(
            "key {key} must be a list of strings, got {other:?}"
        ))),
    }
}
