use crate::error::{Result, ToolError};
use crate::traits::{CommandOutput, CommandRunner};
use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

pub const DEFAULT_BLOCKED_COMMANDS: &[&str] = &["rm -rf /", "sudo", "chmod", "shutdown"];

/// Deny-list of command fragments. A fragment matches when its
/// whitespace-separated tokens appear contiguously in the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    blocked: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCKED_COMMANDS.iter().map(|s| s.to_string()))
    }
}

impl CommandPolicy {
    pub fn new(blocked: impl IntoIterator<Item = String>) -> Self {
        let mut out: Vec<String> = Vec::new();
        for pattern in blocked {
            let pattern = pattern.split_whitespace().collect::<Vec<_>>().join(" ");
            if !pattern.is_empty() && !out.contains(&pattern) {
                out.push(pattern);
            }
        }
        Self { blocked: out }
    }

    pub fn blocked(&self) -> &[String] {
        &self.blocked
    }

    /// The first blocked fragment found in `command_line`.
    pub fn violation(&self, command_line: &str) -> Option<&str> {
        let tokens: Vec<&str> = command_line.split_whitespace().collect();
        self.blocked
            .iter()
            .find(|pattern| {
                let needle: Vec<&str> = pattern.split_whitespace().collect();
                !needle.is_empty()
                    && tokens
                        .windows(needle.len())
                        .any(|window| window == needle.as_slice())
            })
            .map(String::as_str)
    }
}

pub type SharedCommandPolicy = Arc<RwLock<CommandPolicy>>;

/// Per-stream output kept from a command; older bytes are dropped first.
pub const OUTPUT_BYTES_MAX: usize = 32_000;

/// Reads a pipe to the end, keeping only the last `max` bytes.
async fn read_capped<R>(reader: Option<R>, max: usize) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut kept: Vec<u8> = Vec::new();
    let mut dropped = 0usize;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        kept.extend_from_slice(&chunk[..n]);
        if kept.len() > max {
            let excess = kept.len() - max;
            kept.drain(..excess);
            dropped += excess;
        }
    }
    let text = String::from_utf8_lossy(&kept);
    if dropped == 0 {
        return Ok(text.into_owned());
    }
    Ok(format!("[... {dropped} earlier bytes truncated]\n{text}"))
}

/// Spawns argv directly (no shell) under the shared deny-list.
#[derive(Clone)]
pub struct HostCommandRunner {
    policy: SharedCommandPolicy,
}

impl HostCommandRunner {
    pub fn new(policy: SharedCommandPolicy) -> Self {
        Self { policy }
    }

    fn check_policy(&self, argv: &[&str]) -> Result<()> {
        let line = argv.join(" ");
        let policy = self
            .policy
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(pattern) = policy.violation(&line) {
            tracing::warn!(command = %line, %pattern, "command blocked by policy");
            return Err(ToolError::Blocked(pattern.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for HostCommandRunner {
    #[tracing::instrument(level = "debug", skip_all, fields(program = argv.first().copied().unwrap_or("")))]
    async fn run(&self, argv: &[&str], timeout: Duration) -> Result<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ToolError::InvalidArguments("empty command".to_string()));
        };
        self.check_policy(argv)?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ToolError::NotFound((*program).to_string()));
            }
            Err(e) => return Err(ToolError::ExecutionFailed(e.to_string())),
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Dropping this future on timeout drops the child, which kills it.
        let collect = async move {
            let (stdout, stderr, status) = tokio::join!(
                read_capped(stdout, OUTPUT_BYTES_MAX),
                read_capped(stderr, OUTPUT_BYTES_MAX),
                child.wait()
            );
            Ok::<_, ToolError>(CommandOutput {
                stdout: stdout?,
                stderr: stderr?,
                exit_code: status?.code().unwrap_or(-1),
            })
        };
        match tokio::time::timeout(timeout, collect).await {
            Err(_) => Err(ToolError::Timeout(timeout)),
            Ok(output) => output,
        }
    }

    async fn exists(&self, program: &str) -> bool {
        if program.contains('/') {
            return Path::new(program).is_file();
        }
        let Some(paths) = std::env::var_os("PATH") else {
            return false;
        };
        std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
    }
}
