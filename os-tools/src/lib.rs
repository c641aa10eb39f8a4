//! Host command execution for OpenClaw skills.
//!
//! Skills never build shell strings: they hand fixed argv lists to a
//! [`CommandRunner`], which enforces the governance deny-list before spawning.

mod error;
pub mod hardening;
mod shell;
mod traits;

pub use error::{Result, ToolError};
pub use shell::{CommandPolicy, DEFAULT_BLOCKED_COMMANDS, HostCommandRunner, SharedCommandPolicy};
pub use traits::{
    CommandOutput, CommandRunner, describe_failure, optional_string, optional_string_list,
    require_string, run_report, run_text,
};
