//! External command execution.
//!
//! Adapters build argument vectors and hand them to a [`CommandRunner`];
//! stdout comes back as a string for `serde_json` to parse. A non-zero exit
//! becomes [`PlatformError::Command`] with the captured stderr.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use shipgate_rollout::{PlatformError, PlatformResult};

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...`, returning stdout on success.
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> PlatformResult<String>;
}

/// Spawns real processes. Children are killed if the caller's future is
/// dropped, so executor timeouts do not leak `kubectl` processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    cwd: Option<PathBuf>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Default working directory when the caller passes none.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
        }
    }
}

pub(crate) fn display_command(program: &str, args: &[String]) -> String {
    let mut command = program.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> PlatformResult<String> {
        let command = display_command(program, args);
        debug!(%command, "running");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = cwd.or(self.cwd.as_deref()) {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await.map_err(|source| PlatformError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(PlatformError::Command {
                command,
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Parse JSON command output into `T`.
pub(crate) fn parse_json<T: serde::de::DeserializeOwned>(
    command: &str,
    stdout: &str,
) -> PlatformResult<T> {
    serde_json::from_str(stdout).map_err(|e| PlatformError::Parse {
        command: command.to_string(),
        reason: e.to_string(),
    })
}
