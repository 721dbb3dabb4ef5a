//! Runs external binaries and "internal" scripts resolved against a search
//! path: an explicit script directory, the process working directory, then
//! the directory containing the running executable.
//!
//! On non-zero exit the captured stderr is surfaced to the caller and
//! stdout is discarded — that is the only signal a handler gets about a
//! backend failure.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("script {0:?} not found on search path")]
    ScriptNotFound(String),
    #[error("spawn error: {0}")]
    Spawn(String),
    #[error("command exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
}

/// A single command invocation: either an external binary run directly, or
/// an internal script name resolved against [`ShellRunner`]'s search path.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub args: Vec<String>,
    pub internal: bool,
}

impl ShellRequest {
    pub fn external(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            internal: false,
        }
    }

    pub fn internal(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            internal: true,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShellRunner {
    /// Explicit script directory, checked first. `None` skips this step.
    script_dir: Option<PathBuf>,
}

impl ShellRunner {
    pub fn new(script_dir: Option<PathBuf>) -> Self {
        Self { script_dir }
    }

    /// Run `req`, returning captured stdout on success.
    pub async fn run(&self, req: ShellRequest) -> Result<Vec<u8>, ShellError> {
        let mut cmd = if req.internal {
            let resolved = self.resolve_script(&req.command)?;
            debug!(script = %resolved.display(), args = ?req.args, "running internal script");
            let mut cmd = Command::new("/bin/bash");
            cmd.arg(&resolved).args(&req.args);
            cmd
        } else {
            debug!(command = %req.command, args = ?req.args, "running external command");
            let mut cmd = Command::new(&req.command);
            cmd.args(&req.args);
            cmd
        };

        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| ShellError::Spawn(e.to_string()))?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(ShellError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Resolve `script_name` against the search path: explicit script dir,
    /// process working directory, then the running executable's directory.
    pub fn resolve_script(&self, script_name: &str) -> Result<PathBuf, ShellError> {
        let candidates = [
            self.script_dir.clone(),
            std::env::current_dir().ok(),
            std::env::current_exe()
                .ok()
                .and_then(|p| p.parent().map(Path::to_path_buf)),
        ];

        for dir in candidates.into_iter().flatten() {
            let candidate = dir.join(script_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }

        Err(ShellError::ScriptNotFound(script_name.to_string()))
    }
}
