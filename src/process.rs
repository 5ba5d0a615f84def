//! Centralized command execution with consistent error handling.
//!
//! External tools (mksquashfs, mtools, grub-mkimage, commands run inside a
//! working copy) all go through `Cmd` so stderr ends up in error messages.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::debug;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_string()));
        self
    }

    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set an environment variable for the child.
    pub fn env(mut self, key: impl AsRef<str>, value: impl AsRef<str>) -> Self {
        self.envs
            .push((key.as_ref().to_string(), value.as_ref().to_string()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().map(|(k, v)| (k, v)));
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        debug!("running {} {}", self.program, self.args.join(" "));

        let output = cmd
            .output()
            .with_context(|| format!("Failed to execute '{}'. Is it installed?", self.program))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            let prefix = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            // -1 when terminated by a signal.
            let code = result.status.code().unwrap_or(-1);
            let stderr = result.stderr.trim();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, code);
            } else {
                bail!("{} (exit code {}):\n{}", prefix, code, stderr);
            }
        }

        Ok(result)
    }
}

/// Fail fast with an actionable message when `program` is not in PATH.
pub fn require_tool(program: &str, hint: &str) -> Result<PathBuf> {
    which::which(program)
        .with_context(|| format!("'{}' not found in PATH. {}", program, hint))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_success() {
        let result = Cmd::new("echo").arg("hello").run().unwrap();
        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[test]
    fn test_run_failure_includes_stderr() {
        let err = Cmd::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit code 3"));
        assert!(msg.contains("broken"));
    }

    #[test]
    fn test_env_and_dir() {
        let dir = tempfile::tempdir().unwrap();
        let result = Cmd::new("sh")
            .args(["-c", "echo $ABFORGE_TEST_VALUE; pwd"])
            .env("ABFORGE_TEST_VALUE", "forty-two")
            .dir(dir.path())
            .run()
            .unwrap();
        let lines: Vec<&str> = result.stdout.lines().collect();
        assert_eq!(lines[0], "forty-two");
        assert!(Path::new(lines[1]).ends_with(dir.path().file_name().unwrap()));
    }

    #[test]
    fn test_custom_error_message() {
        let err = Cmd::new("false")
            .error_msg("Custom build step failed")
            .run()
            .unwrap_err();
        assert!(err.to_string().contains("Custom build step failed"));
    }

    #[test]
    fn test_failure_without_stderr_reports_exit_code() {
        let err = Cmd::new("false").run().unwrap_err();
        assert_eq!(err.to_string(), "'false' failed (exit code 1)");
    }

    #[test]
    fn test_require_tool() {
        assert!(require_tool("sh", "").is_ok());
        let err = require_tool("nonexistent_program_12345", "Install it.").unwrap_err();
        assert!(err.to_string().contains("Install it."));
    }
}
