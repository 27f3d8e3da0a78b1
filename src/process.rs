//! Subprocess helpers.
//!
//! [`Cmd`] is a small builder over [`std::process::Command`] that turns a
//! missing executable or a non-zero exit into a [`BuildError`] with the
//! command line and stderr attached. [`Executor`] adds the dry-run switch:
//! in dry mode no process is spawned and every query answers with a fixed
//! stand-in value, so the whole release pipeline can be exercised on a
//! machine without the real tools.

use anyhow::{Context, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use tracing::info;

use crate::error::BuildError;

/// Captured result of a finished command.
#[derive(Debug)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stdout decoded as UTF-8 (lossy).
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Builder for a single external command.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
    envs: Vec<(OsString, OsString)>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Human readable command line, for logs and error messages.
    pub fn display(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().map(|a| a.to_string_lossy().into_owned()));
        parts.join(" ")
    }

    fn with_default_dir(mut self, dir: &Path) -> Self {
        if self.cwd.is_none() {
            self.cwd = Some(dir.to_path_buf());
        }
        self
    }

    fn command(&self) -> Result<Command> {
        // Bare names are looked up first so a missing tool is reported as
        // such rather than as a generic spawn error.
        if !self.program.contains('/') && which::which(&self.program).is_err() {
            return Err(BuildError::ToolNotFound(self.program.clone()).into());
        }
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        Ok(cmd)
    }

    /// Run to completion, capturing stdout and stderr.
    pub fn run(&self) -> Result<CmdOutput> {
        let output = self
            .command()?
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("running '{}'", self.display()))?;
        let result = CmdOutput {
            status: output.status,
            stdout: output.stdout,
            stderr: output.stderr,
        };
        if !result.success() {
            return Err(BuildError::CommandFailed {
                command: self.display(),
                status: result.status.to_string(),
                stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(result)
    }

    /// Spawn with piped stdin and stdout for a long-lived conversation.
    ///
    /// Stderr goes to ours; nobody drains a pipe for it.
    pub fn spawn_piped(&self) -> Result<Child> {
        self.command()?
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawning '{}'", self.display()))
    }
}

/// Runs commands relative to a project root, honouring dry-run mode.
#[derive(Debug, Clone)]
pub struct Executor {
    root: PathBuf,
    dry: bool,
}

impl Executor {
    pub fn new(root: impl Into<PathBuf>, dry: bool) -> Self {
        Self {
            root: root.into(),
            dry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_dry(&self) -> bool {
        self.dry
    }

    /// Run a command and return its stdout, or `dry_out` in dry mode.
    pub fn check_output(&self, cmd: Cmd, dry_out: &str) -> Result<String> {
        let cmd = cmd.with_default_dir(&self.root);
        info!(command = %cmd.display(), dry = self.dry, "executing");
        if self.dry {
            return Ok(dry_out.to_string());
        }
        Ok(cmd.run()?.text())
    }

    /// Like [`Executor::check_output`] but keeps stdout as raw bytes.
    pub fn check_output_bytes(&self, cmd: Cmd, dry_out: &[u8]) -> Result<Vec<u8>> {
        let cmd = cmd.with_default_dir(&self.root);
        info!(command = %cmd.display(), dry = self.dry, "executing");
        if self.dry {
            return Ok(dry_out.to_vec());
        }
        Ok(cmd.run()?.stdout)
    }
}
