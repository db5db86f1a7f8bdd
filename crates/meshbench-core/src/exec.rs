//! Command execution boundary.
//!
//! Every interaction with infrastructure CLIs (`kubectl`, `helm`, `gcloud`,
//! `git`, `make`, the manifest generator) goes through [`CommandExecutor`].
//! Output is captured in full, decoded as UTF-8 and trimmed.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

use crate::error::{Error, Result};

/// A single external command invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,

    /// Variables added on top of the inherited environment.
    pub env: BTreeMap<String, String>,

    pub current_dir: Option<PathBuf>,

    /// Bytes written to the child's stdin before it is awaited.
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn with_stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// The argv joined by spaces, for logs and fake matching.
    pub fn display(&self) -> String {
        self.argv.join(" ")
    }
}

/// `kubectl <args>`
pub fn kubectl<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(["kubectl"]).args(args)
}

/// `helm <args>`
pub fn helm<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(["helm"]).args(args)
}

/// `gcloud <args>`
pub fn gcloud<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(["gcloud"]).args(args)
}

/// `git <args>`
pub fn git<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(["git"]).args(args)
}

/// `make <args>`
pub fn make<I, S>(args: I) -> CommandSpec
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    CommandSpec::new(["make"]).args(args)
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,

    /// Exit code; `-1` when the process was terminated by a signal.
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: 0,
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }

    /// Convert a non-zero exit into [`Error::ExternalCommand`].
    pub fn check(self, cmd: &CommandSpec) -> Result<Self> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(Error::ExternalCommand {
                argv: cmd.argv.clone(),
                exit_code: self.exit_code,
                stderr: self.stderr,
            })
        }
    }
}

/// The sole boundary to infrastructure CLIs.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a command to completion. Non-zero exits are returned, not raised.
    async fn execute(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Run a command and fail with [`Error::ExternalCommand`] on non-zero exit.
    async fn execute_checked(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let output = self.execute(cmd).await?;
        if !output.succeeded() {
            error!(
                command = %cmd.display(),
                exit_code = output.exit_code,
                stderr = %output.stderr,
                "command failed"
            );
        }
        output.check(cmd)
    }
}

/// Executor that spawns real child processes.
///
/// Children are spawned with `kill_on_drop`, so dropping an in-flight
/// `execute` future (e.g. on cancellation) terminates the process instead of
/// leaking it.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessExecutor;

impl ProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    async fn execute(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let (program, args) = cmd
            .argv
            .split_first()
            .ok_or_else(|| Error::configuration("cannot execute an empty command"))?;

        debug!(command = %cmd.display(), "executing");
        let start = Instant::now();

        let mut command = Command::new(program);
        command
            .args(args)
            .envs(&cmd.env)
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| Error::Spawn {
            program: program.clone(),
            source,
        })?;

        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                // Closing stdin signals EOF to the child.
                drop(stdin);
            }
        }

        let output = child.wait_with_output().await?;
        let result = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        };

        debug!(
            command = %cmd.display(),
            exit_code = result.exit_code,
            duration_ms = start.elapsed().as_millis() as u64,
            "command finished"
        );
        Ok(result)
    }
}
