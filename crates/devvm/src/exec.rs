//! External tool invocation.
//!
//! Every program the pipeline starts (git, make, curl, sqfstar, qemu) goes
//! through a [`ToolRunner`]. [`SystemRunner`] spawns real processes; tests
//! swap in a recording fake.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

/// Failure to run an external tool.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to start {program} (is it installed?)")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} {}", describe_exit(*.code))]
    Failed {
        program: String,
        code: Option<i32>,
    },
    #[error("failed to stream input into {program}")]
    Input {
        program: String,
        #[source]
        source: io::Error,
    },
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with status {code}"),
        None => "was terminated by a signal".to_string(),
    }
}

/// A fully described external command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invocation {
    program: OsString,
    args: Vec<OsString>,
    cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Program name as given (lossy for display and matching).
    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// Arguments as strings, lossily converted.
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    pub fn cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, source: io::Error) -> ToolError {
        ToolError::Spawn {
            program: self.program(),
            source,
        }
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Starts external programs on behalf of the pipeline.
pub trait ToolRunner {
    /// Run to completion with inherited stdio and return the exit code
    /// (`None` when the process was killed by a signal).
    fn status(&mut self, invocation: &Invocation) -> Result<Option<i32>, ToolError>;

    /// Run to completion with `input` streamed into the child's stdin.
    fn status_with_input(
        &mut self,
        invocation: &Invocation,
        input: &mut dyn Read,
    ) -> Result<Option<i32>, ToolError>;

    /// Run and require a zero exit status.
    fn run(&mut self, invocation: &Invocation) -> Result<(), ToolError> {
        let code = self.status(invocation)?;
        ensure_success(invocation, code)
    }

    /// Run with stdin input and require a zero exit status.
    fn run_with_input(
        &mut self,
        invocation: &Invocation,
        input: &mut dyn Read,
    ) -> Result<(), ToolError> {
        let code = self.status_with_input(invocation, input)?;
        ensure_success(invocation, code)
    }
}

fn ensure_success(invocation: &Invocation, code: Option<i32>) -> Result<(), ToolError> {
    if code == Some(0) {
        Ok(())
    } else {
        Err(ToolError::Failed {
            program: invocation.program(),
            code,
        })
    }
}

/// Runs tools as real child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl ToolRunner for SystemRunner {
    fn status(&mut self, invocation: &Invocation) -> Result<Option<i32>, ToolError> {
        debug!(command = %invocation, "running");
        let status = invocation
            .to_command()
            .status()
            .map_err(|e| invocation.spawn_error(e))?;
        Ok(status.code())
    }

    fn status_with_input(
        &mut self,
        invocation: &Invocation,
        input: &mut dyn Read,
    ) -> Result<Option<i32>, ToolError> {
        debug!(command = %invocation, "running with piped stdin");
        let mut child = invocation
            .to_command()
            .stdin(Stdio::piped())
            .spawn()
            .map_err(|e| invocation.spawn_error(e))?;

        let copied = match child.stdin.take() {
            Some(mut stdin) => io::copy(input, &mut stdin).map(|_| ()),
            None => Ok(()),
        };

        let status = child.wait().map_err(|e| invocation.spawn_error(e))?;

        // A child that dies early closes the pipe; report its exit status
        // rather than the resulting broken pipe.
        if let Err(source) = copied {
            if status.success() {
                return Err(ToolError::Input {
                    program: invocation.program(),
                    source,
                });
            }
        }
        Ok(status.code())
    }
}
