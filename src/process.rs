//! Thin wrapper around `std::process::Command` for running host tools.
//!
//! Every external call goes through [`Cmd`] so failures come back as
//! [`Error::ExternalTool`] with the tool name, exit status and captured
//! output attached.

use std::ffi::OsString;
use std::path::Path;
use std::process::Command;

use crate::error::{Error, Result};

/// Captured output of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    /// Whether the process exited with status 0.
    pub success: bool,
    /// Standard output, lossily decoded.
    pub stdout: String,
    /// Standard error, lossily decoded.
    pub stderr: String,
}

/// Builder for a single external command invocation.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    /// Start building an invocation of `program`.
    pub fn new(program: impl AsRef<std::ffi::OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            error_msg: None,
            allow_fail: false,
        }
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl AsRef<std::ffi::OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Append a path argument.
    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Message prefixed to the failure report when the command fails.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    /// Return the output instead of an error when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    fn tool_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Run to completion and capture its output.
    pub fn run(self) -> Result<CmdOutput> {
        let tool = self.tool_name();
        tracing::debug!(tool = %tool, args = ?self.args, "exec");

        let output = Command::new(&self.program)
            .args(&self.args)
            .output()
            .map_err(|e| Error::tool(&tool, format!("could not start: {e}")))?;

        let result = CmdOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if result.success || self.allow_fail {
            return Ok(result);
        }

        let mut message = match &self.error_msg {
            Some(msg) => format!("{msg} ({})", output.status),
            None => output.status.to_string(),
        };
        let stderr = result.stderr.trim();
        if !stderr.is_empty() {
            message.push_str(": ");
            message.push_str(stderr);
        }
        Err(Error::tool(tool, message))
    }
}

/// Whether `program` can be located, either as a path or on `PATH`.
pub fn exists(program: impl AsRef<std::ffi::OsStr>) -> bool {
    which::which(program).is_ok()
}
