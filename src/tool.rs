//! External tool invocations.
//!
//! The generator shells out to exactly two programs: the seL4 info getter and
//! the compiler driver used for linking. Both are reached through the `Tool`
//! trait so the planner stages can be exercised hermetically with canned
//! outputs.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::ToolError;

/// Captured result of one tool run.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

pub trait Tool {
    /// The program this tool runs, for error messages.
    fn program(&self) -> &Path;

    /// Run the program to completion, capturing stdout and stderr. A
    /// non-zero exit is not an error at this layer.
    fn run(&self, args: &[OsString], cwd: Option<&Path>) -> Result<ToolOutput, ToolError>;

    /// Run the program and treat any unsuccessful exit as a `ToolError`
    /// carrying the tool's stderr verbatim.
    fn run_checked(&self, args: &[OsString], cwd: Option<&Path>) -> Result<ToolOutput, ToolError> {
        let output = self.run(args, cwd)?;
        if output.success() {
            Ok(output)
        } else {
            Err(ToolError::Failed {
                program: self.program().to_path_buf(),
                exit_code: output.exit_code,
                stderr: output.stderr_lossy(),
            })
        }
    }
}

/// A real program on the host, run synchronously.
#[derive(Debug, Clone)]
pub struct HostTool {
    program: PathBuf,
}

impl HostTool {
    pub fn new(program: PathBuf) -> HostTool {
        HostTool { program }
    }
}

impl Tool for HostTool {
    fn program(&self) -> &Path {
        &self.program
    }

    fn run(&self, args: &[OsString], cwd: Option<&Path>) -> Result<ToolOutput, ToolError> {
        let mut command = Command::new(&self.program);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let output = command.output().map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;
        Ok(ToolOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Convenience for building argument vectors.
pub fn os(arg: impl Into<OsString>) -> OsString {
    arg.into()
}
