//! Blocking subprocess runner.
//!
//! Provisioning steps (git, venv creation, pip) are plain child processes.
//! [`CommandRunner`] is the seam that lets the installer and provisioner be
//! exercised without touching the network or a real interpreter.

use std::ffi::OsString;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use tracing::{debug, info, warn};

use crate::logging::COMMAND_TARGET;

/// A command line to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    /// Executable to launch.
    pub program: OsString,
    /// Arguments, in order.
    pub args: Vec<OsString>,
    /// Working directory, if any.
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Returns the program name as lossy text.
    #[must_use]
    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Returns the arguments as lossy text.
    #[must_use]
    pub fn args_lossy(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code; `None` if terminated by a signal.
    pub code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes commands to completion. Every call blocks.
pub trait CommandRunner: Send + Sync {
    /// Runs `spec`, forwarding its output to the log, and returns its exit code.
    fn run(&self, spec: &CommandSpec) -> io::Result<Option<i32>>;

    /// Runs `spec` and captures its output.
    fn output(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    fn forward_lines<R: Read>(reader: R, program: String, stream: &'static str) {
        for line in BufReader::new(reader).lines() {
            let Ok(line) = line else { break };
            info!(target: COMMAND_TARGET, "[{}:{}] {}", program, stream, line);
        }
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<Option<i32>> {
        debug!("[COMMAND] Running: {}", spec);

        let mut child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let program = spec.program_name();
        let mut readers = Vec::new();

        if let Some(stdout) = child.stdout.take() {
            let program = program.clone();
            readers.push(
                thread::Builder::new()
                    .name("cmd-stdout".to_string())
                    .spawn(move || Self::forward_lines(stdout, program, "stdout"))?,
            );
        }
        if let Some(stderr) = child.stderr.take() {
            let program = program.clone();
            readers.push(
                thread::Builder::new()
                    .name("cmd-stderr".to_string())
                    .spawn(move || Self::forward_lines(stderr, program, "stderr"))?,
            );
        }

        let status = child.wait()?;
        for reader in readers {
            if reader.join().is_err() {
                warn!("[COMMAND] Output reader for '{}' panicked", program);
            }
        }

        debug!("[COMMAND] '{}' exited with {:?}", program, status.code());
        Ok(status.code())
    }

    fn output(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        debug!("[COMMAND] Capturing: {}", spec);

        let output = spec.to_command().stdin(Stdio::null()).output()?;
        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
