//! Invocation of external minifiers and source-to-source compilers.
//!
//! Commands are configured as templates such as `lessc {input}` or
//! `coffee --join {output} -c {input}`. A template without `{input}` receives its input on stdin.

use crate::error::PagewrightError;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    io::Write,
    path::Path,
    process::{Command, Stdio},
};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code, `None` when the process was terminated by a signal.
    pub status: Option<i32>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs a shell command line, optionally feeding `stdin`, and captures its output.
///
/// Implementations only return `Err` when the command could not be run at all; a command that
/// ran and exited non-zero is reported through [`ShellOutput::status`].
pub trait ShellRunner: Send + Sync {
    fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<ShellOutput, PagewrightError>;
}

/// [`ShellRunner`] backed by the platform shell.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemShell;

impl ShellRunner for SystemShell {
    fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<ShellOutput, PagewrightError> {
        tracing::debug!("Running `{}`", command);
        let mut cmd = if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(command);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(command);
            cmd
        };
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn().map_err(|e| PagewrightError::Shell {
            command: command.to_string(),
            status: None,
            stderr: format!("could not start command: {e}"),
        })?;

        // Feed stdin from a separate thread so a chatty child cannot deadlock on a full pipe.
        let writer = match (stdin, child.stdin.take()) {
            (Some(data), Some(mut pipe)) => {
                let data = data.to_vec();
                Some(std::thread::spawn(move || pipe.write_all(&data)))
            }
            _ => None,
        };

        let output = child.wait_with_output()?;
        if let Some(writer) = writer {
            match writer.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!("Writing stdin of `{}` failed: {}", command, e),
                Err(_) => tracing::warn!("stdin writer thread for `{}` panicked", command),
            }
        }

        Ok(ShellOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            status: output.status.code(),
        })
    }
}

/// Run `command` and return its stdout, turning a non-zero exit into [`PagewrightError::Shell`].
pub fn run_checked(
    runner: &dyn ShellRunner,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<Vec<u8>, PagewrightError> {
    let output = runner.run(command, stdin)?;
    if !output.success() {
        return Err(PagewrightError::Shell {
            command: command.to_string(),
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// A command line with `{input}` and `{output}` placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandTemplate(pub String);

impl CommandTemplate {
    pub const INPUT: &'static str = "{input}";
    pub const OUTPUT: &'static str = "{output}";

    pub fn new(template: impl Into<String>) -> Self {
        CommandTemplate(template.into())
    }

    pub fn takes_input_path(&self) -> bool {
        self.0.contains(Self::INPUT)
    }

    /// Whether the command writes its result to `{output}` instead of stdout.
    pub fn writes_output_path(&self) -> bool {
        self.0.contains(Self::OUTPUT)
    }

    /// Substitute the placeholders with shell-quoted paths.
    pub fn expand(&self, input: Option<&Path>, output: Option<&Path>) -> String {
        let mut command = self.0.clone();
        if let Some(input) = input {
            command = command.replace(Self::INPUT, &shell_quote(&input.to_string_lossy()));
        }
        if let Some(output) = output {
            command = command.replace(Self::OUTPUT, &shell_quote(&output.to_string_lossy()));
        }
        command
    }
}

impl fmt::Display for CommandTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Quote a single argument for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+=:,@%".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\"'\"'"))
    }
}
