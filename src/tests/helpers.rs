//! Shared test utilities

use crate::{
    error::PagewrightError,
    shell::{ShellOutput, ShellRunner},
};
use parking_lot::Mutex;

/// One invocation seen by [`ScriptedShell`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCall {
    pub command: String,
    pub stdin: Option<Vec<u8>>,
}

/// [`ShellRunner`] that answers from a script instead of spawning processes.
///
/// The first rule whose prefix matches the command decides the output. Unmatched commands
/// succeed and echo their stdin, which makes stdin-only "minifiers" behave like `cat`.
#[derive(Debug, Default)]
pub struct ScriptedShell {
    rules: Vec<(String, ShellOutput)>,
    calls: Mutex<Vec<ShellCall>>,
}

impl ScriptedShell {
    pub fn respond(mut self, prefix: &str, stdout: &[u8]) -> Self {
        self.rules.push((
            prefix.to_string(),
            ShellOutput {
                stdout: stdout.to_vec(),
                stderr: Vec::new(),
                status: Some(0),
            },
        ));
        self
    }

    pub fn fail(mut self, prefix: &str, status: i32, stderr: &str) -> Self {
        self.rules.push((
            prefix.to_string(),
            ShellOutput {
                stdout: Vec::new(),
                stderr: stderr.as_bytes().to_vec(),
                status: Some(status),
            },
        ));
        self
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().clone()
    }
}

impl ShellRunner for ScriptedShell {
    fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<ShellOutput, PagewrightError> {
        self.calls.lock().push(ShellCall {
            command: command.to_string(),
            stdin: stdin.map(<[u8]>::to_vec),
        });
        let scripted = self
            .rules
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone());
        Ok(scripted.unwrap_or_else(|| ShellOutput {
            stdout: stdin.map(<[u8]>::to_vec).unwrap_or_default(),
            stderr: Vec::new(),
            status: Some(0),
        }))
    }
}
