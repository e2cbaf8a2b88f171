use crate::command::{CommandError, Output, Runner};
use log::trace;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PowerShellError {
    #[error("`{command}` failed with exit code {status}: {diagnostic}")]
    Failed {
        command: String,
        status: i32,
        diagnostic: String,
    },
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T, E = PowerShellError> = core::result::Result<T, E>;

/// Non-interactive PowerShell host used for the structured BitLocker and TPM
/// cmdlets.
#[derive(Debug, Clone)]
pub struct PowerShell {
    binary: PathBuf,
    runner: Runner,
}

impl PowerShell {
    pub fn new(binary: impl Into<PathBuf>, runner: Runner) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    /// Runs `script` and returns its stdout. A non-zero exit is an error.
    pub fn run(&self, script: &str) -> Result<String> {
        let output = self.invoke(script)?;
        if !output.success() {
            return Err(PowerShellError::Failed {
                command: command_name(script).to_owned(),
                status: output.status,
                diagnostic: output.diagnostic().to_owned(),
            });
        }
        trace!("{}", output.stdout.trim());
        Ok(output.stdout)
    }

    fn invoke(&self, script: &str) -> Result<Output> {
        // $ErrorActionPreference makes cmdlet errors terminate with a non-zero exit
        let script = format!("$ErrorActionPreference = 'Stop'; {script}");
        Ok(self.runner.run(
            &self.binary,
            &[
                "-NoLogo",
                "-NoProfile",
                "-NonInteractive",
                "-ExecutionPolicy",
                "Bypass",
                "-Command",
                script.as_str(),
            ],
        )?)
    }
}

/// Single-quoted PowerShell string literal.
pub fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn command_name(script: &str) -> &str {
    script.split_whitespace().next().unwrap_or(script)
}
