//! Child-process execution for the external BitLocker tooling.
//!
//! Every invocation captures stdout/stderr and is killed once the configured
//! timeout elapses, so a wedged `manage-bde` or PowerShell host can never hang
//! the run.

use log::debug;
use std::ffi::OsStr;
use std::io::Read;
use std::path::Path;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program}` timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
    #[error("output reader for `{0}` panicked")]
    Reader(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = CommandError> = core::result::Result<T, E>;

/// Captured result of a finished child process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// The most useful text to show for a failure: stderr if the tool wrote
    /// any, otherwise stdout.
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// Case-insensitive search across both streams.
    pub fn contains_ignore_case(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        self.stdout.to_lowercase().contains(&needle)
            || self.stderr.to_lowercase().contains(&needle)
    }
}

#[derive(Debug, Clone)]
pub struct Runner {
    timeout: Duration,
}

impl Runner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn run<S: AsRef<OsStr>>(&self, program: &Path, args: &[S]) -> Result<Output> {
        let name = program.display().to_string();
        debug!(
            "running {} {}",
            name,
            args.iter()
                .map(|a| a.as_ref().to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| CommandError::Spawn {
            program: name.clone(),
            source,
        })?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let output = self.wait_with_timeout(&name, child, stdout, stderr)?;
        debug!("{} exited with status {}", name, output.status);
        Ok(output)
    }

    fn wait_with_timeout(
        &self,
        name: &str,
        mut child: Child,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
    ) -> Result<Output> {
        let start = Instant::now();
        let stdout = spawn_reader(stdout);
        let stderr = spawn_reader(stderr);

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if start.elapsed() > self.timeout {
                child.kill().ok();
                child.wait().ok();
                return Err(CommandError::Timeout {
                    program: name.to_owned(),
                    timeout: self.timeout,
                });
            }
            thread::sleep(Duration::from_millis(25));
        };

        let stdout = stdout
            .join()
            .map_err(|_| CommandError::Reader(name.to_owned()))??;
        let stderr = stderr
            .join()
            .map_err(|_| CommandError::Reader(name.to_owned()))??;

        Ok(Output {
            stdout,
            stderr,
            status: status.code().unwrap_or(-1),
        })
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> thread::JoinHandle<Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}
