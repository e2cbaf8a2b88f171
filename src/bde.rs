//! Wrapper around the `manage-bde` command-line utility.
//!
//! Only mutating operations go through here; volume state is read through the
//! structured `Get-BitLockerVolume` query instead of scraping `-status` text.
//! The one thing we do read from the text output is the restart notice,
//! which has no structured equivalent.

use crate::command::{CommandError, Output, Runner};
use crate::volume::{KeyProtectorKind, ProtectorId};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

/// Printed by `manage-bde -on` when encryption waits for a hardware test.
pub const DEFAULT_RESTART_SIGNATURES: &[&str] = &["restart the computer to run a hardware test"];

static PROTECTOR_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"ID:\s*(\{[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}\})")
        .unwrap()
});

#[derive(Error, Debug)]
pub enum BdeError {
    #[error("manage-bde {op} failed with exit code {status}: {diagnostic}")]
    Failed {
        op: &'static str,
        status: i32,
        diagnostic: String,
    },
    #[error("adding a {0} protector is not supported")]
    UnsupportedProtector(KeyProtectorKind),
    #[error(transparent)]
    Command(#[from] CommandError),
}

pub type Result<T, E = BdeError> = core::result::Result<T, E>;

/// How an invocation ended when it did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Done(Output),
    /// The tool accepted the request but it only takes effect after a
    /// reboot. Carries the tool's notice.
    RestartRequired(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionMethod {
    Aes128,
    Aes256,
    XtsAes128,
    XtsAes256,
}

impl EncryptionMethod {
    fn as_arg(&self) -> &'static str {
        match self {
            Self::Aes128 => "aes128",
            Self::Aes256 => "aes256",
            Self::XtsAes128 => "xts_aes128",
            Self::XtsAes256 => "xts_aes256",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOnOptions {
    pub used_space_only: bool,
    pub encryption_method: Option<EncryptionMethod>,
    pub skip_hardware_test: bool,
}

#[derive(Debug, Clone)]
pub struct ManageBde {
    binary: PathBuf,
    runner: Runner,
    restart_signatures: Vec<String>,
}

impl ManageBde {
    pub fn new(binary: impl Into<PathBuf>, runner: Runner) -> Self {
        Self {
            binary: binary.into(),
            runner,
            restart_signatures: DEFAULT_RESTART_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn with_restart_signatures(mut self, signatures: Vec<String>) -> Self {
        self.restart_signatures = signatures;
        self
    }

    pub fn turn_on(&self, mount_point: &str, options: &TurnOnOptions) -> Result<Completion> {
        self.invoke("-on", turn_on_args(mount_point, options))
    }

    pub fn turn_off(&self, mount_point: &str) -> Result<Completion> {
        self.invoke("-off", vec!["-off".into(), mount_point.into()])
    }

    pub fn add_protector(&self, mount_point: &str, kind: KeyProtectorKind) -> Result<Completion> {
        self.invoke("-protectors -add", add_protector_args(mount_point, kind)?)
    }

    pub fn delete_protector(&self, mount_point: &str, id: &ProtectorId) -> Result<Completion> {
        self.invoke(
            "-protectors -delete",
            vec![
                "-protectors".into(),
                "-delete".into(),
                mount_point.into(),
                "-id".into(),
                id.to_string(),
            ],
        )
    }

    pub fn enable_protectors(&self, mount_point: &str) -> Result<Completion> {
        self.invoke(
            "-protectors -enable",
            vec!["-protectors".into(), "-enable".into(), mount_point.into()],
        )
    }

    pub fn backup_to_ad(&self, mount_point: &str, id: &ProtectorId) -> Result<Completion> {
        self.invoke(
            "-protectors -adbackup",
            vec![
                "-protectors".into(),
                "-adbackup".into(),
                mount_point.into(),
                "-id".into(),
                id.to_string(),
            ],
        )
    }

    fn invoke(&self, op: &'static str, args: Vec<String>) -> Result<Completion> {
        // stdout is never logged: protector additions echo the recovery password
        let output = self.runner.run(&self.binary, &args)?;
        classify(op, output, &self.restart_signatures)
    }
}

/// Applies the error policy: a restart notice wins over the exit code, any
/// other non-zero exit is a failure.
pub fn classify(op: &'static str, output: Output, restart_signatures: &[String]) -> Result<Completion> {
    if let Some(notice) = restart_notice(&output, restart_signatures) {
        return Ok(Completion::RestartRequired(notice));
    }
    if !output.success() {
        let diagnostic = match output.diagnostic() {
            "" => "no additional output".to_owned(),
            d => d.to_owned(),
        };
        return Err(BdeError::Failed {
            op,
            status: output.status,
            diagnostic,
        });
    }
    Ok(Completion::Done(output))
}

fn restart_notice(output: &Output, signatures: &[String]) -> Option<String> {
    let signature = signatures
        .iter()
        .find(|s| !s.is_empty() && output.contains_ignore_case(s))?
        .to_lowercase();
    output
        .stdout
        .lines()
        .chain(output.stderr.lines())
        .find(|line| line.to_lowercase().contains(&signature))
        .map(|line| line.trim().to_owned())
}

/// Id of the protector reported in `-protectors -add` output.
pub fn added_protector_id(output: &Output) -> Option<ProtectorId> {
    PROTECTOR_ID
        .captures(&output.stdout)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn turn_on_args(mount_point: &str, options: &TurnOnOptions) -> Vec<String> {
    let mut args = vec!["-on".to_owned(), mount_point.to_owned()];
    if options.used_space_only {
        args.push("-UsedSpaceOnly".into());
    }
    if let Some(method) = options.encryption_method {
        args.push("-EncryptionMethod".into());
        args.push(method.as_arg().into());
    }
    if options.skip_hardware_test {
        args.push("-SkipHardwareTest".into());
    }
    args
}

fn add_protector_args(mount_point: &str, kind: KeyProtectorKind) -> Result<Vec<String>> {
    let flag = match kind {
        KeyProtectorKind::Tpm => "-TPM",
        KeyProtectorKind::RecoveryPassword => "-RecoveryPassword",
        other => return Err(BdeError::UnsupportedProtector(other)),
    };
    Ok(vec![
        "-protectors".into(),
        "-add".into(),
        mount_point.into(),
        flag.into(),
    ])
}
