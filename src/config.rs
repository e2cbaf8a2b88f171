//! Optional YAML configuration. Every key has a default so an absent file is
//! the same as an empty one; command-line flags override file values.
//!
//! ```yaml
//! mount_point: "C:"
//! escrow: azure-ad
//! decrypt_timeout_secs: 14400
//! used_space_only: true
//! encryption_method: xts_aes256
//! ```

use crate::bde::{EncryptionMethod, TurnOnOptions, DEFAULT_RESTART_SIGNATURES};
use crate::escrow::EscrowTarget;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = r"C:\ProgramData\tpm-bitlocker\config.yaml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mount_point: String,
    pub manage_bde: PathBuf,
    pub powershell: PathBuf,
    pub command_timeout_secs: u64,
    pub decrypt_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub escrow: EscrowTarget,
    pub used_space_only: bool,
    pub encryption_method: Option<EncryptionMethod>,
    pub skip_hardware_test: bool,
    pub restart_signatures: Vec<String>,
    pub transcript_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mount_point: "C:".to_owned(),
            manage_bde: PathBuf::from("manage-bde"),
            powershell: PathBuf::from("powershell"),
            command_timeout_secs: 300,
            decrypt_timeout_secs: 6 * 60 * 60,
            poll_interval_secs: 30,
            escrow: EscrowTarget::default(),
            used_space_only: false,
            encryption_method: None,
            skip_hardware_test: false,
            restart_signatures: DEFAULT_RESTART_SIGNATURES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            transcript_dir: Some(PathBuf::from(r"C:\ProgramData\tpm-bitlocker")),
        }
    }
}

impl Config {
    /// Loads `path`, falling back to defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self> {
        // an empty document deserializes to unit, not an empty mapping
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })
    }

    /// Checks the merged configuration; run after command-line overrides.
    pub fn validate(&self) -> Result<()> {
        if self.mount_point.trim().is_empty() {
            return Err(ConfigError::Invalid("mount_point must not be empty".into()));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.decrypt_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "decrypt_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_secs must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn decrypt_timeout(&self) -> Duration {
        Duration::from_secs(self.decrypt_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn turn_on_options(&self) -> TurnOnOptions {
        TurnOnOptions {
            used_space_only: self.used_space_only,
            encryption_method: self.encryption_method,
            skip_hardware_test: self.skip_hardware_test,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;
    use std::io::Write;

    #[test]
    fn missing_file_is_default() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::load_or_default(&dir.path().join("absent.yaml"))?;
        assert_eq!(config, Config::default());
        Ok(())
    }

    #[test]
    fn empty_file_is_default() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        writeln!(file, "   ")?;
        assert_eq!(Config::load_or_default(file.path())?, Config::default());
        Ok(())
    }

    #[test]
    fn partial_file_overrides_some_keys() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(
            file,
            "escrow: azure-ad\nused_space_only: true\nencryption_method: xts_aes256\ndecrypt_timeout_secs: 60\n"
        )?;
        let config = Config::load_or_default(file.path())?;
        assert_eq!(config.escrow, EscrowTarget::AzureAd);
        assert_eq!(config.decrypt_timeout(), Duration::from_secs(60));
        assert_eq!(config.mount_point, "C:");
        assert_eq!(
            config.turn_on_options(),
            TurnOnOptions {
                used_space_only: true,
                encryption_method: Some(EncryptionMethod::XtsAes256),
                skip_hardware_test: false,
            }
        );
        Ok(())
    }

    #[test]
    fn unknown_key_is_rejected_with_path() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "mountpoint: \"D:\"\n")?;
        let err = Config::load_or_default(file.path()).unwrap_err();
        match err {
            ConfigError::Parse { path, source } => {
                assert_eq!(path, file.path());
                assert!(source.to_string().contains("unknown field `mountpoint`"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn zero_interval_is_invalid() -> Result<()> {
        let config = Config::from_yaml("poll_interval_secs: 0")?;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn blank_mount_point_is_invalid() -> Result<()> {
        let config = Config::from_yaml("mount_point: ' '")?;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn loading_does_not_validate() -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        write!(file, "decrypt_timeout_secs: 0\n")?;
        let config = Config::load_or_default(file.path())?;
        assert_eq!(config.decrypt_timeout_secs, 0);
        assert!(config.validate().is_err());
        Ok(())
    }

    #[test]
    fn transcript_can_be_disabled() -> Result<()> {
        let config = Config::from_yaml("transcript_dir: null")?;
        assert_eq!(config.transcript_dir, None);
        Ok(())
    }
}
