use crate::bde::BdeError;
use crate::powershell::{quote, PowerShellError};
use crate::volume::ProtectorId;
use clap::ValueEnum;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EscrowError {
    #[error("backup to {target} deferred until restart: {notice}")]
    Deferred { target: EscrowTarget, notice: String },
    #[error(transparent)]
    Bde(#[from] BdeError),
    #[error(transparent)]
    PowerShell(#[from] PowerShellError),
}

pub type Result<T, E = EscrowError> = core::result::Result<T, E>;

/// Directory service that receives the recovery password.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EscrowTarget {
    /// On-premises Active Directory (`manage-bde -protectors -adbackup`)
    #[default]
    ActiveDirectory,
    /// Azure AD / Entra ID (`BackupToAAD-BitLockerKeyProtector`)
    AzureAd,
    /// Do not escrow
    None,
}

impl fmt::Display for EscrowTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ActiveDirectory => "Active Directory",
            Self::AzureAd => "Azure AD",
            Self::None => "nowhere",
        };
        f.write_str(s)
    }
}

pub(crate) fn azure_ad_script(mount_point: &str, id: &ProtectorId) -> String {
    format!(
        "BackupToAAD-BitLockerKeyProtector -MountPoint {} -KeyProtectorId {} | Out-Null",
        quote(mount_point),
        quote(&id.to_string())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn azure_ad_script_quotes_arguments() -> Result<()> {
        let id: ProtectorId = "{9F8E7D6C-5B4A-4392-8170-6F5E4D3C2B1A}".parse()?;
        assert_eq!(
            azure_ad_script("C:", &id),
            "BackupToAAD-BitLockerKeyProtector -MountPoint 'C:' -KeyProtectorId '{9F8E7D6C-5B4A-4392-8170-6F5E4D3C2B1A}' | Out-Null"
        );
        Ok(())
    }

    #[test]
    fn target_names() -> Result<()> {
        let target: EscrowTarget = serde_yaml::from_str("azure-ad")?;
        assert_eq!(target, EscrowTarget::AzureAd);
        assert_eq!(
            EscrowTarget::from_str("active-directory", false),
            Ok(EscrowTarget::ActiveDirectory)
        );
        assert_eq!(EscrowTarget::default(), EscrowTarget::ActiveDirectory);
        Ok(())
    }
}
