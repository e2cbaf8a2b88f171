use super::{EncryptionTool, HardwareModule, RecoveryEscrow, VolumeQuery};
use crate::bde::{self, Completion, ManageBde, TurnOnOptions};
use crate::command::Runner;
use crate::config::Config;
use crate::escrow::{self, azure_ad_script, EscrowError, EscrowTarget};
use crate::powershell::{self, quote, PowerShell};
use crate::tpm::{self, TpmInitResult, TpmState};
use crate::volume::{self, KeyProtectorKind, ProtectorId, VolumeError, VolumeState};
use log::debug;

const GET_TPM: &str =
    "Get-Tpm | Select-Object TpmPresent, TpmReady, TpmEnabled, TpmActivated, TpmOwned | ConvertTo-Json -Compress";

const INITIALIZE_TPM: &str = "Initialize-Tpm -AllowClear -AllowPhysicalPresence \
    | Select-Object TpmReady, RestartRequired, ShutdownRequired, ClearRequired, PhysicalPresenceRequired \
    | ConvertTo-Json -Compress";

const IS_ELEVATED: &str = "([Security.Principal.WindowsPrincipal][Security.Principal.WindowsIdentity]::GetCurrent())\
    .IsInRole([Security.Principal.WindowsBuiltInRole]::Administrator)";

/// Real collaborators: PowerShell cmdlets for queries and Azure AD backup,
/// `manage-bde` for everything that changes the volume.
#[derive(Debug, Clone)]
pub struct SystemPlatform {
    powershell: PowerShell,
    manage_bde: ManageBde,
}

impl SystemPlatform {
    pub fn new(powershell: PowerShell, manage_bde: ManageBde) -> Self {
        Self {
            powershell,
            manage_bde,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let runner = Runner::new(config.command_timeout());
        let powershell = PowerShell::new(&config.powershell, runner.clone());
        let manage_bde = ManageBde::new(&config.manage_bde, runner)
            .with_restart_signatures(config.restart_signatures.clone());
        Self::new(powershell, manage_bde)
    }

    /// Whether the current process holds the Administrators role.
    pub fn is_elevated(&self) -> powershell::Result<bool> {
        Ok(self.powershell.run(IS_ELEVATED)?.trim().eq_ignore_ascii_case("true"))
    }
}

fn volume_script(mount_point: &str) -> String {
    format!(
        "Get-BitLockerVolume -MountPoint {} | Select-Object MountPoint, \
         @{{n='VolumeStatus';e={{\"$($_.VolumeStatus)\"}}}}, \
         @{{n='ProtectionStatus';e={{\"$($_.ProtectionStatus)\"}}}}, \
         EncryptionPercentage, \
         @{{n='KeyProtector';e={{@($_.KeyProtector | ForEach-Object {{ \
         [pscustomobject]@{{KeyProtectorId=$_.KeyProtectorId;KeyProtectorType=\"$($_.KeyProtectorType)\"}} }})}}}} \
         | ConvertTo-Json -Depth 4 -Compress",
        quote(mount_point)
    )
}

impl HardwareModule for SystemPlatform {
    fn tpm_state(&self) -> tpm::Result<TpmState> {
        TpmState::from_json(&self.powershell.run(GET_TPM)?)
    }

    fn initialize_tpm(&self) -> tpm::Result<TpmInitResult> {
        TpmInitResult::from_json(&self.powershell.run(INITIALIZE_TPM)?)
    }
}

impl VolumeQuery for SystemPlatform {
    fn volume(&self, mount_point: &str) -> volume::Result<VolumeState> {
        let json = self.powershell.run(&volume_script(mount_point))?;
        if json.trim().is_empty() {
            return Err(VolumeError::Empty(mount_point.to_owned()));
        }
        let state = VolumeState::from_json(&json)?;
        debug!(
            "{}: protection {}, conversion {:?} at {}%, {} protector(s)",
            state.mount_point,
            state.protection,
            state.conversion,
            state.encryption_percentage,
            state.protectors.len()
        );
        Ok(state)
    }
}

impl EncryptionTool for SystemPlatform {
    fn turn_on(&self, mount_point: &str, options: &TurnOnOptions) -> bde::Result<Completion> {
        self.manage_bde.turn_on(mount_point, options)
    }

    fn turn_off(&self, mount_point: &str) -> bde::Result<Completion> {
        self.manage_bde.turn_off(mount_point)
    }

    fn add_protector(&self, mount_point: &str, kind: KeyProtectorKind) -> bde::Result<Completion> {
        let completion = self.manage_bde.add_protector(mount_point, kind)?;
        if let Completion::Done(output) = &completion {
            if let Some(id) = bde::added_protector_id(output) {
                debug!("manage-bde reported new {kind} protector {id}");
            }
        }
        Ok(completion)
    }

    fn delete_protector(&self, mount_point: &str, id: &ProtectorId) -> bde::Result<Completion> {
        self.manage_bde.delete_protector(mount_point, id)
    }

    fn resume_protection(&self, mount_point: &str) -> bde::Result<Completion> {
        self.manage_bde.enable_protectors(mount_point)
    }
}

impl RecoveryEscrow for SystemPlatform {
    fn escrow(
        &self,
        mount_point: &str,
        id: &ProtectorId,
        target: EscrowTarget,
    ) -> escrow::Result<()> {
        match target {
            EscrowTarget::ActiveDirectory => match self.manage_bde.backup_to_ad(mount_point, id)? {
                Completion::Done(_) => Ok(()),
                Completion::RestartRequired(notice) => {
                    Err(EscrowError::Deferred { target, notice })
                }
            },
            EscrowTarget::AzureAd => {
                self.powershell.run(&azure_ad_script(mount_point, id))?;
                Ok(())
            }
            EscrowTarget::None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn volume_script_projects_enums_to_strings() {
        let script = volume_script("C:");
        assert!(script.starts_with("Get-BitLockerVolume -MountPoint 'C:' | Select-Object MountPoint,"));
        assert!(script.contains("@{n='VolumeStatus';e={\"$($_.VolumeStatus)\"}}"));
        assert!(script.contains("KeyProtectorType=\"$($_.KeyProtectorType)\""));
        assert!(script.ends_with("| ConvertTo-Json -Depth 4 -Compress"));
    }

    #[test]
    fn from_config_uses_configured_binaries() {
        let config = Config {
            manage_bde: "C:\\Windows\\System32\\manage-bde.exe".into(),
            ..Config::default()
        };
        let platform = SystemPlatform::from_config(&config);
        assert!(format!("{platform:?}").contains("manage-bde.exe"));
    }
}
