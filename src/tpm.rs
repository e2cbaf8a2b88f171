use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("no TPM is present on this machine")]
    NotPresent,
    #[error("TPM is not ready for use: {0}")]
    NotReady(String),
    #[error("unparseable TPM status output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    PowerShell(#[from] crate::powershell::PowerShellError),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// Selected fields of `Get-Tpm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct TpmState {
    #[serde(rename = "TpmPresent")]
    pub present: bool,
    #[serde(rename = "TpmReady")]
    pub ready: bool,
    #[serde(rename = "TpmEnabled", default)]
    pub enabled: bool,
    #[serde(rename = "TpmActivated", default)]
    pub activated: bool,
    #[serde(rename = "TpmOwned", default)]
    pub owned: bool,
}

impl TpmState {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json.trim())?)
    }

    /// Human readable list of what is keeping the TPM from being ready.
    pub fn blockers(&self) -> String {
        let mut blockers = Vec::new();
        if !self.enabled {
            blockers.push("disabled");
        }
        if !self.activated {
            blockers.push("not activated");
        }
        if !self.owned {
            blockers.push("not owned");
        }
        if blockers.is_empty() {
            "not ready".to_owned()
        } else {
            blockers.join(", ")
        }
    }
}

/// Selected fields of `Initialize-Tpm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TpmInitResult {
    #[serde(rename = "TpmReady")]
    pub ready: bool,
    #[serde(default)]
    pub restart_required: bool,
    #[serde(default)]
    pub shutdown_required: bool,
    #[serde(default)]
    pub clear_required: bool,
    #[serde(default)]
    pub physical_presence_required: bool,
}

impl TpmInitResult {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json.trim())?)
    }

    /// Initialization finishes after a reboot or power cycle.
    pub fn pending_reason(&self) -> Option<&'static str> {
        if self.ready {
            None
        } else if self.shutdown_required {
            Some("TPM initialization requires the computer to be shut down and powered on again")
        } else if self.restart_required || self.physical_presence_required {
            Some("TPM initialization requires a restart (confirm the TPM prompt during boot if asked)")
        } else {
            None
        }
    }

    pub fn failure_reason(&self) -> String {
        if self.clear_required {
            "TPM must be cleared before it can be initialized".to_owned()
        } else {
            "Initialize-Tpm did not leave the TPM ready".to_owned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn parse_ready_tpm() -> Result<()> {
        let state = TpmState::from_json(
            r#"{"TpmPresent":true,"TpmReady":true,"TpmEnabled":true,"TpmActivated":true,"TpmOwned":true}"#,
        )?;
        assert!(state.present);
        assert!(state.ready);
        Ok(())
    }

    #[test]
    fn blockers_describe_unready_tpm() -> Result<()> {
        let state = TpmState::from_json(
            r#"{"TpmPresent":true,"TpmReady":false,"TpmEnabled":true,"TpmActivated":false,"TpmOwned":false}"#,
        )?;
        assert_eq!(state.blockers(), "not activated, not owned");
        Ok(())
    }

    #[test]
    fn parse_garbage() {
        let parsed = TpmState::from_json("Get-Tpm : Access denied.");
        assert!(matches!(parsed, Err(TpmError::Parse(_))));
    }

    #[test]
    fn init_needing_restart_is_pending() -> Result<()> {
        let result = TpmInitResult::from_json(
            r#"{"TpmReady":false,"RestartRequired":true,"ShutdownRequired":false,"ClearRequired":false,"PhysicalPresenceRequired":false}"#,
        )?;
        assert!(result.pending_reason().is_some());
        Ok(())
    }

    #[test]
    fn init_needing_clear_is_failure() -> Result<()> {
        let result = TpmInitResult::from_json(
            r#"{"TpmReady":false,"RestartRequired":false,"ShutdownRequired":false,"ClearRequired":true,"PhysicalPresenceRequired":false}"#,
        )?;
        assert_eq!(result.pending_reason(), None);
        assert!(result.failure_reason().contains("cleared"));
        Ok(())
    }

    #[test]
    fn init_ready() -> Result<()> {
        let result = TpmInitResult::from_json(r#"{"TpmReady":true}"#)?;
        assert!(result.ready);
        assert_eq!(result.pending_reason(), None);
        Ok(())
    }
}
