//! The enforcement procedure: bring a volume to "encrypted, TPM protector,
//! recovery password protector, protection on, recovery password escrowed".
//!
//! Every step decides on volume state queried after the most recent change
//! the procedure made, and that state is handed from step to step. Each step
//! is idempotent, so an interrupted run (including the reboot demanded by a
//! hardware test) is finished by simply running again.

use crate::bde::{BdeError, Completion, TurnOnOptions};
use crate::escrow::EscrowTarget;
use crate::platform::Platform;
use crate::tpm::TpmError;
use crate::volume::{
    ConversionStatus, KeyProtector, KeyProtectorKind, ProtectionStatus, ProtectorId, VolumeError,
    VolumeState,
};
use log::{debug, info, warn};
use std::ops::ControlFlow;
use std::time::Duration;
use thiserror::Error;

mod wait;

#[cfg(test)]
mod fake;

pub use wait::Cancellation;

#[derive(Error, Debug)]
pub enum EnforceError {
    #[error(transparent)]
    Tpm(#[from] TpmError),
    #[error(transparent)]
    Volume(#[from] VolumeError),
    #[error(transparent)]
    Bde(#[from] BdeError),
    #[error("{kind} protector is still missing on {mount_point} after adding it")]
    ProtectorMissing {
        kind: KeyProtectorKind,
        mount_point: String,
    },
    #[error("{mount_point} did not finish decrypting within {timeout:?} ({percentage}% still encrypted)")]
    DecryptTimeout {
        mount_point: String,
        timeout: Duration,
        percentage: f64,
    },
    #[error("cancelled while waiting for {0} to decrypt")]
    Cancelled(String),
}

pub type Result<T, E = EnforceError> = core::result::Result<T, E>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnforceOptions {
    /// Delete every protector and decrypt before enabling again.
    pub force: bool,
    pub mount_point: String,
    pub decrypt_timeout: Duration,
    pub poll_interval: Duration,
    pub turn_on: TurnOnOptions,
    pub escrow: EscrowTarget,
}

/// Something the procedure changed.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    TpmInitialized,
    ProtectorDeleted(KeyProtector),
    DecryptionStarted,
    Decrypted,
    TurnedOn,
    ProtectorAdded(KeyProtectorKind),
    ProtectionResumed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowSkip {
    ProtectionNotOn(ProtectionStatus),
    NoRecoveryPassword,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscrowStatus {
    Escrowed {
        id: ProtectorId,
        target: EscrowTarget,
    },
    /// Escrow is best effort; encryption is in place regardless.
    Failed {
        id: ProtectorId,
        target: EscrowTarget,
        reason: String,
    },
    Skipped(EscrowSkip),
    Disabled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub actions: Vec<Action>,
    pub escrow: EscrowStatus,
    pub volume: VolumeState,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Completed(Report),
    /// A reboot is needed before the run can finish; rerun afterwards.
    RestartRequired {
        notice: String,
        actions: Vec<Action>,
    },
}

type Step<T> = ControlFlow<String, T>;

/// Unwraps a [`Completion`], returning `Break` with the restart notice from
/// the enclosing step.
macro_rules! completed {
    ($completion:expr) => {
        match $completion {
            Completion::Done(output) => output,
            Completion::RestartRequired(notice) => return Ok(ControlFlow::Break(notice)),
        }
    };
}

/// Runs a step, ending the procedure with [`Outcome::RestartRequired`] when
/// it breaks.
macro_rules! proceed {
    ($enforcer:ident, $step:expr) => {
        match $step? {
            ControlFlow::Continue(value) => value,
            ControlFlow::Break(notice) => {
                return Ok(Outcome::RestartRequired {
                    notice,
                    actions: std::mem::take(&mut $enforcer.actions),
                })
            }
        }
    };
}

pub fn enforce<P: Platform>(
    platform: &P,
    options: &EnforceOptions,
    cancel: &Cancellation,
) -> Result<Outcome> {
    Enforcer {
        platform,
        options,
        cancel,
        actions: Vec::new(),
    }
    .run()
}

struct Enforcer<'a, P> {
    platform: &'a P,
    options: &'a EnforceOptions,
    cancel: &'a Cancellation,
    actions: Vec<Action>,
}

impl<'a, P: Platform> Enforcer<'a, P> {
    fn run(mut self) -> Result<Outcome> {
        proceed!(self, self.ensure_tpm());

        let volume = self.query()?;
        let volume = if self.options.force {
            proceed!(self, self.clean_slate(volume))
        } else {
            volume
        };
        let volume = proceed!(self, self.ensure_turned_on(volume));
        let volume = proceed!(self, self.ensure_protector(volume, KeyProtectorKind::Tpm));
        let volume = proceed!(
            self,
            self.ensure_protector(volume, KeyProtectorKind::RecoveryPassword)
        );
        let volume = proceed!(self, self.ensure_resumed(volume));
        let escrow = self.escrow(&volume);

        Ok(Outcome::Completed(Report {
            actions: self.actions,
            escrow,
            volume,
        }))
    }

    fn mount_point(&self) -> &'a str {
        &self.options.mount_point
    }

    fn query(&self) -> Result<VolumeState> {
        Ok(self.platform.volume(self.mount_point())?)
    }

    fn ensure_tpm(&mut self) -> Result<Step<()>> {
        let state = self.platform.tpm_state()?;
        if !state.present {
            return Err(TpmError::NotPresent.into());
        }
        if state.ready {
            debug!("TPM is ready");
            return Ok(ControlFlow::Continue(()));
        }

        info!("TPM is {}, initializing it", state.blockers());
        let result = self.platform.initialize_tpm()?;
        if let Some(reason) = result.pending_reason() {
            return Ok(ControlFlow::Break(reason.to_owned()));
        }
        if !result.ready {
            return Err(TpmError::NotReady(result.failure_reason()).into());
        }
        let state = self.platform.tpm_state()?;
        if !state.ready {
            return Err(TpmError::NotReady(state.blockers()).into());
        }

        info!("TPM initialized");
        self.actions.push(Action::TpmInitialized);
        Ok(ControlFlow::Continue(()))
    }

    /// Deletes every protector, then decrypts and waits for the decryption to
    /// finish. A failed deletion aborts before anything is decrypted.
    fn clean_slate(&mut self, volume: VolumeState) -> Result<Step<VolumeState>> {
        let mount_point = self.mount_point();
        info!(
            "force: removing {} protector(s) and decrypting {}",
            volume.protectors.len(),
            mount_point
        );

        for protector in &volume.protectors {
            info!("deleting {} protector {}", protector.kind, protector.id);
            completed!(self.platform.delete_protector(mount_point, &protector.id)?);
            self.actions.push(Action::ProtectorDeleted(protector.clone()));
        }

        let volume = self.query()?;
        if volume.fully_decrypted() {
            info!("{mount_point} is already fully decrypted");
            return Ok(ControlFlow::Continue(volume));
        }

        if volume.conversion == ConversionStatus::DecryptionInProgress {
            info!("{mount_point} is already decrypting");
        } else {
            info!("turning off BitLocker on {mount_point}");
            completed!(self.platform.turn_off(mount_point)?);
            self.actions.push(Action::DecryptionStarted);
        }

        let volume = wait::wait_for_decryption(
            self.platform,
            mount_point,
            self.options.decrypt_timeout,
            self.options.poll_interval,
            self.cancel,
        )?;
        info!("{mount_point} is fully decrypted");
        self.actions.push(Action::Decrypted);
        Ok(ControlFlow::Continue(volume))
    }

    fn ensure_turned_on(&mut self, volume: VolumeState) -> Result<Step<VolumeState>> {
        let mount_point = self.mount_point();
        match volume.protection {
            ProtectionStatus::On | ProtectionStatus::Encrypting => {
                info!(
                    "BitLocker on {mount_point} is already {}, not turning it on",
                    volume.protection
                );
                return Ok(ControlFlow::Continue(volume));
            }
            ProtectionStatus::Off | ProtectionStatus::Suspended
                if volume.fully_encrypted_by_percentage() =>
            {
                info!(
                    "{mount_point} is fully encrypted with protection {}, not turning it on",
                    volume.protection
                );
                return Ok(ControlFlow::Continue(volume));
            }
            _ => {}
        }

        info!("turning on BitLocker on {mount_point}");
        completed!(self.platform.turn_on(mount_point, &self.options.turn_on)?);
        self.actions.push(Action::TurnedOn);
        Ok(ControlFlow::Continue(self.query()?))
    }

    fn ensure_protector(
        &mut self,
        volume: VolumeState,
        kind: KeyProtectorKind,
    ) -> Result<Step<VolumeState>> {
        let mount_point = self.mount_point();
        match volume.protectors_of(kind).count() {
            0 => {}
            1 => {
                debug!("{mount_point} already has a {kind} protector");
                return Ok(ControlFlow::Continue(volume));
            }
            n => {
                warn!("{mount_point} has {n} {kind} protectors, leaving them in place");
                return Ok(ControlFlow::Continue(volume));
            }
        }

        info!("adding {kind} protector to {mount_point}");
        completed!(self.platform.add_protector(mount_point, kind)?);
        let volume = self.query()?;
        if !volume.has(kind) {
            return Err(EnforceError::ProtectorMissing {
                kind,
                mount_point: mount_point.to_owned(),
            });
        }
        self.actions.push(Action::ProtectorAdded(kind));
        Ok(ControlFlow::Continue(volume))
    }

    fn ensure_resumed(&mut self, volume: VolumeState) -> Result<Step<VolumeState>> {
        let mount_point = self.mount_point();
        if !matches!(
            volume.protection,
            ProtectionStatus::Off | ProtectionStatus::Suspended
        ) {
            return Ok(ControlFlow::Continue(volume));
        }

        info!(
            "protection on {mount_point} is {}, resuming it",
            volume.protection
        );
        completed!(self.platform.resume_protection(mount_point)?);
        self.actions.push(Action::ProtectionResumed);
        Ok(ControlFlow::Continue(self.query()?))
    }

    fn escrow(&self, volume: &VolumeState) -> EscrowStatus {
        let mount_point = self.mount_point();
        let target = self.options.escrow;
        if target == EscrowTarget::None {
            info!("recovery password escrow is disabled");
            return EscrowStatus::Disabled;
        }
        if volume.protection != ProtectionStatus::On {
            warn!(
                "not escrowing recovery password: protection on {mount_point} is {}",
                volume.protection
            );
            return EscrowStatus::Skipped(EscrowSkip::ProtectionNotOn(volume.protection));
        }
        let protector = match volume.protectors_of(KeyProtectorKind::RecoveryPassword).next() {
            Some(protector) => protector,
            None => {
                warn!("not escrowing: {mount_point} has no recovery password protector");
                return EscrowStatus::Skipped(EscrowSkip::NoRecoveryPassword);
            }
        };

        let id = protector.id;
        match self.platform.escrow(mount_point, &id, target) {
            Ok(()) => {
                info!("recovery password {id} escrowed to {target}");
                EscrowStatus::Escrowed { id, target }
            }
            Err(err) => {
                warn!("failed to escrow recovery password {id} to {target}: {err}");
                EscrowStatus::Failed {
                    id,
                    target,
                    reason: err.to_string(),
                }
            }
        }
    }
}
