//! Collaborator contracts for the enforcement procedure.
//!
//! The procedure only ever talks to these traits, so it can run against the
//! real Windows tooling ([`SystemPlatform`]) or an in-memory fake in tests.

use crate::bde::{self, Completion, TurnOnOptions};
use crate::escrow::{self, EscrowTarget};
use crate::tpm::{self, TpmInitResult, TpmState};
use crate::volume::{self, KeyProtectorKind, ProtectorId, VolumeState};

mod system;

pub use system::SystemPlatform;

/// The hardware security module.
pub trait HardwareModule {
    fn tpm_state(&self) -> tpm::Result<TpmState>;

    fn initialize_tpm(&self) -> tpm::Result<TpmInitResult>;
}

/// Structured, read-only view of a volume.
pub trait VolumeQuery {
    fn volume(&self, mount_point: &str) -> volume::Result<VolumeState>;
}

/// Operations that change a volume's encryption.
pub trait EncryptionTool {
    fn turn_on(&self, mount_point: &str, options: &TurnOnOptions) -> bde::Result<Completion>;

    fn turn_off(&self, mount_point: &str) -> bde::Result<Completion>;

    fn add_protector(&self, mount_point: &str, kind: KeyProtectorKind) -> bde::Result<Completion>;

    fn delete_protector(&self, mount_point: &str, id: &ProtectorId) -> bde::Result<Completion>;

    fn resume_protection(&self, mount_point: &str) -> bde::Result<Completion>;
}

/// Directory service backup of a recovery password.
pub trait RecoveryEscrow {
    fn escrow(
        &self,
        mount_point: &str,
        id: &ProtectorId,
        target: EscrowTarget,
    ) -> escrow::Result<()>;
}

pub trait Platform: HardwareModule + VolumeQuery + EncryptionTool + RecoveryEscrow {}

impl<T> Platform for T where T: HardwareModule + VolumeQuery + EncryptionTool + RecoveryEscrow {}
