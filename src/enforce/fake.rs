//! In-memory platform that simulates a volume and records every call.

use super::Cancellation;
use crate::bde::{self, BdeError, Completion, TurnOnOptions};
use crate::command::Output;
use crate::escrow::{self, EscrowError, EscrowTarget};
use crate::platform::{EncryptionTool, HardwareModule, RecoveryEscrow, VolumeQuery};
use crate::tpm::{self, TpmInitResult, TpmState};
use crate::volume::{self, ConversionStatus, KeyProtector, KeyProtectorKind, ProtectorId, VolumeState};
use serde_json::json;
use std::cell::RefCell;
use uuid::Uuid;

pub(super) const HARDWARE_TEST_NOTICE: &str = "1. Restart the computer to run a hardware test.";

#[derive(Debug, Clone, PartialEq)]
pub(super) enum Call {
    TpmState,
    InitializeTpm,
    Volume,
    TurnOn,
    TurnOff,
    AddProtector(KeyProtectorKind),
    DeleteProtector(ProtectorId),
    Resume,
    Escrow(ProtectorId, EscrowTarget),
}

impl Call {
    fn is_mutation(&self) -> bool {
        !matches!(self, Self::TpmState | Self::Volume)
    }
}

#[derive(Debug, Clone)]
pub(super) struct FakeState {
    pub tpm: TpmState,
    pub init_result: TpmInitResult,
    pub protection_on: bool,
    pub conversion: ConversionStatus,
    pub percentage: f64,
    pub protectors: Vec<KeyProtector>,
    /// `turn_on` answers with the hardware test notice.
    pub turn_on_needs_restart: bool,
    /// `turn_on` fails outright.
    pub turn_on_fails: bool,
    /// `turn_on` leaves the volume encrypting instead of finishing at once.
    pub encrypt_in_background: bool,
    /// `add_protector` reports success without adding this kind.
    pub silently_skip_add: Option<KeyProtectorKind>,
    pub delete_fails: bool,
    pub escrow_fails: bool,
    /// Percentage decrypted per poll; zero never finishes.
    pub decrypt_step: f64,
    /// Cancel this token once this many volume queries have been answered.
    pub cancel_after_queries: Option<(usize, Cancellation)>,
    next_id: u128,
    queries: usize,
}

pub(super) struct FakePlatform {
    state: RefCell<FakeState>,
    calls: RefCell<Vec<Call>>,
}

fn ready_tpm() -> TpmState {
    TpmState {
        present: true,
        ready: true,
        enabled: true,
        activated: true,
        owned: true,
    }
}

impl FakeState {
    /// Unencrypted volume, ready TPM, no protectors.
    pub fn fresh() -> Self {
        Self {
            tpm: ready_tpm(),
            init_result: TpmInitResult {
                ready: true,
                ..TpmInitResult::default()
            },
            protection_on: false,
            conversion: ConversionStatus::FullyDecrypted,
            percentage: 0.0,
            protectors: Vec::new(),
            turn_on_needs_restart: false,
            turn_on_fails: false,
            encrypt_in_background: false,
            silently_skip_add: None,
            delete_fails: false,
            escrow_fails: false,
            decrypt_step: 50.0,
            cancel_after_queries: None,
            next_id: 1,
            queries: 0,
        }
    }

    /// Fully encrypted, protection on, TPM and recovery password protectors.
    pub fn protected() -> Self {
        let mut state = Self::fresh();
        state.protection_on = true;
        state.conversion = ConversionStatus::FullyEncrypted;
        state.percentage = 100.0;
        state.push_protector(KeyProtectorKind::Tpm);
        state.push_protector(KeyProtectorKind::RecoveryPassword);
        state
    }

    pub fn push_protector(&mut self, kind: KeyProtectorKind) -> ProtectorId {
        let id = ProtectorId::new(Uuid::from_u128(self.next_id));
        self.next_id += 1;
        self.protectors.push(KeyProtector { id, kind });
        id
    }

    fn to_json(&self) -> String {
        let protectors: Vec<_> = self
            .protectors
            .iter()
            .map(|p| {
                json!({
                    "KeyProtectorId": p.id.to_string(),
                    "KeyProtectorType": format!("{:?}", p.kind),
                })
            })
            .collect();
        json!({
            "MountPoint": "C:",
            "VolumeStatus": format!("{:?}", self.conversion),
            "ProtectionStatus": if self.protection_on { "On" } else { "Off" },
            "EncryptionPercentage": self.percentage,
            "KeyProtector": protectors,
        })
        .to_string()
    }
}

impl FakePlatform {
    pub fn new(state: FakeState) -> Self {
        Self {
            state: RefCell::new(state),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    /// Calls other than the read-only queries.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls
            .borrow()
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    pub fn protector_ids(&self, kind: KeyProtectorKind) -> Vec<ProtectorId> {
        self.state
            .borrow()
            .protectors
            .iter()
            .filter(|p| p.kind == kind)
            .map(|p| p.id)
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.borrow_mut().push(call);
    }
}

fn done() -> bde::Result<Completion> {
    Ok(Completion::Done(Output::default()))
}

fn failed(op: &'static str) -> BdeError {
    BdeError::Failed {
        op,
        status: 1,
        diagnostic: "ERROR: An error occurred (code 0x80070005): Access is denied.".into(),
    }
}

impl HardwareModule for FakePlatform {
    fn tpm_state(&self) -> tpm::Result<TpmState> {
        self.record(Call::TpmState);
        Ok(self.state.borrow().tpm)
    }

    fn initialize_tpm(&self) -> tpm::Result<TpmInitResult> {
        self.record(Call::InitializeTpm);
        let mut state = self.state.borrow_mut();
        state.tpm.ready = state.init_result.ready;
        Ok(state.init_result)
    }
}

impl VolumeQuery for FakePlatform {
    fn volume(&self, _mount_point: &str) -> volume::Result<VolumeState> {
        self.record(Call::Volume);
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;
        if state.conversion == ConversionStatus::DecryptionInProgress {
            state.percentage = (state.percentage - state.decrypt_step).max(0.0);
            if state.percentage == 0.0 {
                state.conversion = ConversionStatus::FullyDecrypted;
            }
        }
        state.queries += 1;
        if let Some((after, cancel)) = &state.cancel_after_queries {
            if state.queries >= *after {
                cancel.cancel();
            }
        }
        VolumeState::from_json(&state.to_json())
    }
}

impl EncryptionTool for FakePlatform {
    fn turn_on(&self, _mount_point: &str, _options: &TurnOnOptions) -> bde::Result<Completion> {
        self.record(Call::TurnOn);
        let mut state = self.state.borrow_mut();
        if state.turn_on_fails {
            return Err(failed("-on"));
        }
        if state.turn_on_needs_restart {
            return Ok(Completion::RestartRequired(HARDWARE_TEST_NOTICE.into()));
        }
        if state.encrypt_in_background {
            state.conversion = ConversionStatus::EncryptionInProgress;
            state.percentage = 10.0;
        } else {
            state.conversion = ConversionStatus::FullyEncrypted;
            state.percentage = 100.0;
        }
        done()
    }

    fn turn_off(&self, _mount_point: &str) -> bde::Result<Completion> {
        self.record(Call::TurnOff);
        let mut state = self.state.borrow_mut();
        state.protection_on = false;
        state.conversion = ConversionStatus::DecryptionInProgress;
        done()
    }

    fn add_protector(&self, _mount_point: &str, kind: KeyProtectorKind) -> bde::Result<Completion> {
        self.record(Call::AddProtector(kind));
        let mut state = self.state.borrow_mut();
        if state.silently_skip_add != Some(kind) {
            state.push_protector(kind);
        }
        done()
    }

    fn delete_protector(&self, _mount_point: &str, id: &ProtectorId) -> bde::Result<Completion> {
        self.record(Call::DeleteProtector(*id));
        let mut state = self.state.borrow_mut();
        if state.delete_fails {
            return Err(failed("-protectors -delete"));
        }
        state.protectors.retain(|p| p.id != *id);
        if state.protectors.is_empty() {
            state.protection_on = false;
        }
        done()
    }

    fn resume_protection(&self, _mount_point: &str) -> bde::Result<Completion> {
        self.record(Call::Resume);
        let mut state = self.state.borrow_mut();
        if !state.protectors.is_empty() {
            state.protection_on = true;
        }
        done()
    }
}

impl RecoveryEscrow for FakePlatform {
    fn escrow(
        &self,
        _mount_point: &str,
        id: &ProtectorId,
        target: EscrowTarget,
    ) -> escrow::Result<()> {
        self.record(Call::Escrow(*id, target));
        if self.state.borrow().escrow_fails {
            return Err(EscrowError::Bde(failed("-protectors -adbackup")));
        }
        Ok(())
    }
}
