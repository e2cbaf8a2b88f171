//! Encryption state of a BitLocker volume as reported by `Get-BitLockerVolume`.

use serde::{Deserialize, Deserializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("unparseable volume status output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no volume status returned for `{0}`")]
    Empty(String),
    #[error("invalid key protector id `{0}`")]
    InvalidProtectorId(String),
    #[error(transparent)]
    PowerShell(#[from] crate::powershell::PowerShellError),
}

pub type Result<T, E = VolumeError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectionStatus {
    On,
    Off,
    Encrypting,
    Suspended,
}

impl fmt::Display for ProtectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::On => "On",
            Self::Off => "Off",
            Self::Encrypting => "Encrypting",
            Self::Suspended => "Suspended",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ConversionStatus {
    FullyDecrypted,
    FullyEncrypted,
    EncryptionInProgress,
    DecryptionInProgress,
    EncryptionSuspended,
    DecryptionSuspended,
    FullyEncryptedWipeInProgress,
    FullyEncryptedWipeSuspended,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum KeyProtectorKind {
    Tpm,
    RecoveryPassword,
    TpmPin,
    TpmStartupKey,
    TpmPinStartupKey,
    ExternalKey,
    Password,
    PublicKey,
    TpmNetworkKey,
    AdAccountOrGroup,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for KeyProtectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Tpm => "TPM",
            Self::RecoveryPassword => "recovery password",
            Self::TpmPin => "TPM and PIN",
            Self::TpmStartupKey => "TPM and startup key",
            Self::TpmPinStartupKey => "TPM, PIN and startup key",
            Self::ExternalKey => "external key",
            Self::Password => "password",
            Self::PublicKey => "public key",
            Self::TpmNetworkKey => "TPM and network key",
            Self::AdAccountOrGroup => "AD account or group",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Key protector GUID, rendered the way `manage-bde` expects it: braced and
/// upper-case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ProtectorId(Uuid);

impl ProtectorId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for ProtectorId {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches('{').trim_end_matches('}');
        Uuid::parse_str(trimmed)
            .map(Self)
            .map_err(|_| VolumeError::InvalidProtectorId(s.to_owned()))
    }
}

impl TryFrom<String> for ProtectorId {
    type Error = VolumeError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl fmt::Display for ProtectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.0.to_string().to_uppercase())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyProtector {
    #[serde(rename = "KeyProtectorId")]
    pub id: ProtectorId,
    #[serde(rename = "KeyProtectorType")]
    pub kind: KeyProtectorKind,
}

/// Snapshot of one query. Never reused across a call that may change the
/// volume.
#[derive(Debug, Clone, PartialEq)]
pub struct VolumeState {
    pub mount_point: String,
    pub protection: ProtectionStatus,
    pub conversion: ConversionStatus,
    pub encryption_percentage: f64,
    pub protectors: Vec<KeyProtector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
enum RawProtection {
    On,
    Off,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawVolume {
    mount_point: String,
    volume_status: ConversionStatus,
    protection_status: RawProtection,
    #[serde(default)]
    encryption_percentage: Option<f64>,
    #[serde(default, deserialize_with = "one_or_many")]
    key_protector: Vec<KeyProtector>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

/// PowerShell collapses single-element arrays into a bare object and empty
/// ones into `null`.
fn one_or_many<'de, D, T>(deserializer: D) -> core::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(item)) => vec![item],
        Some(OneOrMany::Many(items)) => items,
    })
}

impl From<RawVolume> for VolumeState {
    fn from(raw: RawVolume) -> Self {
        let protection = derive_protection(
            raw.protection_status,
            raw.volume_status,
            !raw.key_protector.is_empty(),
        );
        Self {
            mount_point: raw.mount_point,
            protection,
            conversion: raw.volume_status,
            encryption_percentage: raw.encryption_percentage.unwrap_or_default(),
            protectors: raw.key_protector,
        }
    }
}

fn derive_protection(
    raw: RawProtection,
    conversion: ConversionStatus,
    has_protectors: bool,
) -> ProtectionStatus {
    use ConversionStatus::*;
    match (raw, conversion) {
        (RawProtection::On, _) => ProtectionStatus::On,
        (_, EncryptionInProgress | EncryptionSuspended) => ProtectionStatus::Encrypting,
        (_, FullyEncrypted | FullyEncryptedWipeInProgress | FullyEncryptedWipeSuspended)
            if has_protectors =>
        {
            ProtectionStatus::Suspended
        }
        _ => ProtectionStatus::Off,
    }
}

impl VolumeState {
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: RawVolume = serde_json::from_str(json.trim())?;
        Ok(raw.into())
    }

    pub fn protectors_of(&self, kind: KeyProtectorKind) -> impl Iterator<Item = &KeyProtector> {
        self.protectors.iter().filter(move |p| p.kind == kind)
    }

    pub fn has(&self, kind: KeyProtectorKind) -> bool {
        self.protectors_of(kind).next().is_some()
    }

    pub fn fully_encrypted_by_percentage(&self) -> bool {
        self.encryption_percentage >= 100.0
    }

    pub fn fully_decrypted(&self) -> bool {
        self.conversion == ConversionStatus::FullyDecrypted
    }
}
