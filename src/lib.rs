//! # tpm-bitlocker
//!
//! Brings a Windows system volume to a known BitLocker posture: encrypted,
//! one TPM protector, a recovery password protector, protection on, and the
//! recovery password escrowed to Active Directory or Azure AD.
//!
//! Run from an elevated prompt:
//! ```text
//! tpm-bitlocker                 # fill in whatever is missing
//! tpm-bitlocker --force         # remove protectors, decrypt, start over
//! tpm-bitlocker --escrow azure-ad
//! ```
//!
//! Exit status is 0 when the volume is done, or when a restart is needed
//! before it can be (run again after rebooting), and 1 on failure.

pub mod bde;
pub mod cli;
pub mod command;
pub mod config;
pub mod enforce;
pub mod escrow;
pub mod logging;
pub mod platform;
pub mod powershell;
pub mod tpm;
pub mod volume;
