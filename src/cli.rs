use crate::config::{Config, DEFAULT_CONFIG_PATH};
use crate::enforce::{enforce, Cancellation, EnforceOptions, EscrowSkip, EscrowStatus, Outcome};
use crate::escrow::EscrowTarget;
use crate::platform::SystemPlatform;
use clap::Parser;
use eyre::{ensure, Result, WrapErr};
use log::{info, warn};
use std::path::PathBuf;

const CONFIG_ENV_VAR: &str = "TPM_BITLOCKER_CONFIG";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Delete every key protector and decrypt the volume before enabling BitLocker again
    #[arg(short, long)]
    force: bool,

    /// YAML configuration file (missing file means defaults)
    #[arg(short, long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH, env = CONFIG_ENV_VAR)]
    config: PathBuf,

    /// Volume to protect, e.g. `C:`
    #[arg(short, long, value_name = "VOLUME")]
    mount_point: Option<String>,

    /// Directory service that receives the recovery password
    #[arg(short, long, value_enum)]
    escrow: Option<EscrowTarget>,

    /// Give up waiting for a forced decryption after this many seconds
    #[arg(long, value_name = "SECONDS")]
    decrypt_timeout: Option<u64>,

    /// Do not write a session transcript
    #[arg(long)]
    no_transcript: bool,
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    /// Configuration file merged with command-line overrides.
    pub fn config(&self) -> Result<Config> {
        let mut config = Config::load_or_default(&self.config)?;
        if let Some(mount_point) = &self.mount_point {
            config.mount_point = mount_point.clone();
        }
        if let Some(escrow) = self.escrow {
            config.escrow = escrow;
        }
        if let Some(timeout) = self.decrypt_timeout {
            config.decrypt_timeout_secs = timeout;
        }
        if self.no_transcript {
            config.transcript_dir = None;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn enforce_options(&self, config: &Config) -> EnforceOptions {
        EnforceOptions {
            force: self.force,
            mount_point: config.mount_point.clone(),
            decrypt_timeout: config.decrypt_timeout(),
            poll_interval: config.poll_interval(),
            turn_on: config.turn_on_options(),
            escrow: config.escrow,
        }
    }

    pub fn run(&self, config: &Config) -> Result<Outcome> {
        let platform = SystemPlatform::from_config(config);
        ensure!(
            platform
                .is_elevated()
                .wrap_err("failed to determine whether this session is elevated")?,
            "tpm-bitlocker must run from an elevated (administrator) session"
        );

        let cancel = Cancellation::new();
        let handler = cancel.clone();
        ctrlc::set_handler(move || {
            warn!("interrupt received, stopping at the next status check");
            handler.cancel();
        })?;

        let options = self.enforce_options(config);
        if options.force {
            warn!(
                "force mode: all key protectors on {} will be deleted and the volume decrypted",
                options.mount_point
            );
        }
        let outcome = enforce(&platform, &options, &cancel)
            .wrap_err_with(|| format!("failed to enforce BitLocker on {}", options.mount_point))?;
        summarize(&outcome);
        Ok(outcome)
    }
}

fn summarize(outcome: &Outcome) {
    match outcome {
        Outcome::RestartRequired { notice, .. } => {
            info!("{notice}");
            info!("Restart the computer, then run tpm-bitlocker again to finish.");
        }
        Outcome::Completed(report) => {
            for action in &report.actions {
                info!("done: {action:?}");
            }
            match &report.escrow {
                EscrowStatus::Escrowed { .. } | EscrowStatus::Disabled => {}
                EscrowStatus::Failed { reason, .. } => {
                    warn!("BitLocker is enabled but the recovery password was not escrowed: {reason}")
                }
                EscrowStatus::Skipped(EscrowSkip::ProtectionNotOn(status)) => warn!(
                    "recovery password not escrowed because protection is {status}; run again once encryption completes"
                ),
                EscrowStatus::Skipped(EscrowSkip::NoRecoveryPassword) => {
                    warn!("recovery password not escrowed because the volume has no recovery password protector")
                }
            }
            info!(
                "{}: protection {}, {} protector(s)",
                report.volume.mount_point,
                report.volume.protection,
                report.volume.protectors.len()
            );
        }
    }
}
