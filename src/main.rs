use eyre::Result;
use log::info;
use tpm_bitlocker::cli::Cli;
use tpm_bitlocker::logging;

fn main() -> Result<()> {
    let cli = Cli::new();
    let config = cli.config()?;
    if let Some(transcript) = logging::init(config.transcript_dir.as_deref())? {
        info!("session transcript: {}", transcript.display());
    }
    cli.run(&config)?;
    Ok(())
}
