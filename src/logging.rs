//! `env_logger` setup with an optional session transcript.
//!
//! When a transcript directory is configured every record is written both to
//! stderr and to `<dir>/tpm-bitlocker_<YYYYmmdd_HHMMSS>.log`.

use chrono::{DateTime, Local};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

const TRANSCRIPT_PREFIX: &str = "tpm-bitlocker";

/// Installs the global logger, returning the transcript path if one was
/// opened.
pub fn init(transcript_dir: Option<&Path>) -> io::Result<Option<PathBuf>> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let transcript = match transcript_dir {
        Some(dir) => {
            let (path, file) = open_transcript(dir, Local::now())?;
            builder.target(env_logger::Target::Pipe(Box::new(Tee {
                file,
                stderr: io::stderr(),
            })));
            Some(path)
        }
        None => None,
    };

    builder.init();
    Ok(transcript)
}

pub fn transcript_path(dir: &Path, started: DateTime<Local>) -> PathBuf {
    dir.join(format!(
        "{}_{}.log",
        TRANSCRIPT_PREFIX,
        started.format("%Y%m%d_%H%M%S")
    ))
}

fn open_transcript(dir: &Path, started: DateTime<Local>) -> io::Result<(PathBuf, File)> {
    fs::create_dir_all(dir)?;
    let path = transcript_path(dir, started);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;
    Ok((path, file))
}

struct Tee {
    file: File,
    stderr: io::Stderr,
}

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write_all(buf)?;
        self.stderr.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.stderr.flush()
    }
}
