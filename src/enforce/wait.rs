use super::{EnforceError, Result};
use crate::platform::VolumeQuery;
use crate::volume::VolumeState;
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const CANCEL_CHECK: Duration = Duration::from_millis(100);

/// Shared flag checked between polls; set from a Ctrl-C handler.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Polls `mount_point` at a fixed interval until it reports fully decrypted.
pub(super) fn wait_for_decryption<Q: VolumeQuery + ?Sized>(
    query: &Q,
    mount_point: &str,
    timeout: Duration,
    interval: Duration,
    cancel: &Cancellation,
) -> Result<VolumeState> {
    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            return Err(EnforceError::Cancelled(mount_point.to_owned()));
        }

        let volume = query.volume(mount_point)?;
        if volume.fully_decrypted() {
            return Ok(volume);
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return Err(EnforceError::DecryptTimeout {
                mount_point: mount_point.to_owned(),
                timeout,
                percentage: volume.encryption_percentage,
            });
        }

        info!(
            "{mount_point} decrypting: {:.1}% still encrypted ({:?})",
            volume.encryption_percentage, volume.conversion
        );
        sleep(interval.min(timeout - elapsed), cancel);
    }
}

fn sleep(duration: Duration, cancel: &Cancellation) {
    let deadline = Instant::now() + duration;
    while !cancel.is_cancelled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(CANCEL_CHECK.min(deadline - now));
    }
}
