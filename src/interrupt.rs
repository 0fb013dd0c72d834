use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use crate::docker::CancelToken;

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

const WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Whether SIGINT or SIGTERM has been received since [`install`].
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::Acquire)
}

/// Route SIGINT/SIGTERM into `cancel` so an interrupted run still tears
/// down its environment. On non-Unix platforms this is a no-op.
pub fn install(cancel: CancelToken) -> Result<()> {
    register()?;
    std::thread::spawn(move || {
        while !interrupted() {
            std::thread::sleep(WATCH_INTERVAL);
        }
        warn!("interrupt received, cancelling build");
        cancel.cancel();
    });
    Ok(())
}

#[cfg(unix)]
extern "C" fn on_signal(_: libc::c_int) {
    // Only async-signal-safe work here.
    INTERRUPTED.store(true, Ordering::Release);
}

#[cfg(unix)]
fn register() -> Result<()> {
    for signal in [libc::SIGINT, libc::SIGTERM] {
        // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
        let previous =
            unsafe { libc::signal(signal, on_signal as *const () as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            anyhow::bail!(
                "failed to install handler for signal {signal}: {}",
                std::io::Error::last_os_error()
            );
        }
    }
    Ok(())
}

#[cfg(not(unix))]
fn register() -> Result<()> {
    Ok(())
}
