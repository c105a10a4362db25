//! Cooperative cancellation for long fills and settle waits.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Shared cancellation flag. Clones observe the same flag.
///
/// The orchestrator checks it at every suspension point: before each fill,
/// during the settle wait and between poll attempts. Cancellation never
/// interrupts a write in flight.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// Fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Has cancellation been requested?
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns `false` when the wait was cut short.
    #[must_use]
    pub fn sleep(&self, duration: Duration) -> bool {
        let slice = Duration::from_millis(100);
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return false;
            }
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining = remaining.saturating_sub(nap);
        }
        !self.is_cancelled()
    }

    /// Trip this token on SIGINT / SIGTERM.
    #[cfg(all(unix, feature = "cli"))]
    pub fn register_signal_hooks(&self) {
        use signal_hook::consts::{SIGINT, SIGTERM};

        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.flag)) {
            eprintln!("[CAP-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.flag)) {
            eprintln!("[CAP-SIGNAL] failed to register SIGINT: {e}");
        }
    }
}
