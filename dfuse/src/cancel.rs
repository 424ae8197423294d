use std::{
    sync::{Arc, Condvar, Mutex},
    thread,
    time::{Duration, Instant},
};

use log::warn;

/// Shared, idempotent cancellation flag. Once set it stays set.
///
/// The condition variable makes it double as a cancellable deadline:
/// [`CancelToken::wait_timeout`] blocks until either the timeout elapses or
/// some clone of the token is cancelled, whichever comes first.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        let (flag, cvar) = &*self.inner;
        let mut cancelled = flag.lock().unwrap();
        *cancelled = true;
        cvar.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap()
    }

    /// Sleep for `timeout`, waking early on cancellation. Returns whether
    /// the token was cancelled.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (flag, cvar) = &*self.inner;
        let deadline = Instant::now() + timeout;
        let mut cancelled = flag.lock().unwrap();
        loop {
            if *cancelled {
                return true;
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now())
            else {
                return false;
            };
            (cancelled, _) = cvar.wait_timeout(cancelled, remaining).unwrap();
        }
    }
}

/// Log `message` as a warning after `delay`, unless `cancel` fires first.
/// The returned handle must be joined before the owning task finishes.
pub fn spawn_deferred_notice(
    message: String,
    delay: Duration,
    cancel: CancelToken,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        if !cancel.wait_timeout(delay) {
            warn!("{message}");
        }
    })
}
