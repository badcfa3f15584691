//! Cancellable one-shot timers
//!
//! Every deadline the hub tracks (execution timeout, cancel/interrupt grace,
//! heartbeat expiry, dispatch backoff) is a [`TimerHandle`] stored next to
//! the state it guards. Dropping the handle cancels the timer, so removing
//! the guarded record always disarms it.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Run `on_expire` after `delay` unless the returned handle is cancelled first
///
/// The callback must tolerate firing against state that changed in the
/// meantime; cancellation only wins if it lands before the deadline.
pub fn arm<F, Fut>(delay: Duration, on_expire: F) -> TimerHandle
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let cancelled = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            biased;
            () = cancelled.cancelled() => {}
            () = tokio::time::sleep(delay) => on_expire().await,
        }
    });
    TimerHandle { token }
}
