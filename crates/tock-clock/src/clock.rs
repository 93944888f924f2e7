use std::fmt;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::oneshot;

use crate::error::Result;

/// Callback run when a timer fires. Intervals call it once per occurrence.
pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

/// Opaque identifier returned by `set_timeout` / `set_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(pub(crate) u64);

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Source of "now" plus one-shot and repeating timers.
///
/// Exactly one implementation is active per process. Collaborators receive it
/// as `Arc<dyn Clock>` so tests can swap in a [`VirtualClock`](crate::VirtualClock).
pub trait Clock: Send + Sync {
    /// Stable lowercase name used in logs and errors.
    fn name(&self) -> &'static str;

    fn now(&self) -> DateTime<Utc>;

    /// Run `callback` once after `delay`.
    ///
    /// A non-positive delay runs the callback synchronously before returning.
    fn set_timeout(&self, callback: TimerCallback, delay: Duration) -> TimerHandle;

    /// Cancel a pending timeout. Unknown or already-fired handles are ignored.
    fn clear_timeout(&self, handle: TimerHandle);

    /// Run `callback` every `period`, first at `now + period`.
    fn set_interval(&self, callback: TimerCallback, period: Duration) -> TimerHandle;

    fn clear_interval(&self, handle: TimerHandle);

    /// Advance time manually. Only the virtual clock supports this.
    fn tick_ms(&self, ms: u64) -> Result<()>;

    fn tick_seconds(&self, seconds: u64) -> Result<()> {
        self.tick_ms(seconds.saturating_mul(1_000))
    }

    fn tick_minutes(&self, minutes: u64) -> Result<()> {
        self.tick_ms(minutes.saturating_mul(60_000))
    }
}

/// Wait `delay` as measured by `clock`.
///
/// On a virtual clock this only resolves once the test ticks past the
/// deadline; a non-positive delay resolves immediately on either clock.
pub async fn sleep(clock: &dyn Clock, delay: Duration) {
    let (tx, rx) = oneshot::channel::<()>();
    let mut tx = Some(tx);
    let handle = clock.set_timeout(
        Box::new(move || {
            if let Some(tx) = tx.take() {
                let _ = tx.send(());
            }
        }),
        delay,
    );
    let guard = ClearOnDrop { clock, handle };
    let _ = rx.await;
    drop(guard);
}

/// Clears a timer if the awaiting future is dropped before it fires.
struct ClearOnDrop<'a> {
    clock: &'a dyn Clock,
    handle: TimerHandle,
}

impl Drop for ClearOnDrop<'_> {
    fn drop(&mut self) {
        self.clock.clear_timeout(self.handle);
    }
}
