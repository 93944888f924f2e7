use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::clock::{Clock, TimerCallback, TimerHandle};
use crate::error::{ClockError, Result};

/// Wall-clock time with timers backed by Tokio tasks.
///
/// `set_timeout` / `set_interval` spawn onto the current runtime, so they must
/// be called from within a Tokio context.
pub struct SystemClock {
    next_id: AtomicU64,
    timers: Arc<DashMap<u64, CancellationToken>>,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            timers: Arc::new(DashMap::new()),
        }
    }

    /// Number of timers that have not fired or been cleared yet.
    pub fn pending(&self) -> usize {
        self.timers.len()
    }

    fn register(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        self.timers.insert(id, token.clone());
        (id, token)
    }

    fn clear(&self, handle: TimerHandle) {
        if let Some((_, token)) = self.timers.remove(&handle.0) {
            token.cancel();
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SystemClock {
    fn drop(&mut self) {
        for entry in self.timers.iter() {
            entry.value().cancel();
        }
    }
}

fn to_std(d: Duration) -> std::time::Duration {
    d.to_std().unwrap_or(std::time::Duration::ZERO)
}

impl Clock for SystemClock {
    fn name(&self) -> &'static str {
        "system"
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn set_timeout(&self, mut callback: TimerCallback, delay: Duration) -> TimerHandle {
        if delay <= Duration::zero() {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            callback();
            return TimerHandle(id);
        }

        let (id, token) = self.register();
        let timers = Arc::clone(&self.timers);
        let wait = to_std(delay);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = sleep(wait) => {
                    timers.remove(&id);
                    trace!(timer = id, "system timeout fired");
                    callback();
                }
            }
        });
        TimerHandle(id)
    }

    fn clear_timeout(&self, handle: TimerHandle) {
        self.clear(handle);
    }

    fn set_interval(&self, mut callback: TimerCallback, period: Duration) -> TimerHandle {
        let period = to_std(period).max(std::time::Duration::from_millis(1));
        let (id, token) = self.register();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        trace!(timer = id, "system interval fired");
                        callback();
                    }
                }
            }
        });
        TimerHandle(id)
    }

    fn clear_interval(&self, handle: TimerHandle) {
        self.clear(handle);
    }

    fn tick_ms(&self, _ms: u64) -> Result<()> {
        Err(ClockError::Unsupported {
            clock: "system",
            operation: "tick",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn tick_is_unsupported() {
        let clock = SystemClock::new();
        assert!(clock.tick_seconds(1).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_after_delay() {
        let clock = SystemClock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        clock.set_timeout(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::milliseconds(50),
        );
        assert_eq!(clock.pending(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(clock.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleared_interval_stops() {
        let clock = SystemClock::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = clock.set_interval(
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
            Duration::milliseconds(100),
        );

        tokio::time::sleep(std::time::Duration::from_millis(350)).await;
        clock.clear_interval(handle);
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 3, "expected at least 3 firings, saw {seen}");

        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn sleep_helper_resolves_on_system_clock() {
        let clock = SystemClock::new();
        crate::sleep(&clock, Duration::milliseconds(5)).await;
        crate::sleep(&clock, Duration::zero()).await;
        assert_eq!(clock.pending(), 0);
    }
}
