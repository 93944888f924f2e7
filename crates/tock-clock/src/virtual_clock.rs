use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, TimeZone, Utc};
use tracing::{debug, trace};

use crate::clock::{Clock, TimerCallback, TimerHandle};
use crate::error::Result;
use crate::times::{find_execution_times_between, Recurrence};

/// Fixed start of virtual time: 2020-01-01T00:00:00Z.
pub const VIRTUAL_EPOCH_MS: i64 = 1_577_836_800_000;

struct OneShot {
    fire_at: i64,
    callback: TimerCallback,
}

struct Repeating {
    recurrence: Recurrence,
    /// Taken out while the callback runs so the lock is not held.
    callback: Option<TimerCallback>,
}

struct State {
    now_ms: i64,
    next_id: u64,
    timeouts: BTreeMap<u64, OneShot>,
    intervals: BTreeMap<u64, Repeating>,
}

impl State {
    fn allocate(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

/// Ordering key of one due occurrence: timestamp, then one-shots before
/// intervals, then registration order.
#[derive(Debug, Clone, Copy)]
enum Due {
    Timeout { at: i64, id: u64 },
    Interval { at: i64, id: u64 },
}

impl Due {
    fn sort_key(&self) -> (i64, u8, u64) {
        match *self {
            Due::Timeout { at, id } => (at, 0, id),
            Due::Interval { at, id } => (at, 1, id),
        }
    }
}

/// Simulated time source that only moves when ticked.
///
/// Cloning yields another handle onto the same timeline, so a test can keep
/// one handle for ticking while the code under test owns another.
///
/// Ticking fires every timer due in `(old_now, new_now]` synchronously, in
/// timestamp order; at one timestamp all one-shots fire (in registration
/// order) before any interval, and intervals fire in creation order. Timers
/// registered by a callback are never fired by the tick that ran it.
#[derive(Clone)]
pub struct VirtualClock {
    state: Arc<Mutex<State>>,
}

impl VirtualClock {
    /// Clock starting at [`VIRTUAL_EPOCH_MS`].
    pub fn new() -> Self {
        Self::starting_at_ms(VIRTUAL_EPOCH_MS)
    }

    pub fn starting_at_ms(epoch_ms: i64) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                now_ms: epoch_ms,
                next_id: 1,
                timeouts: BTreeMap::new(),
                intervals: BTreeMap::new(),
            })),
        }
    }

    pub fn now_ms(&self) -> i64 {
        self.state.lock().unwrap().now_ms
    }

    /// Number of registered timeouts and intervals that may still fire.
    pub fn pending(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.timeouts.len() + state.intervals.len()
    }

    fn advance(&self, ms: i64) {
        let due = {
            let mut state = self.state.lock().unwrap();
            let old = state.now_ms;
            let new = old.saturating_add(ms);
            state.now_ms = new;

            let mut due: Vec<Due> = state
                .timeouts
                .iter()
                .filter(|(_, t)| t.fire_at > old && t.fire_at <= new)
                .map(|(&id, t)| Due::Timeout { at: t.fire_at, id })
                .collect();
            for (&id, iv) in &state.intervals {
                // (old, new] expressed as the half-open [old + 1, new + 1)
                for at in find_execution_times_between(
                    &iv.recurrence,
                    old.saturating_add(1),
                    new.saturating_add(1),
                ) {
                    due.push(Due::Interval { at, id });
                }
            }
            due.sort_by_key(Due::sort_key);
            due
        };

        if !due.is_empty() {
            debug!(count = due.len(), ms, "virtual clock firing due timers");
        }
        for occurrence in due {
            match occurrence {
                Due::Timeout { id, .. } => self.fire_timeout(id),
                Due::Interval { id, .. } => self.fire_interval(id),
            }
        }
    }

    fn fire_timeout(&self, id: u64) {
        // A timeout cleared by an earlier callback in this pass is gone here.
        let entry = self.state.lock().unwrap().timeouts.remove(&id);
        if let Some(mut timer) = entry {
            trace!(timer = id, "virtual timeout fired");
            (timer.callback)();
        }
    }

    fn fire_interval(&self, id: u64) {
        let callback = {
            let mut state = self.state.lock().unwrap();
            state.intervals.get_mut(&id).and_then(|iv| iv.callback.take())
        };
        let Some(mut callback) = callback else {
            return;
        };
        trace!(timer = id, "virtual interval fired");
        callback();

        let mut state = self.state.lock().unwrap();
        if let Some(iv) = state.intervals.get_mut(&id) {
            iv.callback = Some(callback);
        }
    }
}

impl Default for VirtualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for VirtualClock {
    fn name(&self) -> &'static str {
        "virtual"
    }

    fn now(&self) -> DateTime<Utc> {
        let ms = self.now_ms();
        Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
    }

    fn set_timeout(&self, mut callback: TimerCallback, delay: Duration) -> TimerHandle {
        let delay_ms = delay.num_milliseconds();
        let mut state = self.state.lock().unwrap();
        let id = state.allocate();
        if delay_ms <= 0 {
            drop(state);
            callback();
            return TimerHandle(id);
        }
        let fire_at = state.now_ms + delay_ms;
        state.timeouts.insert(id, OneShot { fire_at, callback });
        TimerHandle(id)
    }

    fn clear_timeout(&self, handle: TimerHandle) {
        self.state.lock().unwrap().timeouts.remove(&handle.0);
    }

    fn set_interval(&self, callback: TimerCallback, period: Duration) -> TimerHandle {
        let period_ms = period.num_milliseconds().max(1);
        let mut state = self.state.lock().unwrap();
        let id = state.allocate();
        let recurrence = Recurrence {
            first_occurrence: state.now_ms + period_ms,
            interval: period_ms,
        };
        state.intervals.insert(
            id,
            Repeating {
                recurrence,
                callback: Some(callback),
            },
        );
        TimerHandle(id)
    }

    fn clear_interval(&self, handle: TimerHandle) {
        self.state.lock().unwrap().intervals.remove(&handle.0);
    }

    fn tick_ms(&self, ms: u64) -> Result<()> {
        self.advance(i64::try_from(ms).unwrap_or(i64::MAX));
        Ok(())
    }
}
