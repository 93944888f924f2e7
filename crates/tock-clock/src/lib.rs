//! `tock-clock`: the time source every scheduling decision is made against.
//!
//! Two implementations of [`Clock`]:
//!
//! | Type           | Behaviour                                                  |
//! |----------------|------------------------------------------------------------|
//! | `SystemClock`  | Wall-clock `now()`, timers run as Tokio tasks               |
//! | `VirtualClock` | Starts at a fixed epoch, moves only via `tick_*`, fires due timers synchronously in a deterministic order |

pub mod clock;
pub mod error;
pub mod system;
pub mod times;
pub mod virtual_clock;

pub use clock::{sleep, Clock, TimerCallback, TimerHandle};
pub use error::{ClockError, Result};
pub use system::SystemClock;
pub use times::{find_execution_times_between, Recurrence};
pub use virtual_clock::{VirtualClock, VIRTUAL_EPOCH_MS};
