//! # Timing-wheel timer service.
//!
//! Two layers:
//! - [`Dispatcher`] — a hierarchical timing wheel running on its own task,
//!   producing raw timer fires on a bounded channel.
//! - [`TimerMgr`] — named timer kinds on top of the wheel: one-shot and
//!   periodic timers, accelerate/delay, cancellation, metadata.
//!
//! The skeleton consumes the fire channel on the module task, so timer
//! handlers run with the same single-threaded guarantees as RPC handlers.

mod dispatcher;
mod manager;

pub use dispatcher::{Dispatcher, DispatcherHandle, RawTimer, TimerCallback, LEVELS, TICK_MS};
pub use manager::{AdjustMode, ManagedTimer, TimerHandler, TimerMgr, PCT_BASE};

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
