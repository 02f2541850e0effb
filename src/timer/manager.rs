//! # Managed timers.
//!
//! [`TimerMgr`] layers named timer kinds over the wheel: a kind binds a
//! handler once, then any number of one-shot timers and tickers fire through
//! it carrying a `string → string` metadata map the framework keeps opaque.
//!
//! A ticker re-arms by advancing `start := end; end += period`, so its phase
//! is anchored to the original schedule and does not drift with handler
//! latency.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::error::TimerError;
use crate::idgen;
use crate::timer::dispatcher::{DispatcherHandle, TimerCallback};
use crate::timer::now_ms;

/// Base for percentage adjustments: values are in ten-thousandths.
pub const PCT_BASE: i64 = 10_000;

/// How accelerate/delay interpret their value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdjustMode {
    /// Value is an absolute number of milliseconds (must be > 0).
    Abs,
    /// Value is a fraction of the remaining time, in `(0, PCT_BASE]`.
    Pct,
}

/// Handler bound to a timer kind.
pub type TimerHandler = Arc<dyn Fn(i64, &HashMap<String, String>) + Send + Sync + 'static>;

/// A managed timer as tracked by the manager.
#[derive(Clone, Debug)]
pub struct ManagedTimer {
    /// Stable id, unchanged across accelerate/delay.
    pub id: i64,
    /// The kind whose handler fires.
    pub kind: String,
    /// Schedule origin, unix milliseconds.
    pub start_ts: i64,
    /// Expiry, unix milliseconds.
    pub end_ts: i64,
    /// Whether the timer re-arms after each fire.
    pub periodic: bool,
    /// Opaque handler context.
    pub metadata: HashMap<String, String>,
}

struct Inner {
    timers: HashMap<i64, ManagedTimer>,
    handlers: HashMap<String, TimerHandler>,
}

/// Named timer kinds on top of the dispatcher.
pub struct TimerMgr {
    inner: Mutex<Inner>,
    dispatcher: DispatcherHandle,
    // handle to self for the re-arming dispatcher callback
    weak: Weak<TimerMgr>,
}

impl TimerMgr {
    /// Creates a manager over a dispatcher handle.
    pub fn new(dispatcher: DispatcherHandle) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(Inner {
                timers: HashMap::new(),
                handlers: HashMap::new(),
            }),
            dispatcher,
            weak: weak.clone(),
        })
    }

    /// Stops the underlying dispatcher task.
    pub fn stop(&self) {
        self.dispatcher.stop();
    }

    /// Binds a handler to a kind. Re-registering replaces the handler.
    pub fn register_kind<F>(&self, kind: &str, handler: F)
    where
        F: Fn(i64, &HashMap<String, String>) + Send + Sync + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.handlers.insert(kind.to_string(), Arc::new(handler));
    }

    /// One-shot timer firing `dur_ms` from now.
    pub fn new_timer(
        &self,
        dur_ms: i64,
        kind: &str,
        metadata: HashMap<String, String>,
    ) -> Result<i64, TimerError> {
        self.arm(0, dur_ms, kind, metadata, false)
    }

    /// Periodic timer; `id == 0` allocates a fresh id, otherwise the given id
    /// is reused.
    pub fn new_ticker(
        &self,
        id: i64,
        dur_ms: i64,
        kind: &str,
        metadata: HashMap<String, String>,
    ) -> Result<i64, TimerError> {
        self.arm(id, dur_ms, kind, metadata, true)
    }

    fn arm(
        &self,
        id: i64,
        dur_ms: i64,
        kind: &str,
        metadata: HashMap<String, String>,
        periodic: bool,
    ) -> Result<i64, TimerError> {
        if dur_ms <= 0 {
            return Err(TimerError::InvalidArgument {
                reason: format!("duration must be positive, got {dur_ms}"),
            });
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.handlers.contains_key(kind) {
            return Err(TimerError::InvalidArgument {
                reason: format!("timer kind '{kind}' not registered"),
            });
        }
        let id = if id == 0 { idgen::next_id() } else { id };
        let start_ts = now_ms();
        let end_ts = start_ts + dur_ms;
        inner.timers.insert(
            id,
            ManagedTimer {
                id,
                kind: kind.to_string(),
                start_ts,
                end_ts,
                periodic,
                metadata,
            },
        );
        drop(inner);
        self.dispatcher.schedule(id, end_ts, self.common_callback());
        Ok(id)
    }

    /// Shortens the remaining time of a timer.
    pub fn accelerate(&self, id: i64, mode: AdjustMode, value: i64) -> Result<(), TimerError> {
        self.adjust(id, mode, value, true)
    }

    /// Extends the remaining time of a timer.
    pub fn delay(&self, id: i64, mode: AdjustMode, value: i64) -> Result<(), TimerError> {
        self.adjust(id, mode, value, false)
    }

    fn adjust(
        &self,
        id: i64,
        mode: AdjustMode,
        value: i64,
        accelerate: bool,
    ) -> Result<(), TimerError> {
        let now = now_ms();
        let mut inner = self.inner.lock().unwrap();
        let Some(t) = inner.timers.get_mut(&id) else {
            return Err(TimerError::NotFound { id });
        };
        let remain = t.end_ts - now;
        let new_remain = match mode {
            AdjustMode::Abs => {
                if value <= 0 {
                    return Err(TimerError::InvalidArgument {
                        reason: format!("abs adjustment must be positive, got {value}"),
                    });
                }
                if accelerate {
                    (remain - value).max(0)
                } else {
                    remain + value
                }
            }
            AdjustMode::Pct => {
                if value <= 0 || value > PCT_BASE {
                    return Err(TimerError::InvalidArgument {
                        reason: format!("pct adjustment must be in (0, {PCT_BASE}], got {value}"),
                    });
                }
                if accelerate {
                    remain * (PCT_BASE - value) / PCT_BASE
                } else {
                    remain * (PCT_BASE + value) / PCT_BASE
                }
            }
        };
        let new_end = now + new_remain;
        t.end_ts = new_end;
        drop(inner);
        self.dispatcher.reschedule(id, new_end);
        Ok(())
    }

    /// Moves a timer to an absolute expiry; its kind and metadata are kept.
    pub fn update(&self, id: i64, new_end_ts: i64) -> Result<(), TimerError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(t) = inner.timers.get_mut(&id) else {
            return Err(TimerError::NotFound { id });
        };
        t.end_ts = new_end_ts;
        drop(inner);
        self.dispatcher.reschedule(id, new_end_ts);
        Ok(())
    }

    /// Cancels a timer; the id is removed exactly once.
    pub fn cancel(&self, id: i64) {
        if id == 0 {
            tracing::warn!("cancel called with timer id 0");
            return;
        }
        self.dispatcher.cancel(id);
        self.inner.lock().unwrap().timers.remove(&id);
    }

    /// Snapshot of a managed timer.
    pub fn get(&self, id: i64) -> Option<ManagedTimer> {
        self.inner.lock().unwrap().timers.get(&id).cloned()
    }

    /// Snapshot of any managed timer of the given kind.
    pub fn get_by_kind(&self, kind: &str) -> Option<ManagedTimer> {
        let inner = self.inner.lock().unwrap();
        inner.timers.values().find(|t| t.kind == kind).cloned()
    }

    /// The callback the dispatcher fires for every managed timer.
    pub(crate) fn common_callback(&self) -> TimerCallback {
        let weak = self.weak.clone();
        Arc::new(move |id| {
            if let Some(mgr) = weak.upgrade() {
                mgr.on_fire(id);
            }
        })
    }

    /// Common-path dispatch: look up the managed record, re-arm tickers, then
    /// invoke the kind handler outside the lock.
    ///
    /// A missing record means the timer was cancelled while its fire was in
    /// flight; the fire is silently dropped.
    fn on_fire(&self, id: i64) {
        let (handler, metadata) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(t) = inner.timers.get(&id).cloned() else {
                return;
            };
            if now_ms() < t.end_ts {
                tracing::warn!(id, end_ts = t.end_ts, "timer fired before its expiry");
            }
            let handler = inner.handlers.get(&t.kind).cloned();
            if t.periodic {
                let period = t.end_ts - t.start_ts;
                let rearmed = ManagedTimer {
                    start_ts: t.end_ts,
                    end_ts: t.end_ts + period,
                    ..t.clone()
                };
                let next_end = rearmed.end_ts;
                inner.timers.insert(id, rearmed);
                drop(inner);
                self.dispatcher.schedule(id, next_end, self.common_callback());
            } else {
                inner.timers.remove(&id);
            }
            (handler, t.metadata)
        };
        if let Some(handler) = handler {
            handler(id, &metadata);
        }
    }
}
