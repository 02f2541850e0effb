//! # Hierarchical timing-wheel dispatcher.
//!
//! The wheel has [`LEVELS`] levels over a [`TICK_MS`] granularity: a timer is
//! placed at the largest level whose visit period (`TICK_MS << level`) still
//! fits its remaining time, so every level is revisited before its timers can
//! expire. Each tick walks the levels high-to-low and cascades timers whose
//! remaining time no longer fits one level down; at level 0 due timers are
//! delivered non-blocking on the fire channel. The mask test per level is
//! what keeps a tick amortized O(levels), not O(timers).
//!
//! ## Cancellation
//! `cancel` must take effect even while the op queue is backed up, so the id
//! is put in a shared cancelled set first; every placement and delivery path
//! checks the set before acting and removes the id when it is honoured.
//!
//! ## Clock adjustment
//! A forward wall-clock jump replays the intermediate ticks in order; a
//! backward jump adopts the new tick without replaying anything.

use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::error::panic_message;
use crate::idgen;
use crate::timer::now_ms;

/// Tick granularity in milliseconds (power of two).
pub const TICK_MS: i64 = 4;

/// Number of wheel levels; the longest schedulable horizon is
/// `TICK_MS << (LEVELS - 1)` milliseconds.
pub const LEVELS: usize = 28;

/// Callback attached to a raw timer, invoked with the timer id on fire.
pub type TimerCallback = Arc<dyn Fn(i64) + Send + Sync + 'static>;

/// A wheel-level timer as delivered on the fire channel.
pub struct RawTimer {
    /// Stable timer id.
    pub id: i64,
    /// Scheduled expiry, unix milliseconds.
    pub end_ts: i64,
    cb: TimerCallback,
}

impl RawTimer {
    /// Runs the timer callback, containing panics.
    pub fn fire(&self) {
        if let Err(payload) =
            std::panic::catch_unwind(AssertUnwindSafe(|| (self.cb)(self.id)))
        {
            tracing::error!(id = self.id, "timer callback panicked: {}", panic_message(&*payload));
        }
    }
}

impl fmt::Debug for RawTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawTimer")
            .field("id", &self.id)
            .field("end_ts", &self.end_ts)
            .finish()
    }
}

enum TimerOp {
    Schedule {
        id: i64,
        end_ts: i64,
        cb: TimerCallback,
    },
    Update {
        id: i64,
        end_ts: i64,
    },
    Cancel {
        id: i64,
    },
    Stop,
}

/// The wheel itself; single task, single writer of all wheel state.
pub struct Dispatcher {
    levels: Vec<HashMap<i64, RawTimer>>,
    op_rx: mpsc::Receiver<TimerOp>,
    fire_tx: mpsc::Sender<RawTimer>,
    cancelled: Arc<DashSet<i64>>,
    last_tick: i64,
    last_full_warn: i64,
}

impl Dispatcher {
    /// Creates a wheel with equally bounded op and fire queues.
    ///
    /// Returns the dispatcher (to be spawned via [`Dispatcher::run`]), its
    /// control handle, and the fire channel consumer.
    pub fn new(queue: usize) -> (Self, DispatcherHandle, mpsc::Receiver<RawTimer>) {
        Self::with_queues(queue, queue)
    }

    /// Creates a wheel with separately sized op and fire queues.
    pub fn with_queues(
        op_queue: usize,
        fire_queue: usize,
    ) -> (Self, DispatcherHandle, mpsc::Receiver<RawTimer>) {
        let (op_tx, op_rx) = mpsc::channel(op_queue);
        let (fire_tx, fire_rx) = mpsc::channel(fire_queue);
        let cancelled = Arc::new(DashSet::new());
        let dispatcher = Self {
            levels: (0..LEVELS).map(|_| HashMap::new()).collect(),
            op_rx,
            fire_tx,
            cancelled: Arc::clone(&cancelled),
            last_tick: now_ms() / TICK_MS,
            last_full_warn: 0,
        };
        let handle = DispatcherHandle { op_tx, cancelled };
        (dispatcher, handle, fire_rx)
    }

    /// Drives the wheel until a stop op arrives or every handle is dropped.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(Duration::from_millis(TICK_MS as u64));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                op = self.op_rx.recv() => match op {
                    Some(TimerOp::Stop) | None => break,
                    Some(op) => self.handle_op(op),
                },
                _ = ticker.tick() => self.on_tick(now_ms()),
            }
        }
    }

    fn handle_op(&mut self, op: TimerOp) {
        match op {
            TimerOp::Schedule { id, end_ts, cb } => {
                self.place(RawTimer { id, end_ts, cb }, now_ms());
            }
            TimerOp::Update { id, end_ts } => match self.remove(id) {
                Some(mut t) => {
                    t.end_ts = end_ts;
                    self.place(t, now_ms());
                }
                None => tracing::warn!(id, "reschedule for unknown timer"),
            },
            TimerOp::Cancel { id } => {
                self.remove(id);
                self.cancelled.remove(&id);
            }
            TimerOp::Stop => {}
        }
    }

    /// Removes a timer from whichever level holds it.
    fn remove(&mut self, id: i64) -> Option<RawTimer> {
        for level in (0..LEVELS).rev() {
            if let Some(t) = self.levels[level].remove(&id) {
                return Some(t);
            }
        }
        None
    }

    /// Inserts a timer at the level matching its remaining time, delivering
    /// immediately when already due. Cancelled ids are dropped here.
    fn place(&mut self, t: RawTimer, now: i64) {
        if self.cancelled.remove(&t.id).is_some() {
            return;
        }
        let diff = t.end_ts - now;
        if diff <= 0 {
            self.deliver(t, now);
            return;
        }
        // largest level whose period still fits the remaining time, so the
        // level is always revisited before the timer can expire
        let mut level = 0;
        while level < LEVELS - 1 && diff >= (TICK_MS << (level + 1)) {
            level += 1;
        }
        self.levels[level].insert(t.id, t);
    }

    /// Non-blocking delivery; a full fire queue leaves the timer in level 0
    /// so it is retried on the next tick.
    fn deliver(&mut self, t: RawTimer, now: i64) {
        let id = t.id;
        match self.fire_tx.try_send(t) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(t)) => {
                if now - self.last_full_warn >= 1_000 {
                    tracing::warn!(id, "timer fire queue full, delivery deferred");
                    self.last_full_warn = now;
                }
                self.levels[0].insert(id, t);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!(id, "timer consumer gone, fire dropped");
            }
        }
    }

    fn on_tick(&mut self, now: i64) {
        let now_tick = now / TICK_MS;
        if now_tick - self.last_tick < 1 {
            // clock stalled or moved backwards: catch up without replay
            self.last_tick = now_tick;
            return;
        }
        while self.last_tick < now_tick {
            self.last_tick += 1;
            for level in (0..LEVELS).rev() {
                if self.last_tick & ((1i64 << level) - 1) == 0 {
                    self.cascade(level, now);
                }
            }
        }
    }

    /// Moves every timer at `level` whose remaining time fits the next level
    /// down; at level 0, due timers are delivered.
    fn cascade(&mut self, level: usize, now: i64) {
        let window = TICK_MS << level;
        let due: Vec<i64> = self.levels[level]
            .iter()
            .filter(|(_, t)| t.end_ts - now <= window)
            .map(|(id, _)| *id)
            .collect();
        for id in due {
            let Some(t) = self.levels[level].remove(&id) else {
                continue;
            };
            if self.cancelled.remove(&id).is_some() {
                continue;
            }
            if level > 0 {
                self.levels[level - 1].insert(id, t);
            } else if now >= t.end_ts {
                self.deliver(t, now);
            } else {
                self.levels[0].insert(id, t);
            }
        }
    }
}

/// Control handle of a dispatcher; safe to clone and share.
#[derive(Clone)]
pub struct DispatcherHandle {
    op_tx: mpsc::Sender<TimerOp>,
    cancelled: Arc<DashSet<i64>>,
}

impl DispatcherHandle {
    /// Schedules a timer; `id == 0` allocates a fresh id.
    ///
    /// Returns the effective timer id.
    pub fn schedule(&self, id: i64, end_ts: i64, cb: TimerCallback) -> i64 {
        let id = if id == 0 { idgen::next_id() } else { id };
        self.send_op(TimerOp::Schedule { id, end_ts, cb });
        id
    }

    /// Moves an existing timer to a new expiry; its callback is unchanged.
    pub fn reschedule(&self, id: i64, end_ts: i64) {
        self.send_op(TimerOp::Update { id, end_ts });
    }

    /// Cancels a timer.
    ///
    /// Takes effect immediately from the caller's perspective: the id enters
    /// the cancelled set before the op is enqueued, so the timer cannot fire
    /// even if the op queue is backed up.
    pub fn cancel(&self, id: i64) {
        self.cancelled.insert(id);
        self.send_op(TimerOp::Cancel { id });
    }

    /// Stops the dispatcher task.
    pub fn stop(&self) {
        self.send_op(TimerOp::Stop);
    }

    fn send_op(&self, op: TimerOp) {
        if self.op_tx.try_send(op).is_err() {
            tracing::error!("timer op queue full or dispatcher stopped, op dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn noop() -> TimerCallback {
        Arc::new(|_| {})
    }

    #[tokio::test]
    async fn fires_at_or_after_deadline() {
        let (dispatcher, handle, mut fire_rx) = Dispatcher::new(64);
        tokio::spawn(dispatcher.run());

        let started = Instant::now();
        let end_ts = now_ms() + 30;
        let id = handle.schedule(0, end_ts, noop());

        let t = fire_rx.recv().await.expect("fire");
        assert_eq!(t.id, id);
        assert_eq!(t.end_ts, end_ts);
        assert!(started.elapsed() >= Duration::from_millis(29));
        handle.stop();
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        let (dispatcher, handle, mut fire_rx) = Dispatcher::new(64);
        tokio::spawn(dispatcher.run());

        let id = handle.schedule(0, now_ms() - 10, noop());
        let t = tokio::time::timeout(Duration::from_millis(200), fire_rx.recv())
            .await
            .expect("prompt")
            .expect("fire");
        assert_eq!(t.id, id);
        handle.stop();
    }

    #[tokio::test]
    async fn cancelled_timers_never_fire() {
        let (dispatcher, handle, mut fire_rx) = Dispatcher::new(256);
        tokio::spawn(dispatcher.run());

        let end_ts = now_ms() + TICK_MS;
        let ids: Vec<i64> = (0..100).map(|_| handle.schedule(0, end_ts, noop())).collect();
        for id in ids.iter().step_by(2) {
            handle.cancel(*id);
        }

        tokio::time::sleep(Duration::from_millis((3 * TICK_MS) as u64 + 50)).await;

        let mut fired = Vec::new();
        while let Ok(t) = fire_rx.try_recv() {
            fired.push(t.id);
        }
        fired.sort_unstable();
        let mut expected: Vec<i64> = ids.iter().skip(1).step_by(2).copied().collect();
        expected.sort_unstable();
        assert_eq!(fired, expected);
        handle.stop();
    }

    #[tokio::test]
    async fn reschedule_moves_the_deadline_up() {
        let (dispatcher, handle, mut fire_rx) = Dispatcher::new(64);
        tokio::spawn(dispatcher.run());

        let id = handle.schedule(0, now_ms() + 60_000, noop());
        handle.reschedule(id, now_ms() + 20);

        let t = tokio::time::timeout(Duration::from_millis(500), fire_rx.recv())
            .await
            .expect("rescheduled fire")
            .expect("fire");
        assert_eq!(t.id, id);
        handle.stop();
    }

    #[tokio::test]
    async fn stop_ends_the_task() {
        let (dispatcher, handle, _fire_rx) = Dispatcher::new(64);
        let join = tokio::spawn(dispatcher.run());
        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), join)
            .await
            .expect("dispatcher exits")
            .expect("no panic");
    }

    #[tokio::test]
    async fn full_fire_queue_defers_delivery() {
        // fire queue of 1: second timer must wait until the first is consumed
        let (dispatcher, handle, mut fire_rx) = Dispatcher::with_queues(64, 1);
        tokio::spawn(dispatcher.run());

        let end_ts = now_ms() + 10;
        let a = handle.schedule(0, end_ts, noop());
        let b = handle.schedule(0, end_ts, noop());

        tokio::time::sleep(Duration::from_millis(60)).await;
        let first = fire_rx.recv().await.expect("first fire");
        let second = tokio::time::timeout(Duration::from_millis(500), fire_rx.recv())
            .await
            .expect("retried on a later tick")
            .expect("fire");
        let mut got = [first.id, second.id];
        got.sort_unstable();
        let mut want = [a, b];
        want.sort_unstable();
        assert_eq!(got, want);
        handle.stop();
    }
}
