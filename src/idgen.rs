//! # Process-global unique id generator.
//!
//! Produces 63-bit positive ids laid out as `[42-bit unix seconds][21-bit
//! per-second sequence]`. The generator is mutex-guarded; when a second's
//! sequence space is exhausted it waits for the stamp to advance, so ids are
//! strictly monotonic under a single generator.
//!
//! The timer dispatcher allocates its timer ids here.

use std::sync::{LazyLock, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TIME_BITS: u64 = 42;
const SEQ_BITS: u64 = 21;
const MAX_TIME: u64 = (1 << TIME_BITS) - 1;
const MAX_SEQ: u64 = (1 << SEQ_BITS) - 1;
const MAX_ID: u64 = (1 << (TIME_BITS + SEQ_BITS)) - 1;

struct GenState {
    sequence: u64,
    last_stamp: u64,
}

/// Mutex-guarded id generator.
///
/// One process-global instance backs [`next_id`]; separate instances are only
/// unique within themselves.
pub struct IdGenerator {
    state: Mutex<GenState>,
}

impl IdGenerator {
    /// Creates a generator seeded at the current second.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GenState {
                sequence: 1,
                last_stamp: unix_seconds(),
            }),
        }
    }

    /// Returns the next id.
    ///
    /// On sequence exhaustion within one second, sleeps until the wall clock
    /// advances past the last stamp.
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock().unwrap();

        if state.sequence > MAX_SEQ {
            while state.last_stamp >= unix_seconds() {
                std::thread::sleep(Duration::from_millis(1));
            }
            state.last_stamp += 1;
            state.sequence = 1;
        } else {
            state.sequence += 1;
        }

        let stamp = state.last_stamp.min(MAX_TIME);
        (((stamp << SEQ_BITS) | state.sequence) & MAX_ID) as i64
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GENERATOR: LazyLock<IdGenerator> = LazyLock::new(IdGenerator::new);

/// Returns the next id from the process-global generator.
pub fn next_id() -> i64 {
    GENERATOR.next_id()
}

/// Extracts the unix-seconds component of an id.
pub fn id_seconds(id: i64) -> u64 {
    (id as u64 >> SEQ_BITS) & MAX_TIME
}

/// Extracts the per-second sequence component of an id.
pub fn id_sequence(id: i64) -> u64 {
    id as u64 & MAX_SEQ
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_positive_and_monotonic() {
        let generator = IdGenerator::new();
        let mut prev = 0;
        for _ in 0..10_000 {
            let id = generator.next_id();
            assert!(id > 0);
            assert!(id > prev, "{id} should exceed {prev}");
            prev = id;
        }
    }

    #[test]
    fn components_round_trip() {
        let before = unix_seconds();
        let id = next_id();
        let secs = id_seconds(id);
        assert!(secs >= before && secs <= unix_seconds() + 1);
        assert!(id_sequence(id) >= 1);
    }

    #[test]
    fn global_generator_is_unique_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| std::thread::spawn(|| (0..1_000).map(|_| next_id()).collect::<Vec<_>>()))
            .collect();
        let mut all: Vec<i64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("thread"))
            .collect();
        let len = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), len);
    }
}
