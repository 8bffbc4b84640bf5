//! Op-counter score encoding
//!
//! Sorted-set scores are 52-bit-safe integers laid out as
//!
//! ```text
//! explicit score:  [ seconds : 31 ][ hash32(value) mod 2^20 : 20 ]
//! wall clock:      [ seconds : 32 ][ millis : 10 ][ counter : 10 ]
//! ```
//!
//! so both kinds sort together by their seconds part and stay exactly
//! representable as `f64`.

use crate::clock::{SharedClock, SystemClock};
use parking_lot::Mutex;
use std::sync::Arc;
use xxhash_rust::xxh32::xxh32;

/// Exclusive upper limit for a client-supplied score
pub const MAX_EXPLICIT_SCORE: i64 = 1 << 31;

const LOW_BITS: u32 = 20;
const LOW_MASK: u64 = (1 << LOW_BITS) - 1;
const MILLIS_SHIFT: u32 = 10;
const COUNTER_MODULUS: u16 = 1024;

/// Stable 32-bit hash of a string (xxHash32, seed 0)
#[inline]
pub fn hash32(value: &str) -> u32 {
    xxh32(value.as_bytes(), 0)
}

/// True when `score` may be used verbatim in the high bits
#[inline]
pub fn is_valid_score(score: i64) -> bool {
    score > 0 && score < MAX_EXPLICIT_SCORE
}

#[derive(Debug, Default)]
struct CounterState {
    counter: u16,
    last_issued: u64,
}

/// Produces monotonic sort keys for set members
///
/// One instance is shared by every worker of a process; the rotating
/// tie-break counter is instance state, so separate instances (or processes)
/// only order relative to each other by wall clock.
pub struct ScoreEncoder {
    clock: SharedClock,
    state: Mutex<CounterState>,
}

impl Default for ScoreEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ScoreEncoder {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        ScoreEncoder {
            clock,
            state: Mutex::new(CounterState::default()),
        }
    }

    /// Encode a sort key.
    ///
    /// A valid explicit score (`1 <= s < 2^31`) is combined with the value's
    /// hash and is idempotent for the same `(score, value)`. Anything else,
    /// including `0`, falls back to the wall clock plus the rotating counter.
    pub fn encode(&self, explicit_score: Option<i64>, value: Option<&str>) -> u64 {
        match explicit_score {
            Some(score) if is_valid_score(score) => {
                let low = value.map(|v| u64::from(hash32(v)) & LOW_MASK).unwrap_or(0);
                ((score as u64) << LOW_BITS) | low
            }
            _ => self.next_counter(),
        }
    }

    /// Lower edge of the score range belonging to `score` seconds.
    /// Used for query bounds; never advances the counter.
    pub fn boundary(score: i64) -> u64 {
        (score.clamp(0, MAX_EXPLICIT_SCORE) as u64) << LOW_BITS
    }

    /// Seconds part of an encoded score
    pub fn seconds_of(encoded: u64) -> u64 {
        encoded >> LOW_BITS
    }

    fn next_counter(&self) -> u64 {
        let now_ms = self.clock.now_millis();
        let secs = now_ms / 1000;
        let millis = now_ms % 1000;

        let mut state = self.state.lock();
        state.counter = (state.counter + 1) % COUNTER_MODULUS;
        let candidate =
            (secs << LOW_BITS) | (millis << MILLIS_SHIFT) | u64::from(state.counter);

        // Clock stepped back, or the counter wrapped within one millisecond
        let issued = if candidate > state.last_issued {
            candidate
        } else {
            state.last_issued + 1
        };
        state.last_issued = issued;
        issued
    }
}
