//! Clock normalization and per-move think-time allocation.

use std::time::Duration;

use shakmaty::Color;

use crate::config::TimeConfig;

/// Think time when less than a second is left on the clock.
const PANIC_THINK_SECS: f64 = 0.02;
/// Think time when less than three seconds are left.
const LOW_TIME_THINK_SECS: f64 = 0.05;

/// Moves-to-go tiers: (remaining-time lower bound, moves to go). A tier applies
/// when remaining time is strictly above its bound.
const MTG_TIERS: [(f64, f64); 3] = [(0.0, 30.0), (180.0, 35.0), (600.0, 40.0)];
/// Past this fullmove number fewer moves are expected to remain.
const LATE_GAME_FULLMOVE: u32 = 60;
const LATE_GAME_MTG_REDUCTION: f64 = 10.0;
const MIN_MTG: f64 = 15.0;

/// Below this many seconds a single move may use at most `remaining / 45`.
const LOW_TIME_CAP_SECS: f64 = 10.0;
const LOW_TIME_CAP_DIVISOR: f64 = 45.0;
/// No single move may use more than this share of the remaining time.
const MAX_SHARE_PER_MOVE: f64 = 0.15;

/// A clock reading as reported by a platform.
///
/// Platforms that declare their unit keep it; values without a declared unit
/// follow the "greater than 1000 means milliseconds" convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockValue {
    Millis(u64),
    Seconds(f64),
    Untyped(f64),
}

impl ClockValue {
    pub fn as_secs_f64(self) -> f64 {
        match self {
            ClockValue::Millis(ms) => ms as f64 / 1000.0,
            ClockValue::Seconds(s) => s.max(0.0),
            ClockValue::Untyped(v) => normalize_seconds(v),
        }
    }
}

/// Interprets a raw clock number of unknown unit as seconds.
pub fn normalize_seconds(raw: f64) -> f64 {
    if !raw.is_finite() || raw <= 0.0 {
        0.0
    } else if raw > 1000.0 {
        raw / 1000.0
    } else {
        raw
    }
}

/// Remaining time and increment for both sides, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ClockState {
    pub white_time: f64,
    pub black_time: f64,
    pub white_inc: f64,
    pub black_inc: f64,
}

impl ClockState {
    pub fn new(wtime: ClockValue, btime: ClockValue, winc: ClockValue, binc: ClockValue) -> Self {
        Self {
            white_time: wtime.as_secs_f64(),
            black_time: btime.as_secs_f64(),
            white_inc: winc.as_secs_f64(),
            black_inc: binc.as_secs_f64(),
        }
    }

    pub fn remaining(&self, side: Color) -> f64 {
        match side {
            Color::White => self.white_time,
            Color::Black => self.black_time,
        }
    }

    pub fn increment(&self, side: Color) -> f64 {
        match side {
            Color::White => self.white_inc,
            Color::Black => self.black_inc,
        }
    }
}

/// Maps a clock reading to a think-time allocation.
#[derive(Debug, Clone, Copy)]
pub struct TimeBudget {
    pub latency_buffer: f64,
    pub min_think_time: f64,
    pub increment_weight: f64,
}

impl Default for TimeBudget {
    fn default() -> Self {
        Self::from(&TimeConfig::default())
    }
}

impl From<&TimeConfig> for TimeBudget {
    fn from(cfg: &TimeConfig) -> Self {
        Self {
            latency_buffer: cfg.latency_buffer.max(0.0),
            min_think_time: cfg.min_think_time.max(0.0),
            increment_weight: cfg.increment_weight.max(0.0),
        }
    }
}

impl TimeBudget {
    /// Think time in seconds.
    ///
    /// The result is strictly below `remaining` for any positive input, at
    /// least `min_think_time` once a second or more is left (as long as the
    /// configured minimum stays below that), and non-decreasing in `remaining`
    /// for fixed increment, fullmove number and legal move count.
    pub fn allocate(
        &self,
        remaining: f64,
        increment: f64,
        fullmove: u32,
        legal_moves: usize,
    ) -> f64 {
        let remaining = remaining.max(0.0);
        let increment = increment.max(0.0);
        let half = remaining / 2.0;

        if remaining < 1.0 {
            return PANIC_THINK_SECS.min(half);
        }
        if remaining < 3.0 {
            return LOW_TIME_THINK_SECS.max(self.min_think_time).min(half);
        }

        let late = fullmove > LATE_GAME_FULLMOVE;
        let base = per_move_slice(remaining, late) + increment * self.increment_weight;
        let mut target = base * complexity_factor(legal_moves);

        let min_think = if remaining < LOW_TIME_CAP_SECS {
            target = target.min(remaining / LOW_TIME_CAP_DIVISOR);
            self.min_think_time
        } else if remaining > 30.0 {
            0.3_f64.max(self.min_think_time)
        } else {
            0.1_f64.max(self.min_think_time)
        };

        let capped = target.min(remaining * MAX_SHARE_PER_MOVE).max(min_think);
        (capped - self.latency_buffer).max(self.min_think_time).min(half)
    }

    pub fn allocate_duration(
        &self,
        clock: &ClockState,
        side: Color,
        fullmove: u32,
        legal_moves: usize,
    ) -> Duration {
        let secs = self.allocate(
            clock.remaining(side),
            clock.increment(side),
            fullmove,
            legal_moves,
        );
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// `remaining / moves_to_go`, carried over tier boundaries so that moving into
/// a longer tier never shrinks the slice.
fn per_move_slice(remaining: f64, late: bool) -> f64 {
    let mut slice = 0.0_f64;
    for (i, &(lower, mtg)) in MTG_TIERS.iter().enumerate() {
        if remaining <= lower && i > 0 {
            break;
        }
        let upper = MTG_TIERS.get(i + 1).map_or(f64::INFINITY, |&(next, _)| next);
        let mtg = if late {
            (mtg - LATE_GAME_MTG_REDUCTION).max(MIN_MTG)
        } else {
            mtg
        };
        slice = slice.max(remaining.min(upper) / mtg);
    }
    slice
}

fn complexity_factor(legal_moves: usize) -> f64 {
    if legal_moves > 40 {
        1.3
    } else if legal_moves < 15 {
        0.7
    } else {
        1.0
    }
}
