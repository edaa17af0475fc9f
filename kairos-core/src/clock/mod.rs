/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The integer clock: a fixed-width discrete global timeline.
//!
//! Every process keeps time as an integer tick in `[0, TIMEBASE]`.  Ticks map
//! onto the physical time axis in one of two ways:
//!
//! | Mode | tick → time | Δ (`interval`) |
//! |------|-------------|----------------|
//! | linear | `begin + tick·Δ` | `(max − begin) / TIMEBASE` |
//! | comoving | `begin · exp(tick·Δ)` | `ln(max / begin) / TIMEBASE` |
//!
//! Converting a time back to a tick truncates, so a round trip is only exact
//! to within one tick.  That loss is inherent to the finite resolution and
//! is not an error.

pub mod math;

use std::fmt;

use serde::{Deserialize, Serialize};

// ── Constants ─────────────────────────────────────────────────────────────────

/// A point on the discrete global timeline.
pub type Tick = u64;

/// Number of power-of-two timebins (bins `0..NUM_TIMEBINS`).
pub const NUM_TIMEBINS: usize = 29;

/// Number of ticks spanning the whole run, `2^NUM_TIMEBINS`.
pub const TIMEBASE: Tick = 1 << NUM_TIMEBINS;

/// Output tick returned when no further output exists.
///
/// Lies strictly beyond the end of the timeline, so a comparison against the
/// current tick can never trigger another snapshot.
pub const NO_FURTHER_OUTPUT: Tick = 2 * TIMEBASE;

// ── Error type ────────────────────────────────────────────────────────────────

/// Errors raised while constructing or using a [`Timeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum ClockError {
    /// `time_max` is not strictly after `time_begin`.
    EmptyRange { begin: f64, max: f64 },

    /// Comoving mode needs a strictly positive scale factor to take logs of.
    NonPositiveBegin { begin: f64 },

    /// The periodic snapshot interval violates the bound for the active mode
    /// (`> 1.0` comoving, `> 0.0` linear).
    InvalidSnapshotInterval { value: f64, comoving: bool },
}

impl fmt::Display for ClockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClockError::EmptyRange { begin, max } => {
                write!(f, "time_max ({max}) must be greater than time_begin ({begin})")
            }
            ClockError::NonPositiveBegin { begin } => write!(
                f,
                "comoving integration requires time_begin > 0 (got {begin})"
            ),
            ClockError::InvalidSnapshotInterval { value, comoving } => {
                if *comoving {
                    write!(f, "time_bet_snapshot > 1.0 required for comoving runs (got {value})")
                } else {
                    write!(f, "time_bet_snapshot > 0.0 required (got {value})")
                }
            }
        }
    }
}

impl std::error::Error for ClockError {}

// ── Timeline ──────────────────────────────────────────────────────────────────

/// Mapping between integer ticks and physical (or cosmological) time.
///
/// `Timeline` is immutable and `Copy`: the current tick lives in the run
/// state, not here.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    time_begin: f64,
    time_max: f64,
    comoving: bool,
    interval: f64,
}

impl Timeline {
    /// Build the timeline for `[time_begin, time_max]`.
    ///
    /// # Errors
    /// * [`ClockError::EmptyRange`] – `time_max <= time_begin`.
    /// * [`ClockError::NonPositiveBegin`] – comoving mode with `time_begin <= 0`.
    pub fn new(time_begin: f64, time_max: f64, comoving: bool) -> Result<Self, ClockError> {
        if !(time_max > time_begin) {
            return Err(ClockError::EmptyRange {
                begin: time_begin,
                max: time_max,
            });
        }
        if comoving && time_begin <= 0.0 {
            return Err(ClockError::NonPositiveBegin { begin: time_begin });
        }

        let span = if comoving {
            (time_max / time_begin).ln()
        } else {
            time_max - time_begin
        };

        Ok(Self {
            time_begin,
            time_max,
            comoving,
            interval: span / TIMEBASE as f64,
        })
    }

    pub fn time_begin(&self) -> f64 {
        self.time_begin
    }

    pub fn time_max(&self) -> f64 {
        self.time_max
    }

    pub fn is_comoving(&self) -> bool {
        self.comoving
    }

    /// Δ: time (or `ln a`) covered by a single tick.
    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Physical time (or scale factor) at `tick`.
    pub fn time_of(&self, tick: Tick) -> f64 {
        if self.comoving {
            self.time_begin * (tick as f64 * self.interval).exp()
        } else {
            self.time_begin + tick as f64 * self.interval
        }
    }

    /// Tick at `time`, truncated toward the start of the run.
    ///
    /// Returns `None` when `time` lies outside `[time_begin, time_max]`.
    pub fn tick_of(&self, time: f64) -> Option<Tick> {
        if !(time >= self.time_begin && time <= self.time_max) {
            return None;
        }
        let ticks = if self.comoving {
            (time / self.time_begin).ln() / self.interval
        } else {
            (time - self.time_begin) / self.interval
        };
        Some((ticks as Tick).min(TIMEBASE))
    }

    /// Number of ticks covered by a step of length `dt`.
    ///
    /// `dt` is a physical time step in linear mode and a step in `ln a` in
    /// comoving mode.  Negative or non-finite steps map to zero ticks.
    pub fn ticks_for_step(&self, dt: f64) -> Tick {
        let ticks = dt / self.interval;
        if ticks.is_finite() && ticks > 0.0 {
            (ticks as Tick).min(TIMEBASE)
        } else {
            0
        }
    }

    /// Length of the step between two ticks in time units
    /// (`Δt` linear, `Δ ln a` comoving).
    pub fn step_between(&self, from: Tick, to: Tick) -> f64 {
        if self.comoving {
            (to as f64 - from as f64) * self.interval
        } else {
            self.time_of(to) - self.time_of(from)
        }
    }

    /// Check a periodic snapshot interval against the bound for this mode.
    ///
    /// # Errors
    /// [`ClockError::InvalidSnapshotInterval`] when `value <= 1.0` (comoving)
    /// or `value <= 0.0` (linear).
    pub fn check_snapshot_interval(&self, value: f64) -> Result<(), ClockError> {
        let bound = if self.comoving { 1.0 } else { 0.0 };
        if value > bound {
            Ok(())
        } else {
            Err(ClockError::InvalidSnapshotInterval {
                value,
                comoving: self.comoving,
            })
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
