/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Pure integer arithmetic on the power-of-two timeline.
//!
//! These are free functions rather than methods so they can be used and tested
//! independently of [`Timeline`](super::Timeline) and the timebin arena.

use super::{Tick, NUM_TIMEBINS, TIMEBASE};

/// Length in ticks of one step in `bin`.
///
/// Bin 0 is the zero-length step (always active), so this returns `0` for it.
pub fn step_of_bin(bin: u8) -> Tick {
    if bin == 0 {
        0
    } else {
        1 << bin
    }
}

/// Returns `true` if a step boundary of `bin` falls on `tick`.
///
/// Bin 0 is synchronized with every tick.
pub fn is_synchronized(tick: Tick, bin: u8) -> bool {
    bin == 0 || tick % step_of_bin(bin) == 0
}

/// The first step boundary of `bin` strictly after `tick`.
///
/// For bin 0 this is `tick` itself: a zero-length step never advances.
pub fn next_boundary(tick: Tick, bin: u8) -> Tick {
    if bin == 0 {
        return tick;
    }
    let dti = step_of_bin(bin);
    (tick / dti) * dti + dti
}

/// Highest bin whose step length does not exceed `ti_step`
/// (`floor(log2(ti_step))`).
///
/// Returns `None` for steps of fewer than two ticks: a one-tick step cannot be
/// represented and a zero step never advances the particle.
pub fn bin_for_step(ti_step: Tick) -> Option<u8> {
    if ti_step < 2 {
        return None;
    }
    Some((Tick::BITS - 1 - ti_step.leading_zeros()) as u8)
}

/// Coarsest power-of-two tick granularity not exceeding `max_ticks`.
///
/// Starts at `TIMEBASE` and halves until the value fits.  Never returns less
/// than one tick, so a degenerate `max_ticks == 0` snaps to the raw tick grid.
pub fn snap_granularity(max_ticks: Tick) -> Tick {
    let mut ti_min = TIMEBASE;
    while ti_min > max_ticks && ti_min > 1 {
        ti_min >>= 1;
    }
    ti_min
}

/// Round `tick` to the nearest multiple of `granularity` (halfway rounds up).
///
/// Idempotent: a tick already on the grid is returned unchanged.
pub fn snap_to_grid(tick: Tick, granularity: Tick) -> Tick {
    if granularity <= 1 {
        return tick;
    }
    ((tick + granularity / 2) / granularity) * granularity
}

/// Bin index matching a snap granularity, capped to the highest usable bin.
pub fn bin_of_granularity(granularity: Tick) -> u8 {
    let bin = bin_for_step(granularity).unwrap_or(1);
    bin.min((NUM_TIMEBINS - 1) as u8)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
