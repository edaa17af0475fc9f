/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Output scheduling: when is the next snapshot due?
//!
//! Two configurations are supported:
//!
//! * **List mode** – an explicit list of `(time, kind)` entries.
//! * **Periodic mode** – a first snapshot time and a fixed interval, additive
//!   for linear runs and multiplicative (a ratio `> 1`) for comoving runs.
//!
//! Each candidate time is converted to a tick.  Unless unsynchronized output
//! is allowed, the tick is snapped to the nearest multiple of the coarsest
//! power-of-two granularity that does not exceed `max_size_timestep`.  This
//! can move a requested output by up to half a maximum timestep, which keeps
//! every output on a tick where all timebins are synchronized.
//!
//! When nothing further is due the schedule answers with
//! [`NO_FURTHER_OUTPUT`], a tick beyond the end of the timeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::clock::math::{snap_granularity, snap_to_grid};
use crate::clock::{ClockError, Tick, Timeline, NO_FURTHER_OUTPUT};

// ── Constants ─────────────────────────────────────────────────────────────────

/// Hard cap on periodic-series iterations before the search is declared
/// misconfigured.
pub const MAX_SEARCH_ITERATIONS: u32 = 1_000_000;

// ── Output kinds ──────────────────────────────────────────────────────────────

/// What the snapshot writer should produce at an output tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// A full snapshot of every particle.
    #[default]
    Full,
    /// The reduced "most bound particle" snapshot.
    MostBound,
}

impl OutputKind {
    /// Parse the integer flag used in output list files (`1` full, `2` most bound).
    pub fn from_flag(flag: i64) -> Option<Self> {
        match flag {
            1 => Some(OutputKind::Full),
            2 => Some(OutputKind::MostBound),
            _ => None,
        }
    }
}

/// One entry of an explicit output list.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OutputListEntry {
    pub time: f64,
    #[serde(default)]
    pub kind: OutputKind,
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Fatal schedule errors.  Both indicate a misconfiguration, not a transient
/// condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OutputError {
    #[error(transparent)]
    Interval(#[from] ClockError),

    /// The periodic series did not reach the target within
    /// [`MAX_SEARCH_ITERATIONS`] steps.
    #[error("cannot determine next output time: periodic search exceeded {limit} iterations (last candidate {last})")]
    SearchExhausted { limit: u32, last: f64 },
}

// ── Result of a search ────────────────────────────────────────────────────────

/// The next output tick and what to write there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextOutput {
    pub tick: Tick,
    pub kind: OutputKind,
}

impl NextOutput {
    /// The "no further output" answer.
    pub fn none() -> Self {
        Self {
            tick: NO_FURTHER_OUTPUT,
            kind: OutputKind::Full,
        }
    }

    pub fn is_none(&self) -> bool {
        self.tick == NO_FURTHER_OUTPUT
    }
}

// ── Periodic rule ─────────────────────────────────────────────────────────────

/// `first, first ⊕ interval, first ⊕ 2·interval, …` where `⊕` is `×` in
/// comoving mode and `+` otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodicRule {
    pub first: f64,
    pub interval: f64,
    pub comoving: bool,
}

impl PeriodicRule {
    fn advance(&self, time: f64) -> f64 {
        if self.comoving {
            time * self.interval
        } else {
            time + self.interval
        }
    }

    /// The candidate series starting at the first member `>= time_begin`.
    ///
    /// # Errors
    /// [`OutputError::SearchExhausted`] if reaching `time_begin` takes more
    /// than [`MAX_SEARCH_ITERATIONS`] steps.
    pub fn candidates(&self, time_begin: f64) -> Result<Candidates, OutputError> {
        let mut time = self.first;
        let mut iter = 0;
        while time < time_begin {
            time = self.advance(time);
            iter += 1;
            if iter > MAX_SEARCH_ITERATIONS {
                return Err(OutputError::SearchExhausted {
                    limit: MAX_SEARCH_ITERATIONS,
                    last: time,
                });
            }
        }
        Ok(Candidates { rule: *self, time })
    }
}

/// Unbounded iterator over candidate output times.
#[derive(Debug, Clone)]
pub struct Candidates {
    rule: PeriodicRule,
    time: f64,
}

impl Iterator for Candidates {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        let current = self.time;
        self.time = self.rule.advance(current);
        Some(current)
    }
}

// ── OutputSchedule ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Mode {
    List(Vec<OutputListEntry>),
    Periodic(PeriodicRule),
}

/// Computes output ticks for one run.
///
/// Immutable once built; the run controller keeps the cursor
/// (`ti_next_output`) in its replicated state and asks again after each
/// output.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchedule {
    timeline: Timeline,
    mode: Mode,
    /// Snap granularity in ticks; `None` when unsynchronized output is allowed.
    granularity: Option<Tick>,
}

impl OutputSchedule {
    /// Explicit list of output times.
    pub fn from_list(
        timeline: Timeline,
        entries: Vec<OutputListEntry>,
        max_size_timestep: f64,
        snap: bool,
    ) -> Self {
        Self {
            timeline,
            mode: Mode::List(entries),
            granularity: snap.then(|| Self::granularity_for(&timeline, max_size_timestep)),
        }
    }

    /// Periodic outputs from `first` every `interval`.
    ///
    /// # Errors
    /// [`OutputError::Interval`] when `interval` violates the bound for the
    /// timeline's mode (`> 1.0` comoving, `> 0.0` linear).
    pub fn periodic(
        timeline: Timeline,
        first: f64,
        interval: f64,
        max_size_timestep: f64,
        snap: bool,
    ) -> Result<Self, OutputError> {
        timeline.check_snapshot_interval(interval)?;
        Ok(Self {
            timeline,
            mode: Mode::Periodic(PeriodicRule {
                first,
                interval,
                comoving: timeline.is_comoving(),
            }),
            granularity: snap.then(|| Self::granularity_for(&timeline, max_size_timestep)),
        })
    }

    fn granularity_for(timeline: &Timeline, max_size_timestep: f64) -> Tick {
        snap_granularity(timeline.ticks_for_step(max_size_timestep))
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    /// Snap granularity in ticks, if output ticks are snapped.
    pub fn granularity(&self) -> Option<Tick> {
        self.granularity
    }

    /// Tick for `time`, snapped if configured.  `None` outside the timeline.
    fn output_tick(&self, time: f64) -> Option<Tick> {
        let tick = self.timeline.tick_of(time)?;
        Some(match self.granularity {
            Some(g) => snap_to_grid(tick, g),
            None => tick,
        })
    }

    /// Next output at or after `current`.
    ///
    /// Returns [`NextOutput::none`] (tick [`NO_FURTHER_OUTPUT`]) when no
    /// configured output remains.
    ///
    /// # Errors
    /// [`OutputError::SearchExhausted`] when the periodic series does not
    /// converge within [`MAX_SEARCH_ITERATIONS`] steps.
    pub fn next_output_time(&self, current: Tick) -> Result<NextOutput, OutputError> {
        let found = match &self.mode {
            Mode::List(entries) => self.next_from_list(entries, current),
            Mode::Periodic(rule) => self.next_from_rule(rule, current)?,
        };

        match found {
            Some(next) => {
                info!(
                    time_next = self.timeline.time_of(next.tick),
                    tick = next.tick,
                    kind = ?next.kind,
                    "Setting next time for snapshot file"
                );
                Ok(next)
            }
            None => {
                warn!("There is no valid time for a further snapshot file");
                Ok(NextOutput::none())
            }
        }
    }

    fn next_from_list(&self, entries: &[OutputListEntry], current: Tick) -> Option<NextOutput> {
        let mut best: Option<NextOutput> = None;
        for entry in entries {
            let Some(tick) = self.output_tick(entry.time) else {
                warn!(time = entry.time, "output list entry outside the timeline, ignored");
                continue;
            };
            if tick < current {
                continue;
            }
            // strict comparison keeps the first configured entry on ties
            if best.map_or(true, |b| tick < b.tick) {
                best = Some(NextOutput {
                    tick,
                    kind: entry.kind,
                });
            }
        }
        best
    }

    fn next_from_rule(
        &self,
        rule: &PeriodicRule,
        current: Tick,
    ) -> Result<Option<NextOutput>, OutputError> {
        let time_max = self.timeline.time_max();
        let mut iter = 0;
        for time in rule.candidates(self.timeline.time_begin())? {
            if time > time_max {
                return Ok(None);
            }
            if let Some(tick) = self.output_tick(time) {
                if tick >= current {
                    return Ok(Some(NextOutput {
                        tick,
                        kind: OutputKind::Full,
                    }));
                }
            }
            iter += 1;
            if iter > MAX_SEARCH_ITERATIONS {
                return Err(OutputError::SearchExhausted {
                    limit: MAX_SEARCH_ITERATIONS,
                    last: time,
                });
            }
        }
        Ok(None)
    }

    /// All remaining output ticks from `current`, in order.
    ///
    /// Used by the `kairos` inspector; stops at the first
    /// [`NO_FURTHER_OUTPUT`] or after `limit` entries.
    pub fn upcoming(&self, mut current: Tick, limit: usize) -> Result<Vec<NextOutput>, OutputError> {
        let mut out = Vec::new();
        while out.len() < limit {
            let next = self.next_output_time(current)?;
            if next.is_none() {
                break;
            }
            out.push(next);
            current = next.tick + 1;
        }
        if out.len() == limit {
            warn!(limit, "output listing truncated");
        }
        Ok(out)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TIMEBASE;

    fn linear() -> Timeline {
        Timeline::new(0.0, 1.0, false).unwrap()
    }

    fn entry(time: f64, kind: OutputKind) -> OutputListEntry {
        OutputListEntry { time, kind }
    }

    /// Walk the schedule from tick 0 the way the run controller does.
    fn realize(schedule: &OutputSchedule) -> Vec<Tick> {
        schedule
            .upcoming(0, 10_000)
            .unwrap()
            .into_iter()
            .map(|n| n.tick)
            .collect()
    }

    // ── OutputKind ────────────────────────────────────────────────────────────

    #[test]
    fn output_kind_flags() {
        assert_eq!(OutputKind::from_flag(1), Some(OutputKind::Full));
        assert_eq!(OutputKind::from_flag(2), Some(OutputKind::MostBound));
        assert_eq!(OutputKind::from_flag(0), None);
    }

    // ── periodic mode ─────────────────────────────────────────────────────────

    #[test]
    fn periodic_linear_hits_every_tenth_within_one_grid_unit() {
        let sched = OutputSchedule::periodic(linear(), 0.1, 0.1, 0.01, true).unwrap();
        let g = sched.granularity().unwrap();
        assert_eq!(g, 1 << 22);

        let ticks = realize(&sched);
        assert_eq!(ticks.len(), 10);
        for (k, &tick) in ticks.iter().enumerate() {
            let wanted = (k as f64 + 1.0) * 0.1 * TIMEBASE as f64;
            assert!(
                (tick as f64 - wanted).abs() <= g as f64,
                "output {k} at tick {tick}, wanted ~{wanted}"
            );
            assert_eq!(tick % g, 0);
        }
        assert_eq!(*ticks.last().unwrap(), TIMEBASE);
    }

    #[test]
    fn periodic_unsnapped_is_exact_to_one_tick() {
        let sched = OutputSchedule::periodic(linear(), 0.25, 0.25, 0.01, false).unwrap();
        assert_eq!(sched.granularity(), None);
        assert_eq!(
            realize(&sched),
            vec![TIMEBASE / 4, TIMEBASE / 2, 3 * TIMEBASE / 4, TIMEBASE]
        );
    }

    #[test]
    fn periodic_comoving_is_geometric() {
        let tl = Timeline::new(0.1, 1.0, true).unwrap();
        let rule = PeriodicRule {
            first: 0.1,
            interval: 1.1,
            comoving: true,
        };
        let got: Vec<f64> = rule.candidates(tl.time_begin()).unwrap().take(3).collect();
        for (g, want) in got.iter().zip([0.1, 0.11, 0.121]) {
            assert!((g - want).abs() < 1e-12, "{g} != {want}");
        }
    }

    #[test]
    fn periodic_comoving_rejects_ratio_not_above_one() {
        let tl = Timeline::new(0.1, 1.0, true).unwrap();
        let err = OutputSchedule::periodic(tl, 0.1, 1.0, 0.01, true).unwrap_err();
        assert!(matches!(
            err,
            OutputError::Interval(ClockError::InvalidSnapshotInterval { .. })
        ));
    }

    #[test]
    fn periodic_linear_rejects_non_positive_interval() {
        assert!(OutputSchedule::periodic(linear(), 0.1, 0.0, 0.01, true).is_err());
        assert!(OutputSchedule::periodic(linear(), 0.1, -0.5, 0.01, true).is_err());
    }

    #[test]
    fn periodic_first_snapshot_before_begin_is_advanced() {
        let tl = Timeline::new(1.0, 2.0, false).unwrap();
        let sched = OutputSchedule::periodic(tl, 0.0, 0.5, 0.5, false).unwrap();
        let next = sched.next_output_time(0).unwrap();
        assert_eq!(next.tick, 0);
        let next = sched.next_output_time(1).unwrap();
        assert_eq!(next.tick, TIMEBASE / 2);
    }

    #[test]
    fn periodic_search_is_capped() {
        // comoving series that starts at zero never grows
        let tl = Timeline::new(0.1, 1.0, true).unwrap();
        let sched = OutputSchedule::periodic(tl, 0.0, 2.0, 0.01, true).unwrap();
        assert!(matches!(
            sched.next_output_time(0),
            Err(OutputError::SearchExhausted { .. })
        ));
    }

    #[test]
    fn periodic_beyond_time_max_returns_sentinel() {
        let sched = OutputSchedule::periodic(linear(), 2.0, 0.1, 0.01, true).unwrap();
        let next = sched.next_output_time(0).unwrap();
        assert!(next.is_none());
        assert_eq!(next.tick, NO_FURTHER_OUTPUT);
    }

    // ── list mode ─────────────────────────────────────────────────────────────

    #[test]
    fn list_picks_smallest_tick_not_before_current() {
        let entries = vec![
            entry(0.75, OutputKind::Full),
            entry(0.25, OutputKind::MostBound),
            entry(0.5, OutputKind::Full),
        ];
        let sched = OutputSchedule::from_list(linear(), entries, 0.01, false);
        let next = sched.next_output_time(0).unwrap();
        assert_eq!(next.tick, TIMEBASE / 4);
        assert_eq!(next.kind, OutputKind::MostBound);
        let next = sched.next_output_time(TIMEBASE / 4 + 1).unwrap();
        assert_eq!(next.tick, TIMEBASE / 2);
    }

    #[test]
    fn list_ties_prefer_first_configured_entry() {
        // both entries snap onto the same grid point
        let entries = vec![
            entry(0.500_001, OutputKind::MostBound),
            entry(0.5, OutputKind::Full),
        ];
        let sched = OutputSchedule::from_list(linear(), entries, 0.01, true);
        let next = sched.next_output_time(0).unwrap();
        assert_eq!(next.tick, TIMEBASE / 2);
        assert_eq!(next.kind, OutputKind::MostBound);
    }

    #[test]
    fn list_discards_entries_outside_the_timeline() {
        let entries = vec![entry(-1.0, OutputKind::Full), entry(3.0, OutputKind::Full)];
        let sched = OutputSchedule::from_list(linear(), entries, 0.01, true);
        assert!(sched.next_output_time(0).unwrap().is_none());
    }

    #[test]
    fn empty_list_returns_sentinel() {
        let sched = OutputSchedule::from_list(linear(), Vec::new(), 0.01, true);
        assert_eq!(sched.next_output_time(0).unwrap().tick, NO_FURTHER_OUTPUT);
    }

    /// Log sink shared with a test subscriber.
    #[derive(Clone, Default)]
    struct Captured(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn discarded_entries_and_sentinel_are_warnings() {
        let sink = Captured::default();
        let writer = sink.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();

        let sched = OutputSchedule::from_list(linear(), vec![entry(3.0, OutputKind::Full)], 0.01, true);
        tracing::subscriber::with_default(subscriber, || {
            assert!(sched.next_output_time(0).unwrap().is_none());
        });

        let logged = String::from_utf8(sink.0.lock().unwrap().clone()).unwrap();
        let warnings: Vec<&str> = logged.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(warnings.len(), 2, "{logged}");
        assert!(warnings[0].contains("outside the timeline"));
        assert!(warnings[1].contains("no valid time for a further snapshot"));
    }

    // ── properties ────────────────────────────────────────────────────────────

    #[test]
    fn next_output_is_never_before_current() {
        let schedules = [
            OutputSchedule::periodic(linear(), 0.05, 0.07, 0.02, true).unwrap(),
            OutputSchedule::from_list(
                linear(),
                vec![entry(0.9, OutputKind::Full), entry(0.3, OutputKind::Full)],
                0.02,
                true,
            ),
        ];
        for sched in &schedules {
            let mut last = 0;
            for current in (0..=TIMEBASE).step_by((TIMEBASE / 53) as usize) {
                let next = sched.next_output_time(current).unwrap();
                assert!(next.tick >= current || next.is_none());
                assert!(next.tick >= last, "sequence went backwards at {current}");
                last = next.tick;
            }
        }
    }

    #[test]
    fn snapped_outputs_are_grid_aligned() {
        let sched = OutputSchedule::periodic(linear(), 0.0, 0.013, 0.004, true).unwrap();
        let g = sched.granularity().unwrap();
        for tick in realize(&sched) {
            assert_eq!(tick % g, 0);
        }
    }
}
