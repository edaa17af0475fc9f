/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Power-of-two timebin hierarchy for the local particle partition.
//!
//! Every particle owns a bin id (its current step size, `2^bin` ticks) and a
//! local clock (the tick it was last drifted to).  Bin membership is kept as
//! per-bin doubly linked lists threaded through particle *indices*:
//!
//! ```text
//! bin 3:  first ──► 7 ──► 2 ──► 11 ◄── last
//! bin 4:  first ──► 0 ──► 5 ◄── last
//!                   ▲
//!            next[7] = Some(2), prev[7] = None
//! ```
//!
//! # Ownership model
//! `TimeBins` owns nothing but integers.  Moving a particle between bins is an
//! O(1) relink; inserting, removing or permuting particles relocates indices
//! instead of chasing pointers, so freeing and rebuilding the lists around a
//! snapshot can never leave a dangling reference.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::math::{bin_for_step, is_synchronized, next_boundary};
use crate::clock::{Tick, NUM_TIMEBINS, TIMEBASE};

// ── Permutation ───────────────────────────────────────────────────────────────

/// A reordering of the local particles.
///
/// `source(i)` is the *old* index of the particle that ends up at index `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permutation {
    source: Vec<usize>,
}

impl Permutation {
    /// Wrap `source` as a permutation.
    ///
    /// Returns `None` unless `source` contains every index `0..len` exactly once.
    pub fn new(source: Vec<usize>) -> Option<Self> {
        let mut seen = vec![false; source.len()];
        for &s in &source {
            if s >= seen.len() || seen[s] {
                return None;
            }
            seen[s] = true;
        }
        Some(Self { source })
    }

    pub fn len(&self) -> usize {
        self.source.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source.is_empty()
    }

    /// Old index of the particle placed at `new_index`.
    pub fn source(&self, new_index: usize) -> usize {
        self.source[new_index]
    }

    /// The permutation that undoes this one.
    pub fn inverse(&self) -> Self {
        let mut inv = vec![0; self.source.len()];
        for (new, &old) in self.source.iter().enumerate() {
            inv[old] = new;
        }
        Self { source: inv }
    }

    /// Reorder `items` in place: `items[i]` becomes the old `items[source(i)]`.
    ///
    /// # Panics
    /// Panics if `items.len() != self.len()`.
    pub fn apply<T: Clone>(&self, items: &mut Vec<T>) {
        assert_eq!(items.len(), self.source.len(), "permutation length mismatch");
        let reordered: Vec<T> = self.source.iter().map(|&s| items[s].clone()).collect();
        *items = reordered;
    }
}

// ── Timestep assignment errors ────────────────────────────────────────────────

/// Why a requested timestep could not be turned into a bin.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimestepError {
    /// The requested step covers fewer than two ticks.
    #[error("timestep of particle {index} is too small ({ticks} tick(s))")]
    TooSmall { index: usize, ticks: Tick },

    /// The particle is not at a step boundary, so its bin cannot change.
    #[error("particle {index} in bin {bin} is not synchronized at tick {tick}")]
    NotSynchronized { index: usize, bin: u8, tick: Tick },
}

// ── Persisted particle record ─────────────────────────────────────────────────

/// Per-particle bookkeeping as stored in a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticleClock {
    pub bin: u8,
    pub ti_current: Tick,
}

// ── Bin lists ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct BinLists {
    first: [Option<usize>; NUM_TIMEBINS],
    last: [Option<usize>; NUM_TIMEBINS],
    count: [usize; NUM_TIMEBINS],
    next: Vec<Option<usize>>,
    prev: Vec<Option<usize>>,
}

impl BinLists {
    fn build(bins: &[u8]) -> Self {
        let mut lists = Self {
            first: [None; NUM_TIMEBINS],
            last: [None; NUM_TIMEBINS],
            count: [0; NUM_TIMEBINS],
            next: vec![None; bins.len()],
            prev: vec![None; bins.len()],
        };
        for (i, &b) in bins.iter().enumerate() {
            lists.link(i, b);
        }
        lists
    }

    /// Append particle `i` at the tail of `bin`.
    fn link(&mut self, i: usize, bin: u8) {
        let b = bin as usize;
        self.prev[i] = self.last[b];
        self.next[i] = None;
        match self.last[b] {
            Some(tail) => self.next[tail] = Some(i),
            None => self.first[b] = Some(i),
        }
        self.last[b] = Some(i);
        self.count[b] += 1;
    }

    fn unlink(&mut self, i: usize, bin: u8) {
        let b = bin as usize;
        match self.prev[i] {
            Some(p) => self.next[p] = self.next[i],
            None => self.first[b] = self.next[i],
        }
        match self.next[i] {
            Some(n) => self.prev[n] = self.prev[i],
            None => self.last[b] = self.prev[i],
        }
        self.next[i] = None;
        self.prev[i] = None;
        self.count[b] -= 1;
    }

    fn members(&self, bin: u8) -> BinMembers<'_> {
        BinMembers {
            lists: self,
            cursor: self.first[bin as usize],
        }
    }
}

/// Iterator over the particle indices of one bin, in list order.
pub struct BinMembers<'a> {
    lists: &'a BinLists,
    cursor: Option<usize>,
}

impl Iterator for BinMembers<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let i = self.cursor?;
        self.cursor = self.lists.next[i];
        Some(i)
    }
}

// ── TimeBins ──────────────────────────────────────────────────────────────────

/// Timebin arena for the particles of one rank.
#[derive(Debug, Clone)]
pub struct TimeBins {
    bin: Vec<u8>,
    clock: Vec<Tick>,
    /// `None` while the lists are freed (around snapshot I/O).
    lists: Option<BinLists>,
}

impl TimeBins {
    /// `n` particles, all in bin 0 with their clocks at tick 0.
    pub fn with_particles(n: usize) -> Self {
        let unassigned = ParticleClock {
            bin: 0,
            ti_current: 0,
        };
        Self::from_records(&vec![unassigned; n])
    }

    /// Rebuild the arena from persisted per-particle records.
    pub fn from_records(records: &[ParticleClock]) -> Self {
        let bin: Vec<u8> = records.iter().map(|r| r.bin).collect();
        let clock = records.iter().map(|r| r.ti_current).collect();
        let lists = Some(BinLists::build(&bin));
        Self { bin, clock, lists }
    }

    /// Per-particle records for a checkpoint.
    pub fn records(&self) -> Vec<ParticleClock> {
        self.bin
            .iter()
            .zip(&self.clock)
            .map(|(&bin, &ti_current)| ParticleClock { bin, ti_current })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.bin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bin.is_empty()
    }

    pub fn bin(&self, i: usize) -> u8 {
        self.bin[i]
    }

    /// Tick particle `i` was last drifted to.
    pub fn clock(&self, i: usize) -> Tick {
        self.clock[i]
    }

    pub fn set_clock(&mut self, i: usize, tick: Tick) {
        self.clock[i] = tick;
    }

    // ── list lifecycle ────────────────────────────────────────────────────────

    /// Drop the membership lists; per-particle bins and clocks are kept.
    pub fn free_lists(&mut self) {
        self.lists = None;
    }

    /// Recompute the membership lists from the per-particle bins.
    pub fn rebuild_lists(&mut self) {
        self.lists = Some(BinLists::build(&self.bin));
    }

    fn lists(&mut self) -> &BinLists {
        self.lists.get_or_insert_with(|| BinLists::build(&self.bin))
    }

    // ── particle set changes ──────────────────────────────────────────────────

    /// Append a particle; returns its index.
    pub fn push(&mut self, bin: u8, ti_current: Tick) -> usize {
        let i = self.bin.len();
        self.bin.push(bin);
        self.clock.push(ti_current);
        if let Some(lists) = self.lists.as_mut() {
            lists.next.push(None);
            lists.prev.push(None);
            lists.link(i, bin);
        }
        i
    }

    /// Remove particle `i`, moving the last particle into its slot.
    pub fn swap_remove(&mut self, i: usize) {
        let last = self.bin.len() - 1;
        if let Some(lists) = self.lists.as_mut() {
            lists.unlink(i, self.bin[i]);
            if i != last {
                lists.unlink(last, self.bin[last]);
            }
        }
        self.bin.swap_remove(i);
        self.clock.swap_remove(i);
        if let Some(lists) = self.lists.as_mut() {
            lists.next.pop();
            lists.prev.pop();
            if i != last {
                lists.link(i, self.bin[i]);
            }
        }
    }

    /// Reorder particles to follow a permutation applied by a collaborator.
    pub fn permute(&mut self, perm: &Permutation) {
        perm.apply(&mut self.bin);
        perm.apply(&mut self.clock);
        if self.lists.is_some() {
            self.rebuild_lists();
        }
    }

    /// Relocate particle `i` into `bin`.
    pub fn move_to_bin(&mut self, i: usize, bin: u8) {
        let old = self.bin[i];
        if old == bin {
            return;
        }
        if let Some(lists) = self.lists.as_mut() {
            lists.unlink(i, old);
            lists.link(i, bin);
        }
        self.bin[i] = bin;
    }

    /// Turn a requested step of `ti_step` ticks into a bin for particle `i`
    /// at `tick`, relocate the particle and return the bin.
    ///
    /// The bin is capped at `max_bin` and then lowered until a step boundary
    /// of the new bin falls on `tick`, so the particle's next boundary is
    /// always a legal synchronization point.
    ///
    /// # Errors
    /// * [`TimestepError::NotSynchronized`] – the particle is mid-step.
    /// * [`TimestepError::TooSmall`] – the step covers fewer than two ticks.
    pub fn assign_timestep(
        &mut self,
        i: usize,
        ti_step: Tick,
        tick: Tick,
        max_bin: u8,
    ) -> Result<u8, TimestepError> {
        let current = self.bin[i];
        if !is_synchronized(tick, current) {
            return Err(TimestepError::NotSynchronized {
                index: i,
                bin: current,
                tick,
            });
        }
        let mut bin = bin_for_step(ti_step)
            .ok_or(TimestepError::TooSmall {
                index: i,
                ticks: ti_step,
            })?
            .min(max_bin);
        while bin > 1 && !is_synchronized(tick, bin) {
            bin -= 1;
        }
        self.move_to_bin(i, bin);
        Ok(bin)
    }

    // ── queries ───────────────────────────────────────────────────────────────

    /// Indices of the particles in `bin`, in list order.
    pub fn members(&mut self, bin: u8) -> Vec<usize> {
        self.lists().members(bin).collect()
    }

    /// Number of particles in each bin.
    pub fn occupancy(&mut self) -> [u64; NUM_TIMEBINS] {
        let mut out = [0u64; NUM_TIMEBINS];
        for (o, &c) in out.iter_mut().zip(self.lists().count.iter()) {
            *o = c as u64;
        }
        out
    }

    /// Particles whose step ends at `tick`, ordered by bin then list position.
    pub fn active_particles(&mut self, tick: Tick) -> Vec<usize> {
        let lists = self.lists();
        (0..NUM_TIMEBINS as u8)
            .filter(|&b| is_synchronized(tick, b))
            .flat_map(|b| lists.members(b))
            .collect()
    }

    /// Earliest step boundary after `tick` over all occupied bins.
    ///
    /// Bin 0 contributes `tick` itself; an empty arena contributes `TIMEBASE`.
    pub fn next_sync_tick(&mut self, tick: Tick) -> Tick {
        let lists = self.lists();
        (0..NUM_TIMEBINS as u8)
            .filter(|&b| lists.count[b as usize] > 0)
            .map(|b| next_boundary(tick, b))
            .min()
            .unwrap_or(TIMEBASE)
    }

    /// First particle whose local clock differs from `tick`, if any.
    pub fn first_unsynchronized(&self, tick: Tick) -> Option<(usize, Tick)> {
        self.clock
            .iter()
            .enumerate()
            .find(|&(_, &c)| c != tick)
            .map(|(i, &c)| (i, c))
    }
}

// ── Occupancy helpers ─────────────────────────────────────────────────────────

/// Highest bin with a boundary at `tick` that holds at least one particle.
pub fn highest_active_bin(occupancy: &[u64; NUM_TIMEBINS], tick: Tick) -> Option<u8> {
    (0..NUM_TIMEBINS as u8)
        .rev()
        .find(|&b| occupancy[b as usize] > 0 && is_synchronized(tick, b))
}

/// Highest bin holding at least one particle.
pub fn highest_occupied_bin(occupancy: &[u64; NUM_TIMEBINS]) -> Option<u8> {
    (0..NUM_TIMEBINS as u8)
        .rev()
        .find(|&b| occupancy[b as usize] > 0)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper: arena with the given bins, all clocks at 0.
    fn arena(bins: &[u8]) -> TimeBins {
        let records: Vec<ParticleClock> = bins
            .iter()
            .map(|&bin| ParticleClock { bin, ti_current: 0 })
            .collect();
        TimeBins::from_records(&records)
    }

    // ── Permutation ───────────────────────────────────────────────────────────

    #[test]
    fn permutation_rejects_duplicates_and_out_of_range() {
        assert!(Permutation::new(vec![0, 0, 1]).is_none());
        assert!(Permutation::new(vec![0, 3]).is_none());
        assert!(Permutation::new(vec![2, 0, 1]).is_some());
    }

    #[test]
    fn inverse_restores_original_order() {
        let perm = Permutation::new(vec![2, 0, 3, 1]).unwrap();
        let mut items = vec!['a', 'b', 'c', 'd'];
        perm.apply(&mut items);
        assert_eq!(items, vec!['c', 'a', 'd', 'b']);
        perm.inverse().apply(&mut items);
        assert_eq!(items, vec!['a', 'b', 'c', 'd']);
    }

    // ── membership ────────────────────────────────────────────────────────────

    #[test]
    fn fresh_particles_start_in_bin_zero() {
        let mut tb = TimeBins::with_particles(3);
        assert_eq!(tb.members(0), vec![0, 1, 2]);
        assert_eq!(tb.occupancy()[0], 3);
    }

    #[test]
    fn move_to_bin_relinks_in_constant_time() {
        let mut tb = arena(&[3, 3, 3]);
        tb.move_to_bin(1, 5);
        assert_eq!(tb.members(3), vec![0, 2]);
        assert_eq!(tb.members(5), vec![1]);
        assert_eq!(tb.occupancy()[3], 2);
    }

    #[test]
    fn swap_remove_relocates_last_particle() {
        let mut tb = arena(&[2, 4, 2, 4]);
        tb.set_clock(3, 16);
        tb.swap_remove(1);
        assert_eq!(tb.len(), 3);
        assert_eq!(tb.bin(1), 4);
        assert_eq!(tb.clock(1), 16);
        assert_eq!(tb.members(2), vec![0, 2]);
        assert_eq!(tb.members(4), vec![1]);
    }

    #[test]
    fn swap_remove_of_last_particle() {
        let mut tb = arena(&[2, 4]);
        tb.swap_remove(1);
        assert_eq!(tb.members(4), Vec::<usize>::new());
        assert_eq!(tb.members(2), vec![0]);
    }

    #[test]
    fn push_links_into_existing_lists() {
        let mut tb = arena(&[2]);
        let i = tb.push(2, 8);
        assert_eq!(i, 1);
        assert_eq!(tb.members(2), vec![0, 1]);
    }

    #[test]
    fn permute_keeps_bins_attached_to_particles() {
        let mut tb = arena(&[1, 2, 3]);
        tb.permute(&Permutation::new(vec![2, 1, 0]).unwrap());
        assert_eq!(tb.bin(0), 3);
        assert_eq!(tb.members(1), vec![2]);
    }

    #[test]
    fn freed_lists_are_rebuilt_on_demand() {
        let mut tb = arena(&[1, 1, 2]);
        tb.free_lists();
        tb.move_to_bin(0, 2);
        assert_eq!(tb.members(2), vec![0, 2]);
        assert_eq!(tb.occupancy()[1], 1);
    }

    // ── activity / sync ───────────────────────────────────────────────────────

    #[test]
    fn active_particles_follow_boundaries() {
        let mut tb = arena(&[1, 2, 3]);
        assert_eq!(tb.active_particles(2), vec![0]);
        assert_eq!(tb.active_particles(4), vec![0, 1]);
        assert_eq!(tb.active_particles(8), vec![0, 1, 2]);
    }

    #[test]
    fn next_sync_is_minimum_over_occupied_bins() {
        let mut tb = arena(&[3, 5]);
        assert_eq!(tb.next_sync_tick(0), 8);
        assert_eq!(tb.next_sync_tick(8), 16);
        tb.move_to_bin(0, 6);
        assert_eq!(tb.next_sync_tick(0), 32);
    }

    #[test]
    fn empty_arena_syncs_at_timebase() {
        let mut tb = TimeBins::with_particles(0);
        assert_eq!(tb.next_sync_tick(0), TIMEBASE);
    }

    #[test]
    fn bin_zero_pins_the_sync_point() {
        let mut tb = arena(&[0, 4]);
        assert_eq!(tb.next_sync_tick(32), 32);
    }

    // ── assign_timestep ───────────────────────────────────────────────────────

    #[test]
    fn assign_timestep_caps_at_max_bin() {
        let mut tb = arena(&[0]);
        assert_eq!(tb.assign_timestep(0, 1 << 20, 0, 10), Ok(10));
        assert_eq!(tb.bin(0), 10);
    }

    #[test]
    fn assign_timestep_lowers_until_synchronized() {
        let mut tb = arena(&[2]);
        // tick 12 is a boundary of bin 2 but not of bins 3 or higher
        assert_eq!(tb.assign_timestep(0, 1 << 6, 12, 20), Ok(2));
    }

    #[test]
    fn assign_timestep_rejects_tiny_steps() {
        let mut tb = arena(&[0]);
        assert_eq!(
            tb.assign_timestep(0, 1, 0, 10),
            Err(TimestepError::TooSmall { index: 0, ticks: 1 })
        );
    }

    #[test]
    fn assign_timestep_rejects_particles_mid_step() {
        let mut tb = arena(&[4]);
        assert!(matches!(
            tb.assign_timestep(0, 64, 8, 10),
            Err(TimestepError::NotSynchronized { .. })
        ));
    }

    // ── occupancy helpers ─────────────────────────────────────────────────────

    #[test]
    fn highest_active_and_occupied_bins() {
        let mut tb = arena(&[1, 3, 5]);
        let occ = tb.occupancy();
        assert_eq!(highest_occupied_bin(&occ), Some(5));
        assert_eq!(highest_active_bin(&occ, 8), Some(3));
        assert_eq!(highest_active_bin(&occ, 32), Some(5));
        assert_eq!(highest_active_bin(&[0; NUM_TIMEBINS], 32), None);
    }

    #[test]
    fn first_unsynchronized_reports_offender() {
        let mut tb = arena(&[1, 1]);
        tb.set_clock(0, 4);
        tb.set_clock(1, 2);
        assert_eq!(tb.first_unsynchronized(4), Some((1, 2)));
        tb.set_clock(1, 4);
        assert_eq!(tb.first_unsynchronized(4), None);
    }
}
