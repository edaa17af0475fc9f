/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Physics, domain and I/O collaborators driven by the run controller.
//!
//! The controller owns the clock, the timebins and the output cursor; every
//! piece of actual physics is delegated through these traits.  All methods
//! return [`anyhow::Result`]: the controller only needs to know *that* a
//! collaborator failed, and wraps the error with the phase it failed in.
//!
//! Collaborators that reorder or create particles (domain exchange, star
//! formation) receive the [`TimeBins`] arena and must keep it in step with
//! their own particle storage.

use anyhow::Result;

use crate::clock::{Tick, Timeline};
use crate::output::OutputKind;
use crate::timebins::{Permutation, TimeBins};

/// Read-only view of the global clock handed to every collaborator call.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub timeline: &'a Timeline,
    pub ti_current: Tick,
    /// Physical time (or scale factor) at `ti_current`.
    pub time: f64,
    pub step: u64,
    /// Coarsest bin active at `ti_current`, if any particle is active.
    pub highest_active_bin: Option<u8>,
}

/// Particle dynamics.
pub trait ForceSolver {
    /// Advance particle `index` from its local clock `from` to `to`.
    fn drift_particle(&mut self, index: usize, from: Tick, to: Tick, timeline: &Timeline) -> Result<()>;

    /// New timestep for active particle `index`, in time units of the
    /// timeline (physical `dt`, or `Δ ln a` when comoving).
    fn timestep(&mut self, index: usize, ctx: &StepContext<'_>) -> Result<f64>;

    fn do_gravity_step_first_half(&mut self, active: &[usize], ctx: &StepContext<'_>) -> Result<()>;

    fn do_gravity_step_second_half(&mut self, active: &[usize], ctx: &StepContext<'_>) -> Result<()>;

    fn update_maxhsml(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn compute_densities(&mut self, _active: &[usize], _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn do_hydro_step_first_half(&mut self, _active: &[usize], _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn do_hydro_step_second_half(&mut self, _active: &[usize], _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn update_velocities(&mut self, _active: &[usize], _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Cooling, star formation and the like.  May add or remove particles
    /// through `bins`.
    fn end_of_step_physics(&mut self, _bins: &mut TimeBins, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Global energy bookkeeping, called every `time_bet_statistics`.
    fn energy_statistics(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }
}

/// Spatial decomposition and the gravity tree.
pub trait DomainManager {
    /// Redistribute particles between ranks.  Particles that leave or arrive
    /// must be removed from or pushed into `bins`.
    fn domain_decomposition(&mut self, bins: &mut TimeBins, ctx: &StepContext<'_>) -> Result<()>;

    fn domain_free(&mut self) -> Result<()>;

    fn treebuild(&mut self, ctx: &StepContext<'_>) -> Result<()>;

    fn treefree(&mut self) -> Result<()>;
}

/// Snapshots, restart files and output-time group finding.
pub trait SnapshotIo {
    /// Write snapshot number `seq`.
    fn write_snapshot(&mut self, seq: u32, kind: OutputKind, ctx: &StepContext<'_>) -> Result<()>;

    /// Persist the collaborator's own state next to the controller checkpoint.
    fn write_restart(&mut self, ctx: &StepContext<'_>) -> Result<()>;

    /// Reload the state written by [`write_restart`](Self::write_restart).
    fn read_restart(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run group finding before a snapshot.  A returned permutation has
    /// already been applied to the collaborator's particle storage.
    fn find_groups(&mut self, _ctx: &StepContext<'_>) -> Result<Option<Permutation>> {
        Ok(None)
    }

    /// Apply `perm` to the particle storage; used with the inverse of the
    /// grouping permutation to restore the original order.
    fn restore_order(&mut self, _perm: &Permutation) -> Result<()> {
        Ok(())
    }
}

/// Everything the run controller needs from the simulation.
pub trait Simulation: ForceSolver + DomainManager + SnapshotIo {}

impl<T: ForceSolver + DomainManager + SnapshotIo> Simulation for T {}
