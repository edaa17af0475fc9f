/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The run controller: one rank's side of the lockstep main loop.
//!
//! [`RunController`] owns the integer clock, the local [`TimeBins`], the
//! output cursor and the interruption protocol, and drives a [`Simulation`]
//! through a fixed cycle of phases:
//!
//! ```text
//!   ┌─► Sync ─► DomainRebuild ─► DensityUpdate ─► SecondHalfKick
//!   │                                                  │
//!   │   EndOfStepPhysics ◄─────────────────────────────┘
//!   │          │
//!   │          ▼
//!   │   StatsFlush ─► SnapshotCheck ─► TerminationCheck ──► Completed
//!   │                                        │
//!   │                                        ▼
//!   └── InterruptCheck ◄─ CpuLog ◄─ FirstHalfKick
//!             │
//!             └──► Interrupted(decision)
//! ```
//!
//! A fresh run starts at tick 0 with every particle in bin 0 and enters the
//! cycle at `DomainRebuild`, so the initial forces, an output at the start
//! time and the first timesteps all come from the regular phases.  A resumed
//! run enters at `Sync`.  Both force a domain rebuild on their first pass.
//!
//! # Lockstep
//!
//! | Decision | How every rank agrees |
//! |---|---|
//! | next sync tick | `all_min` over local next boundaries |
//! | domain rebuild | derived from the `all_sum` occupancy |
//! | snapshot / termination | derived from the replicated [`RunState`] |
//! | interruption, periodic checkpoint | rank 0 decides, `broadcast` |
//!
//! Any [`RunError`] aborts the whole group before it is returned.

pub mod checkpoint;
pub mod cpu_log;
pub mod error;
pub mod events;

pub use checkpoint::{Checkpoint, RunState};
pub use error::RunError;

use std::time::Instant;

use tracing::{debug, error, info};

use crate::clock::math::is_synchronized;
use crate::clock::{Tick, Timeline, NUM_TIMEBINS, TIMEBASE};
use crate::collab::{Simulation, StepContext};
use crate::comm::Communicator;
use crate::config::{DomainRebuildRule, RunParams};
use crate::interrupt::{clear_continuation_marker, Decision, InterruptController, InterruptPolicy};
use crate::output::{OutputKind, OutputSchedule};
use crate::timebins::{highest_active_bin, highest_occupied_bin, TimeBins};

use checkpoint::checkpoint_path;
use cpu_log::CpuLog;
use events::{Event, EventKind, EventQueue};

// ── Phases ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Sync,
    DomainRebuild,
    DensityUpdate,
    SecondHalfKick,
    EndOfStepPhysics,
    StatsFlush,
    SnapshotCheck,
    TerminationCheck,
    FirstHalfKick,
    CpuLog,
    InterruptCheck,
}

impl Phase {
    pub const COUNT: usize = 11;

    /// Every phase in loop order.
    pub const ALL: [Phase; Phase::COUNT] = [
        Phase::Sync,
        Phase::DomainRebuild,
        Phase::DensityUpdate,
        Phase::SecondHalfKick,
        Phase::EndOfStepPhysics,
        Phase::StatsFlush,
        Phase::SnapshotCheck,
        Phase::TerminationCheck,
        Phase::FirstHalfKick,
        Phase::CpuLog,
        Phase::InterruptCheck,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn successor(self) -> Phase {
        Phase::ALL[(self.index() + 1) % Phase::COUNT]
    }

    pub fn name(self) -> &'static str {
        match self {
            Phase::Sync => "sync",
            Phase::DomainRebuild => "domain_rebuild",
            Phase::DensityUpdate => "density_update",
            Phase::SecondHalfKick => "second_half_kick",
            Phase::EndOfStepPhysics => "end_of_step_physics",
            Phase::StatsFlush => "stats_flush",
            Phase::SnapshotCheck => "snapshot_check",
            Phase::TerminationCheck => "termination_check",
            Phase::FirstHalfKick => "first_half_kick",
            Phase::CpuLog => "cpu_log",
            Phase::InterruptCheck => "interrupt_check",
        }
    }
}

/// How a call to [`RunController::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The end of the timeline was reached.
    Completed,
    /// The group stopped on a marker file or the CPU budget; a checkpoint
    /// has been written.
    Interrupted(Decision),
}

enum Flow {
    Next,
    Finished(RunOutcome),
}

/// First bin whose cumulative population (bins `0..=b`) exceeds `fraction`
/// of all particles.  A step whose coarsest active bin reaches this bin is
/// large enough to be worth a domain rebuild.
pub fn rebuild_threshold_bin(occupancy: &[u64; NUM_TIMEBINS], fraction: f64) -> u8 {
    let total: u64 = occupancy.iter().sum();
    let limit = fraction * total as f64;
    let mut cumulative = 0u64;
    for (bin, &count) in occupancy.iter().enumerate() {
        cumulative += count;
        if cumulative as f64 > limit {
            return bin as u8;
        }
    }
    (NUM_TIMEBINS - 1) as u8
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn context<'a>(timeline: &'a Timeline, state: &RunState, highest_active_bin: Option<u8>) -> StepContext<'a> {
    StepContext {
        timeline,
        ti_current: state.ti_current,
        time: timeline.time_of(state.ti_current),
        step: state.step,
        highest_active_bin,
    }
}

/// Move particle `i` forward to `to` unless it is already there.
fn drift_to<S: Simulation>(
    sim: &mut S,
    bins: &mut TimeBins,
    timeline: &Timeline,
    i: usize,
    to: Tick,
) -> anyhow::Result<()> {
    let from = bins.clock(i);
    if from < to {
        sim.drift_particle(i, from, to, timeline)?;
        bins.set_clock(i, to);
    }
    Ok(())
}

/// Abort the group on any fatal error before handing it back.
fn escalate<C: Communicator, T>(comm: &C, result: Result<T, RunError>) -> Result<T, RunError> {
    if let Err(e) = &result {
        error!(rank = comm.rank(), error = %e, "fatal error in run loop");
        comm.abort(&e.to_string());
    }
    result
}

fn io_error(what: &'static str) -> impl FnOnce(std::io::Error) -> RunError {
    move |source| RunError::Io { what, source }
}

/// Everything that differs between a fresh start and a resume.
struct Start {
    timeline: Timeline,
    schedule: OutputSchedule,
    bins: TimeBins,
    state: RunState,
    entry: Phase,
    resumed: bool,
}

// ── RunController ─────────────────────────────────────────────────────────────

pub struct RunController<S, C> {
    sim: S,
    comm: C,
    params: RunParams,
    timeline: Timeline,
    schedule: OutputSchedule,
    max_bin: u8,
    bins: TimeBins,
    state: RunState,
    interrupt: InterruptController,
    cpu: CpuLog,
    events: EventQueue,
    entry: Phase,
    force_rebuild: bool,
    /// Global particle count per bin at the current sync point.
    occupancy: [u64; NUM_TIMEBINS],
    highest_active: Option<u8>,
    /// Local indices of the particles active at the current sync point.
    active: Vec<usize>,
}

impl<S: Simulation, C: Communicator> RunController<S, C> {
    /// Start a new run with `particles` local particles, all unassigned.
    pub fn fresh(params: RunParams, sim: S, comm: C, particles: usize) -> Result<Self, RunError> {
        let start = escalate(&comm, Self::prepare_fresh(&params, &comm, particles))?;
        Self::assemble(params, sim, comm, start)
    }

    /// Continue a run from this rank's checkpoint in `params.output_dir`.
    pub fn resume(params: RunParams, mut sim: S, comm: C) -> Result<Self, RunError> {
        let prepared = Self::prepare_resume(&params, &mut sim, &comm);
        let start = escalate(&comm, prepared)?;
        Self::assemble(params, sim, comm, start)
    }

    fn prepare_fresh(params: &RunParams, comm: &C, particles: usize) -> Result<Start, RunError> {
        let timeline = params.timeline()?;
        let schedule = params.output_schedule()?;
        if comm.is_root() {
            clear_continuation_marker(&params.output_dir)
                .map_err(io_error("removing continuation marker"))?;
        }
        let first = schedule.next_output_time(0)?;
        let state = RunState {
            ti_current: 0,
            ti_old: 0,
            ti_next_output: first.tick,
            next_output_kind: first.kind,
            ti_last_output: None,
            snapshot_count: 0,
            step: 0,
            // statistics are due on the very first pass
            time_last_statistics: timeline.time_begin() - params.time_bet_statistics.unwrap_or(0.0),
            cpu_total: 0.0,
        };
        Ok(Start {
            timeline,
            schedule,
            bins: TimeBins::with_particles(particles),
            state,
            entry: Phase::DomainRebuild,
            resumed: false,
        })
    }

    fn prepare_resume(params: &RunParams, sim: &mut S, comm: &C) -> Result<Start, RunError> {
        let timeline = params.timeline()?;
        let schedule = params.output_schedule()?;
        let cp = Checkpoint::read(&params.output_dir, comm.rank(), comm.size())?;
        if cp.timeline != timeline {
            return Err(RunError::TimelineMismatch {
                path: checkpoint_path(&params.output_dir, comm.rank()),
            });
        }
        let lowest = comm.all_min(cp.state.step)?;
        let highest = comm.all_max(cp.state.step)?;
        if lowest != highest {
            return Err(RunError::InconsistentCheckpoints { lowest, highest });
        }
        sim.read_restart().map_err(RunError::collaborator(Phase::Sync))?;
        if comm.is_root() {
            clear_continuation_marker(&params.output_dir)
                .map_err(io_error("removing continuation marker"))?;
            info!(
                ti = cp.state.ti_current,
                step = cp.state.step,
                snapshots = cp.state.snapshot_count,
                "resuming from checkpoint"
            );
        }
        Ok(Start {
            timeline,
            schedule,
            bins: TimeBins::from_records(&cp.particles),
            state: cp.state,
            entry: Phase::Sync,
            resumed: true,
        })
    }

    fn assemble(params: RunParams, sim: S, comm: C, start: Start) -> Result<Self, RunError> {
        let built = (|| {
            let max_bin = params.max_timestep_bin()?;
            let log_dir = comm.is_root().then_some(params.output_dir.as_path());
            let cpu = CpuLog::start(log_dir, start.state.cpu_total, start.resumed)
                .map_err(io_error("opening cpu log"))?;
            Ok::<_, RunError>((max_bin, cpu))
        })();
        let (max_bin, cpu) = escalate(&comm, built)?;
        let interrupt = InterruptController::new(comm.rank(), InterruptPolicy::from_params(&params));

        Ok(Self {
            sim,
            comm,
            params,
            timeline: start.timeline,
            schedule: start.schedule,
            max_bin,
            bins: start.bins,
            state: start.state,
            interrupt,
            cpu,
            events: EventQueue::new(),
            entry: start.entry,
            force_rebuild: true,
            occupancy: [0; NUM_TIMEBINS],
            highest_active: None,
            active: Vec::new(),
        })
    }

    // ── accessors ─────────────────────────────────────────────────────────────

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    pub fn bins(&self) -> &TimeBins {
        &self.bins
    }

    pub fn simulation(&self) -> &S {
        &self.sim
    }

    pub fn into_simulation(self) -> S {
        self.sim
    }

    // ── main loop ─────────────────────────────────────────────────────────────

    /// Drive the phase cycle until the run completes or is interrupted.
    ///
    /// # Errors
    /// Any [`RunError`]; the process group has been aborted by the time it is
    /// returned.
    pub fn run(&mut self) -> Result<RunOutcome, RunError> {
        let result = self.run_loop();
        escalate(&self.comm, result)
    }

    fn run_loop(&mut self) -> Result<RunOutcome, RunError> {
        if self.comm.is_root() {
            info!(
                ranks = self.comm.size(),
                ti = self.state.ti_current,
                time = self.timeline.time_of(self.state.ti_current),
                entry = self.entry.name(),
                max_timestep_bin = self.max_bin,
                "run loop starting"
            );
        }
        if self.reached_end() {
            // resumed from the checkpoint of a finished run
            if self.comm.is_root() {
                info!(ti = self.state.ti_current, "end of timeline already reached");
            }
            return Ok(RunOutcome::Completed);
        }
        if self.entry != Phase::Sync {
            self.refresh_activity()?;
        }

        let mut phase = self.entry;
        loop {
            let started = Instant::now();
            let flow = self.execute(phase)?;
            self.cpu.record(phase, started);
            if let Flow::Finished(outcome) = flow {
                self.entry = Phase::Sync;
                return Ok(outcome);
            }
            phase = phase.successor();
        }
    }

    fn execute(&mut self, phase: Phase) -> Result<Flow, RunError> {
        match phase {
            Phase::Sync => self.sync()?,
            Phase::DomainRebuild => self.domain_rebuild_if_due()?,
            Phase::DensityUpdate => self.density_update()?,
            Phase::SecondHalfKick => self.second_half_kick()?,
            Phase::EndOfStepPhysics => self.end_of_step_physics()?,
            Phase::StatsFlush => self.stats_flush()?,
            Phase::SnapshotCheck => self.snapshot_check()?,
            Phase::TerminationCheck => return self.termination_check(),
            Phase::FirstHalfKick => self.first_half_kick()?,
            Phase::CpuLog => self.log_cpu()?,
            Phase::InterruptCheck => return self.interrupt_check(),
        }
        Ok(Flow::Next)
    }

    // ── phases ────────────────────────────────────────────────────────────────

    fn sync(&mut self) -> Result<(), RunError> {
        let current = self.state.ti_current;
        let local_next = self.bins.next_sync_tick(current);
        let next = self.comm.all_min(local_next)?;
        if next <= current {
            return Err(RunError::SyncStalled { current, next });
        }

        if self.params.allow_unsync_output {
            self.service_outputs_before(next)?;
        }

        self.state.ti_old = current;
        self.state.ti_current = next;
        self.refresh_activity()?;
        for &i in &self.active {
            drift_to(&mut self.sim, &mut self.bins, &self.timeline, i, next)
                .map_err(RunError::collaborator(Phase::Sync))?;
        }

        if self.comm.is_root() {
            let active: u64 = self
                .occupancy
                .iter()
                .enumerate()
                .filter(|&(bin, _)| is_synchronized(next, bin as u8))
                .map(|(_, &count)| count)
                .sum();
            info!(
                step = self.state.step,
                ti = next,
                time = self.timeline.time_of(next),
                step_size = self.timeline.step_between(current, next),
                highest_active_bin = ?self.highest_active,
                active,
                "sync point"
            );
            debug!(
                highest_occupied_bin = ?highest_occupied_bin(&self.occupancy),
                "timebin occupancy"
            );
            for (bin, &count) in self.occupancy.iter().enumerate().filter(|&(_, &c)| c > 0) {
                debug!(bin, count, active = is_synchronized(next, bin as u8), "timebin occupancy");
            }
        }
        Ok(())
    }

    /// Write every scheduled output strictly before `sync_tick`.
    fn service_outputs_before(&mut self, sync_tick: Tick) -> Result<(), RunError> {
        self.events.clear();
        self.events.push(Event::sync(sync_tick));
        self.events
            .push(Event::output(self.state.ti_next_output, self.state.next_output_kind));

        while let Some(event) = self.events.pop() {
            let EventKind::Output(kind) = event.kind else {
                break;
            };
            debug!(ti = event.tick, sync_tick, "output between sync points");
            self.state.ti_current = event.tick;
            self.write_output(kind, Phase::Sync)?;
            self.events
                .push(Event::output(self.state.ti_next_output, self.state.next_output_kind));
        }
        Ok(())
    }

    fn domain_rebuild_if_due(&mut self) -> Result<(), RunError> {
        let threshold = match self.params.domain_rebuild {
            DomainRebuildRule::MinBin(bin) => bin,
            DomainRebuildRule::ActiveFraction(fraction) => {
                rebuild_threshold_bin(&self.occupancy, fraction)
            }
        };
        let due = self.force_rebuild || self.highest_active.map_or(false, |h| h >= threshold);
        if due {
            self.rebuild_domain(Phase::DomainRebuild)?;
            self.force_rebuild = false;
        }
        Ok(())
    }

    fn density_update(&mut self) -> Result<(), RunError> {
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        let err = || RunError::collaborator(Phase::DensityUpdate);
        self.sim.update_maxhsml(&ctx).map_err(err())?;
        self.sim.compute_densities(&self.active, &ctx).map_err(err())?;
        Ok(())
    }

    fn second_half_kick(&mut self) -> Result<(), RunError> {
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        let err = || RunError::collaborator(Phase::SecondHalfKick);
        self.sim.do_hydro_step_second_half(&self.active, &ctx).map_err(err())?;
        self.sim.do_gravity_step_second_half(&self.active, &ctx).map_err(err())?;
        self.sim.update_velocities(&self.active, &ctx).map_err(err())?;
        Ok(())
    }

    fn end_of_step_physics(&mut self) -> Result<(), RunError> {
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        self.sim
            .end_of_step_physics(&mut self.bins, &ctx)
            .map_err(RunError::collaborator(Phase::EndOfStepPhysics))
    }

    fn stats_flush(&mut self) -> Result<(), RunError> {
        let Some(interval) = self.params.time_bet_statistics else {
            return Ok(());
        };
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        if ctx.time - self.state.time_last_statistics >= interval {
            self.sim
                .energy_statistics(&ctx)
                .map_err(RunError::collaborator(Phase::StatsFlush))?;
            self.state.time_last_statistics += interval;
        }
        Ok(())
    }

    fn snapshot_check(&mut self) -> Result<(), RunError> {
        if self.state.ti_current >= self.state.ti_next_output {
            self.write_output(self.state.next_output_kind, Phase::SnapshotCheck)?;
        }
        Ok(())
    }

    fn reached_end(&self) -> bool {
        let ti = self.state.ti_current;
        ti >= TIMEBASE || self.timeline.time_of(ti) > self.timeline.time_max()
    }

    fn termination_check(&mut self) -> Result<Flow, RunError> {
        let ti = self.state.ti_current;
        if !self.reached_end() {
            return Ok(Flow::Next);
        }

        if self.state.ti_last_output != Some(ti) {
            self.write_output(OutputKind::Full, Phase::TerminationCheck)?;
        }
        self.write_checkpoint(Phase::TerminationCheck)?;
        self.cpu.flush().map_err(io_error("flushing cpu log"))?;

        if self.comm.is_root() {
            info!(
                steps = self.state.step,
                snapshots = self.state.snapshot_count,
                cpu_total = self.cpu.cpu_total(),
                "run completed"
            );
            for phase in Phase::ALL {
                debug!(phase = phase.name(), seconds = self.cpu.phase_total(phase), "time per phase");
            }
        }
        Ok(Flow::Finished(RunOutcome::Completed))
    }

    fn first_half_kick(&mut self) -> Result<(), RunError> {
        let ti = self.state.ti_current;
        self.active = self.bins.active_particles(ti);
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        let err = || RunError::collaborator(Phase::FirstHalfKick);

        for &i in &self.active {
            let dt = self.sim.timestep(i, &ctx).map_err(err())?;
            let ticks = self.timeline.ticks_for_step(dt);
            self.bins.assign_timestep(i, ticks, ti, self.max_bin)?;
        }
        self.sim.do_gravity_step_first_half(&self.active, &ctx).map_err(err())?;
        self.sim.do_hydro_step_first_half(&self.active, &ctx).map_err(err())?;
        Ok(())
    }

    fn log_cpu(&mut self) -> Result<(), RunError> {
        self.state.step += 1;
        self.state.cpu_total = self.cpu.cpu_total();
        let time = self.timeline.time_of(self.state.ti_current);
        self.cpu
            .log_step(self.state.step, time)
            .map_err(io_error("writing cpu log"))
    }

    fn interrupt_check(&mut self) -> Result<Flow, RunError> {
        let cpu = self.cpu.cpu_this_run();
        let decision = self.interrupt.check(&self.comm, cpu)?;

        if decision.needs_checkpoint() {
            self.write_checkpoint(Phase::InterruptCheck)?;
            self.interrupt
                .checkpoint_written(decision, cpu)
                .map_err(io_error("writing continuation marker"))?;
            if decision.stops_run() {
                if self.comm.is_root() {
                    info!(?decision, step = self.state.step, "run interrupted");
                }
                return Ok(Flow::Finished(RunOutcome::Interrupted(decision)));
            }
        } else if self.interrupt.periodic_checkpoint_due(&self.comm, cpu)? {
            self.write_checkpoint(Phase::InterruptCheck)?;
            self.interrupt
                .checkpoint_written(Decision::Continue, cpu)
                .map_err(io_error("writing continuation marker"))?;
        }
        Ok(Flow::Next)
    }

    // ── shared steps ──────────────────────────────────────────────────────────

    /// Recompute the global occupancy and the local active set at the
    /// current tick.  Collective.
    fn refresh_activity(&mut self) -> Result<(), RunError> {
        let ti = self.state.ti_current;
        let local = self.bins.occupancy();
        let global = self.comm.all_sum(&local)?;
        for (o, g) in self.occupancy.iter_mut().zip(global) {
            *o = g;
        }
        self.highest_active = highest_active_bin(&self.occupancy, ti);
        self.active = self.bins.active_particles(ti);
        Ok(())
    }

    fn drift_all(&mut self, phase: Phase) -> Result<(), RunError> {
        let ti = self.state.ti_current;
        for i in 0..self.bins.len() {
            drift_to(&mut self.sim, &mut self.bins, &self.timeline, i, ti)
                .map_err(RunError::collaborator(phase))?;
        }
        Ok(())
    }

    fn rebuild_domain(&mut self, phase: Phase) -> Result<(), RunError> {
        self.drift_all(phase)?;
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        let err = || RunError::collaborator(phase);
        self.sim.treefree().map_err(err())?;
        self.sim.domain_free().map_err(err())?;
        self.sim
            .domain_decomposition(&mut self.bins, &ctx)
            .map_err(err())?;
        self.sim.treebuild(&ctx).map_err(err())?;
        self.active = self.bins.active_particles(self.state.ti_current);
        debug!(
            rank = self.comm.rank(),
            particles = self.bins.len(),
            ti = self.state.ti_current,
            "domain rebuilt"
        );
        Ok(())
    }

    /// Write the output due at the current tick and advance the schedule.
    fn write_output(&mut self, kind: OutputKind, phase: Phase) -> Result<(), RunError> {
        let ti = self.state.ti_current;
        self.drift_all(phase)?;
        if let Some((index, local)) = self.bins.first_unsynchronized(ti) {
            return Err(RunError::ClockMismatch {
                index,
                local,
                global: ti,
            });
        }
        if self.params.domain_rebuild_before_output {
            self.rebuild_domain(phase)?;
        }

        let ctx = context(&self.timeline, &self.state, self.highest_active);
        let err = || RunError::collaborator(phase);

        let grouping = if self.params.group_finding_on_output {
            self.sim.find_groups(&ctx).map_err(err())?
        } else {
            None
        };
        if let Some(perm) = &grouping {
            self.bins.permute(perm);
        }

        let seq = self.state.snapshot_count;
        self.sim.write_snapshot(seq, kind, &ctx).map_err(err())?;

        if let Some(perm) = grouping {
            let restore = perm.inverse();
            self.sim.restore_order(&restore).map_err(err())?;
            self.bins.permute(&restore);
        }

        if self.comm.is_root() {
            info!(seq, ?kind, ti, time = ctx.time, "snapshot written");
        }

        self.state.snapshot_count += 1;
        self.state.ti_last_output = Some(ti);
        let next = self.schedule.next_output_time(ti + 1)?;
        self.state.ti_next_output = next.tick;
        self.state.next_output_kind = next.kind;

        if self.params.allow_unsync_output {
            self.bins.free_lists();
            self.bins.rebuild_lists();
            self.sim.treefree().map_err(err())?;
            self.sim.treebuild(&ctx).map_err(err())?;
        }
        Ok(())
    }

    /// Every rank writes its checkpoint, then the group meets at a barrier.
    fn write_checkpoint(&mut self, phase: Phase) -> Result<(), RunError> {
        self.state.cpu_total = self.cpu.cpu_total();
        let ctx = context(&self.timeline, &self.state, self.highest_active);
        self.sim
            .write_restart(&ctx)
            .map_err(RunError::collaborator(phase))?;

        let cp = Checkpoint {
            rank: self.comm.rank(),
            ranks: self.comm.size(),
            timeline: self.timeline,
            state: self.state.clone(),
            particles: self.bins.records(),
        };
        cp.write(&self.params.output_dir)?;
        self.cpu.flush().map_err(io_error("flushing cpu log"))?;
        self.comm.barrier()?;

        if self.comm.is_root() {
            info!(
                ti = self.state.ti_current,
                step = self.state.step,
                dir = %checkpoint::checkpoint_dir(&self.params.output_dir).display(),
                "checkpoint written"
            );
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{DomainManager, ForceSolver, SnapshotIo};
    use crate::comm::{CommError, LocalGroup};
    use crate::interrupt::Marker;
    use anyhow::bail;
    use tempfile::{tempdir, TempDir};

    /// Every particle asks for the same step; records what the controller does.
    #[derive(Default)]
    struct Uniform {
        dt: f64,
        snapshots: Vec<(u32, OutputKind, Tick)>,
        domain_builds: u32,
        fail_timestep: bool,
    }

    impl ForceSolver for Uniform {
        fn drift_particle(&mut self, _i: usize, _from: Tick, _to: Tick, _tl: &Timeline) -> anyhow::Result<()> {
            Ok(())
        }
        fn timestep(&mut self, _i: usize, _ctx: &StepContext<'_>) -> anyhow::Result<f64> {
            if self.fail_timestep {
                bail!("solver diverged");
            }
            Ok(self.dt)
        }
        fn do_gravity_step_first_half(&mut self, _a: &[usize], _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
        fn do_gravity_step_second_half(&mut self, _a: &[usize], _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl DomainManager for Uniform {
        fn domain_decomposition(&mut self, _b: &mut TimeBins, _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            self.domain_builds += 1;
            Ok(())
        }
        fn domain_free(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        fn treebuild(&mut self, _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
        fn treefree(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    impl SnapshotIo for Uniform {
        fn write_snapshot(&mut self, seq: u32, kind: OutputKind, ctx: &StepContext<'_>) -> anyhow::Result<()> {
            self.snapshots.push((seq, kind, ctx.ti_current));
            Ok(())
        }
        fn write_restart(&mut self, _ctx: &StepContext<'_>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn params(dir: &TempDir) -> RunParams {
        RunParams {
            output_dir: dir.path().to_path_buf(),
            ..RunParams::default()
        }
    }

    fn controller(p: RunParams, sim: Uniform) -> RunController<Uniform, LocalGroup> {
        let comm = LocalGroup::new(1).pop().unwrap();
        RunController::fresh(p, sim, comm, 8).unwrap()
    }

    // ── phases ────────────────────────────────────────────────────────────────

    #[test]
    fn phases_cycle_in_loop_order() {
        let mut p = Phase::Sync;
        let mut seen = Vec::new();
        for _ in 0..Phase::COUNT {
            seen.push(p);
            p = p.successor();
        }
        assert_eq!(seen, Phase::ALL.to_vec());
        assert_eq!(Phase::InterruptCheck.successor(), Phase::Sync);
        assert!(Phase::ALL.iter().enumerate().all(|(i, p)| p.index() == i));
    }

    #[test]
    fn rebuild_threshold_follows_cumulative_fraction() {
        let mut occ = [0u64; NUM_TIMEBINS];
        occ[3] = 5;
        occ[5] = 90;
        occ[7] = 5;
        assert_eq!(rebuild_threshold_bin(&occ, 0.01), 3);
        assert_eq!(rebuild_threshold_bin(&occ, 0.05), 5);
        assert_eq!(rebuild_threshold_bin(&occ, 0.96), 7);
        assert_eq!(rebuild_threshold_bin(&[0; NUM_TIMEBINS], 0.01), 28);
    }

    // ── whole runs ────────────────────────────────────────────────────────────

    #[test]
    fn uniform_run_completes_with_one_snapshot_at_the_end() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(
            params(&dir),
            Uniform {
                dt: 0.01,
                ..Default::default()
            },
        );
        assert_eq!(ctl.run().unwrap(), RunOutcome::Completed);
        assert_eq!(ctl.state().ti_current, TIMEBASE);

        let snaps = &ctl.simulation().snapshots;
        assert_eq!(snaps.len(), 10);
        assert!(snaps.iter().enumerate().all(|(i, s)| s.0 == i as u32));
        assert!(snaps.iter().all(|s| s.2 % (1 << 22) == 0));
        assert_eq!(snaps.iter().filter(|s| s.2 == TIMEBASE).count(), 1);
        assert!(checkpoint_path(dir.path(), 0).exists());
        assert!(dir.path().join("cpu.txt").exists());
    }

    #[test]
    fn steps_are_capped_at_the_maximum_bin() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(
            params(&dir),
            Uniform {
                dt: 0.5,
                ..Default::default()
            },
        );
        ctl.run().unwrap();
        // the pass at tick 0 counts as a step; the pass reaching TIMEBASE
        // returns before its CpuLog phase
        assert_eq!(ctl.state().step, 128);
    }

    #[test]
    fn fixed_rebuild_bin_controls_domain_decompositions() {
        let builds = |min_bin| {
            let dir = tempdir().unwrap();
            let p = RunParams {
                domain_rebuild: DomainRebuildRule::MinBin(min_bin),
                ..params(&dir)
            };
            let mut ctl = controller(
                p,
                Uniform {
                    dt: 0.01,
                    ..Default::default()
                },
            );
            ctl.run().unwrap();
            ctl.simulation().domain_builds
        };
        // every particle sits in bin 22: one forced build, then one per sync
        // point only if the threshold admits bin 22
        assert_eq!(builds(22), 1 + 128);
        assert_eq!(builds(23), 1);
    }

    #[test]
    fn stop_marker_interrupts_after_the_first_step() {
        let dir = tempdir().unwrap();
        std::fs::write(Marker::Stop.path(dir.path()), "").unwrap();
        let mut ctl = controller(
            params(&dir),
            Uniform {
                dt: 0.01,
                ..Default::default()
            },
        );
        assert_eq!(
            ctl.run().unwrap(),
            RunOutcome::Interrupted(Decision::StopSignal)
        );
        assert_eq!(ctl.state().step, 1);
        let cp = Checkpoint::read(dir.path(), 0, 1).unwrap();
        assert_eq!(&cp.state, ctl.state());
        assert!(cp.particles.iter().all(|p| p.bin == 22));
    }

    #[test]
    fn tiny_timestep_is_fatal() {
        let dir = tempdir().unwrap();
        let mut ctl = controller(
            params(&dir),
            Uniform {
                dt: 1e-12,
                ..Default::default()
            },
        );
        assert!(matches!(ctl.run(), Err(RunError::Timestep(_))));
    }

    #[test]
    fn collaborator_failure_names_the_phase_and_aborts() {
        let dir = tempdir().unwrap();
        let mut group = LocalGroup::new(1);
        let comm = group.pop().unwrap();
        let observer = comm.clone();
        let sim = Uniform {
            dt: 0.01,
            fail_timestep: true,
            ..Default::default()
        };
        let mut ctl = RunController::fresh(params(&dir), sim, comm, 4).unwrap();

        match ctl.run() {
            Err(RunError::Collaborator { phase, source }) => {
                assert_eq!(phase, Phase::FirstHalfKick);
                assert!(source.to_string().contains("diverged"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(observer.barrier(), Err(CommError::Aborted { .. })));
    }
}
