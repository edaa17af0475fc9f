/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Synthetic particle simulation for exercising the Kairos run controller.
//!
//! [`ToySimulation`] implements every collaborator trait with cheap,
//! deterministic stand-ins: particles move on straight lines, the timestep of
//! a particle depends only on its id and the current tick, and the domain
//! "decomposition" sorts the local particles by position.  Everything the
//! controller asks for is written to a shared [`Recorder`] so tests can
//! compare runs.
//!
//! NOT for production.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info_span};

use kairos_core::clock::{Tick, Timeline};
use kairos_core::collab::{DomainManager, ForceSolver, SnapshotIo, StepContext};
use kairos_core::comm::{Communicator, LocalGroup};
use kairos_core::config::RunParams;
use kairos_core::output::OutputKind;
use kairos_core::run::checkpoint::checkpoint_dir;
use kairos_core::run::{RunController, RunError, RunOutcome};
use kairos_core::timebins::{Permutation, TimeBins};

/// Particle ids are `rank * ID_STRIDE + n`, unique across the group.
pub const ID_STRIDE: u64 = 1 << 32;

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct ToyConfig {
    /// Initial particles per rank.
    pub particles: usize,
    /// Timesteps are `max_size_timestep / 2^k` for `k` in `0..timestep_levels`.
    pub timestep_levels: u32,
    /// Spawn one particle in bin 0 every this many steps.
    pub spawn_every: Option<u64>,
    /// Fail the timestep computation at this step ...
    pub fail_at_step: Option<u64>,
    /// ... on this rank only (all ranks if unset).
    pub fail_rank: Option<usize>,
    /// Reorder particles by id before every snapshot.
    pub group_by_id: bool,
}

impl Default for ToyConfig {
    fn default() -> Self {
        Self {
            particles: 16,
            timestep_levels: 4,
            spawn_every: None,
            fail_at_step: None,
            fail_rank: None,
            group_by_id: false,
        }
    }
}

// ── Recorder ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotRecord {
    pub seq: u32,
    pub kind: OutputKind,
    pub tick: Tick,
    /// Particle ids in the order they were written.
    pub ids: Vec<u64>,
}

/// What one rank was asked to do.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankLog {
    /// Tick of every pass through the density phase, i.e. every sync point.
    pub sync_ticks: Vec<Tick>,
    pub snapshots: Vec<SnapshotRecord>,
    pub domain_builds: u32,
    pub statistics: u32,
    pub restarts_written: u32,
}

/// Shared, cloneable log of all ranks.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    logs: Arc<Mutex<BTreeMap<usize, RankLog>>>,
}

impl Recorder {
    fn update(&self, rank: usize, f: impl FnOnce(&mut RankLog)) {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        f(logs.entry(rank).or_default());
    }

    /// Snapshot of one rank's log.
    pub fn rank(&self, rank: usize) -> RankLog {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(&rank).cloned().unwrap_or_default()
    }
}

// ── Simulation ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToyParticle {
    pub id: u64,
    pub pos: f64,
    pub vel: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ToyRestart {
    particles: Vec<ToyParticle>,
    next_id: u64,
}

#[derive(Debug)]
pub struct ToySimulation {
    rank: usize,
    cfg: ToyConfig,
    max_dt: f64,
    output_dir: PathBuf,
    particles: Vec<ToyParticle>,
    next_id: u64,
    recorder: Recorder,
}

impl ToySimulation {
    pub fn new(rank: usize, cfg: ToyConfig, params: &RunParams, recorder: Recorder) -> Self {
        let base = rank as u64 * ID_STRIDE;
        let particles = (0..cfg.particles as u64)
            .map(|n| ToyParticle {
                id: base + n,
                pos: n as f64,
                vel: (n % 7) as f64 - 3.0,
            })
            .collect();
        Self {
            rank,
            max_dt: params.max_size_timestep,
            output_dir: params.output_dir.clone(),
            next_id: base + cfg.particles as u64,
            cfg,
            particles,
            recorder,
        }
    }

    pub fn particles(&self) -> &[ToyParticle] {
        &self.particles
    }

    fn restart_path(&self) -> PathBuf {
        checkpoint_dir(&self.output_dir).join(format!("toy.{}.yaml", self.rank))
    }

    /// Deterministic in the particle id and the tick only.
    fn level(&self, id: u64, tick: Tick) -> u32 {
        let levels = self.cfg.timestep_levels.max(1) as u64;
        (((id.wrapping_mul(2_654_435_761)) ^ (tick >> 18)) % levels) as u32
    }

    fn permute(&mut self, perm: &Permutation) {
        perm.apply(&mut self.particles);
    }
}

impl ForceSolver for ToySimulation {
    fn drift_particle(&mut self, index: usize, from: Tick, to: Tick, timeline: &Timeline) -> Result<()> {
        let p = self
            .particles
            .get_mut(index)
            .with_context(|| format!("no particle {index} on rank {}", self.rank))?;
        p.pos += p.vel * (timeline.time_of(to) - timeline.time_of(from));
        Ok(())
    }

    fn timestep(&mut self, index: usize, ctx: &StepContext<'_>) -> Result<f64> {
        if self.cfg.fail_at_step == Some(ctx.step)
            && self.cfg.fail_rank.map_or(true, |r| r == self.rank)
        {
            bail!("injected failure at step {} on rank {}", ctx.step, self.rank);
        }
        let id = self.particles[index].id;
        let level = self.level(id, ctx.ti_current);
        Ok(self.max_dt * 0.5f64.powi(i32::try_from(level).unwrap_or(i32::MAX)))
    }

    fn do_gravity_step_first_half(&mut self, _active: &[usize], _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn do_gravity_step_second_half(&mut self, _active: &[usize], _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn update_maxhsml(&mut self, ctx: &StepContext<'_>) -> Result<()> {
        self.recorder
            .update(self.rank, |log| log.sync_ticks.push(ctx.ti_current));
        Ok(())
    }

    fn end_of_step_physics(&mut self, bins: &mut TimeBins, ctx: &StepContext<'_>) -> Result<()> {
        if let Some(every) = self.cfg.spawn_every {
            if every > 0 && ctx.step > 0 && ctx.step % every == 0 {
                self.particles.push(ToyParticle {
                    id: self.next_id,
                    pos: 0.0,
                    vel: 1.0,
                });
                self.next_id += 1;
                bins.push(0, ctx.ti_current);
            }
        }
        Ok(())
    }

    fn energy_statistics(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        self.recorder.update(self.rank, |log| log.statistics += 1);
        Ok(())
    }
}

impl DomainManager for ToySimulation {
    fn domain_decomposition(&mut self, bins: &mut TimeBins, _ctx: &StepContext<'_>) -> Result<()> {
        let mut order: Vec<usize> = (0..self.particles.len()).collect();
        order.sort_by(|&a, &b| self.particles[a].pos.total_cmp(&self.particles[b].pos));
        let perm = Permutation::new(order).context("position sort produced an invalid order")?;
        self.permute(&perm);
        bins.permute(&perm);
        self.recorder.update(self.rank, |log| log.domain_builds += 1);
        Ok(())
    }

    fn domain_free(&mut self) -> Result<()> {
        Ok(())
    }

    fn treebuild(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        Ok(())
    }

    fn treefree(&mut self) -> Result<()> {
        Ok(())
    }
}

impl SnapshotIo for ToySimulation {
    fn write_snapshot(&mut self, seq: u32, kind: OutputKind, ctx: &StepContext<'_>) -> Result<()> {
        let record = SnapshotRecord {
            seq,
            kind,
            tick: ctx.ti_current,
            ids: self.particles.iter().map(|p| p.id).collect(),
        };
        self.recorder.update(self.rank, |log| log.snapshots.push(record));
        Ok(())
    }

    fn write_restart(&mut self, _ctx: &StepContext<'_>) -> Result<()> {
        let path = self.restart_path();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let state = ToyRestart {
            particles: self.particles.clone(),
            next_id: self.next_id,
        };
        std::fs::write(&path, serde_yaml::to_string(&state)?)
            .with_context(|| format!("writing {}", path.display()))?;
        self.recorder.update(self.rank, |log| log.restarts_written += 1);
        debug!(rank = self.rank, path = %path.display(), "toy restart written");
        Ok(())
    }

    fn read_restart(&mut self) -> Result<()> {
        let path = self.restart_path();
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        let state: ToyRestart = serde_yaml::from_str(&text)?;
        self.particles = state.particles;
        self.next_id = state.next_id;
        Ok(())
    }

    fn find_groups(&mut self, _ctx: &StepContext<'_>) -> Result<Option<Permutation>> {
        if !self.cfg.group_by_id {
            return Ok(None);
        }
        let mut order: Vec<usize> = (0..self.particles.len()).collect();
        order.sort_by_key(|&i| self.particles[i].id);
        let perm = Permutation::new(order).context("id sort produced an invalid order")?;
        self.permute(&perm);
        Ok(Some(perm))
    }

    fn restore_order(&mut self, perm: &Permutation) -> Result<()> {
        self.permute(perm);
        Ok(())
    }
}

// ── Group driver ──────────────────────────────────────────────────────────────

/// Run `ranks` in-process ranks, one blocking task each, and collect every
/// rank's result in rank order.
pub async fn run_group(
    params: RunParams,
    ranks: usize,
    toy: ToyConfig,
    resume: bool,
    recorder: Recorder,
) -> Result<Vec<Result<RunOutcome, RunError>>> {
    let mut handles = Vec::with_capacity(ranks);
    for comm in LocalGroup::new(ranks) {
        let params = params.clone();
        let toy = toy.clone();
        let recorder = recorder.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            let rank = comm.rank();
            let _span = info_span!("rank", rank).entered();
            let particles = toy.particles;
            let sim = ToySimulation::new(rank, toy, &params, recorder);
            let mut ctl = if resume {
                RunController::resume(params, sim, comm)?
            } else {
                RunController::fresh(params, sim, comm, particles)?
            };
            ctl.run()
        }));
    }

    let mut results = Vec::with_capacity(ranks);
    for handle in handles {
        results.push(handle.await.context("rank task panicked")?);
    }
    Ok(results)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use kairos_core::clock::TIMEBASE;

    fn sim(cfg: ToyConfig) -> ToySimulation {
        ToySimulation::new(1, cfg, &RunParams::default(), Recorder::default())
    }

    #[test]
    fn ids_are_unique_per_rank() {
        let s = sim(ToyConfig::default());
        assert_eq!(s.particles().len(), 16);
        assert_eq!(s.particles()[0].id, ID_STRIDE);
        assert_eq!(s.next_id, ID_STRIDE + 16);
    }

    #[test]
    fn timestep_levels_stay_in_range() {
        let s = sim(ToyConfig {
            timestep_levels: 3,
            ..ToyConfig::default()
        });
        for id in 0..100 {
            for tick in [0, 1 << 20, TIMEBASE / 2] {
                assert!(s.level(id, tick) < 3);
            }
        }
    }

    #[test]
    fn deep_timestep_hierarchies_do_not_overflow() {
        let mut s = sim(ToyConfig {
            timestep_levels: 64,
            ..ToyConfig::default()
        });
        let tl = Timeline::new(0.0, 1.0, false).unwrap();
        let ctx = StepContext {
            timeline: &tl,
            ti_current: 0,
            time: 0.0,
            step: 0,
            highest_active_bin: None,
        };
        for i in 0..s.particles().len() {
            let dt = s.timestep(i, &ctx).unwrap();
            assert!(dt > 0.0 && dt <= s.max_dt);
        }
    }

    #[test]
    fn grouping_sorts_by_id_and_restores() {
        let mut s = sim(ToyConfig {
            group_by_id: true,
            ..ToyConfig::default()
        });
        s.particles.reverse();
        let before: Vec<u64> = s.particles.iter().map(|p| p.id).collect();
        let tl = Timeline::new(0.0, 1.0, false).unwrap();
        let ctx = StepContext {
            timeline: &tl,
            ti_current: 0,
            time: 0.0,
            step: 0,
            highest_active_bin: None,
        };

        let perm = s.find_groups(&ctx).unwrap().unwrap();
        assert!(s.particles.windows(2).all(|w| w[0].id < w[1].id));
        s.restore_order(&perm.inverse()).unwrap();
        let after: Vec<u64> = s.particles.iter().map(|p| p.id).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn recorder_separates_ranks() {
        let r = Recorder::default();
        r.update(0, |log| log.domain_builds += 1);
        r.update(2, |log| log.statistics += 3);
        assert_eq!(r.rank(0).domain_builds, 1);
        assert_eq!(r.rank(2).statistics, 3);
        assert_eq!(r.rank(1), RankLog::default());
    }
}
