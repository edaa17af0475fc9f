/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Run interruption: marker files, CPU budget and periodic checkpoints.
//!
//! Once per step the group agrees on whether to carry on.  The decision is
//! made on rank 0 alone and broadcast, so every rank takes the same branch:
//!
//! ```text
//!  rank 0 (Coordinator)            ranks 1.. (Participant)
//!  ───────────────────             ───────────────────────
//!  collect(): stop? restart? cpu?
//!        │ Decision::code()
//!        └──────── broadcast ─────────►  Decision::from_code()
//! ```
//!
//! Only [`Coordinator`] can [`collect`](Coordinator::collect) a decision;
//! a [`Participant`] has no way to produce one.
//!
//! Markers are checked in priority order `stop` > `restart` > CPU budget.  The
//! first hit wins and any lower-priority marker stays on disk for a later step.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{info, warn};

use crate::comm::{CommError, Communicator};
use crate::config::RunParams;

// ── Decision ──────────────────────────────────────────────────────────────────

/// Outcome of one interruption check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Continue,
    /// A `stop` marker was found.
    StopSignal,
    /// The job is close to its wall-clock budget.
    StopCpuBudget,
    /// A `restart` marker asked for a checkpoint; the run carries on.
    CheckpointOnly,
}

impl Decision {
    /// Wire code broadcast from rank 0.
    pub fn code(self) -> u64 {
        match self {
            Decision::Continue => 0,
            Decision::StopSignal => 1,
            Decision::StopCpuBudget => 2,
            Decision::CheckpointOnly => 3,
        }
    }

    pub(crate) fn from_code(code: u64) -> Result<Self, CommError> {
        match code {
            0 => Ok(Decision::Continue),
            1 => Ok(Decision::StopSignal),
            2 => Ok(Decision::StopCpuBudget),
            3 => Ok(Decision::CheckpointOnly),
            other => Err(CommError::Malformed(format!(
                "unknown interruption code {other}"
            ))),
        }
    }

    /// Every rank must write its checkpoint.
    pub fn needs_checkpoint(self) -> bool {
        self != Decision::Continue
    }

    /// The run loop returns after the checkpoint.
    pub fn stops_run(self) -> bool {
        matches!(self, Decision::StopSignal | Decision::StopCpuBudget)
    }
}

// ── Marker files ──────────────────────────────────────────────────────────────

/// Filesystem signals exchanged with the operator or batch system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marker {
    /// Incoming: checkpoint and stop.
    Stop,
    /// Incoming: checkpoint and continue.
    Restart,
    /// Outgoing: the run stopped on its CPU budget and wants to be continued.
    Continuation,
}

impl Marker {
    pub fn file_name(self) -> &'static str {
        match self {
            Marker::Stop => "stop",
            Marker::Restart => "restart",
            Marker::Continuation => "cont",
        }
    }

    pub fn path(self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// Remove `marker` from `dir`, reporting whether it was there.
///
/// A marker that exists but cannot be removed still counts as found;
/// otherwise it would fire again on every step.
fn consume(dir: &Path, marker: Marker) -> bool {
    let path = marker.path(dir);
    match fs::remove_file(&path) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(file = %path.display(), error = %e, "cannot remove marker file");
            true
        }
    }
}

/// Delete a `cont` marker left behind by the previous job.
pub fn clear_continuation_marker(dir: &Path) -> io::Result<()> {
    match fs::remove_file(Marker::Continuation.path(dir)) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// Limits and locations the coordinator checks against.
#[derive(Debug, Clone, PartialEq)]
pub struct InterruptPolicy {
    pub output_dir: PathBuf,
    /// Wall-clock budget of the job in seconds.
    pub time_limit_cpu: f64,
    /// Fraction of the budget after which the run stops.
    pub stop_cpu_fraction: f64,
    /// Seconds between periodic checkpoints.
    pub cpu_time_bet_restart_file: f64,
    /// Shell command submitting the follow-up job after a CPU-budget stop.
    pub resubmit_command: Option<String>,
}

impl InterruptPolicy {
    pub fn from_params(params: &RunParams) -> Self {
        Self {
            output_dir: params.output_dir.clone(),
            time_limit_cpu: params.time_limit_cpu,
            stop_cpu_fraction: params.stop_cpu_fraction,
            cpu_time_bet_restart_file: params.cpu_time_bet_restart_file,
            resubmit_command: params
                .resubmit_on
                .then(|| params.resubmit_command.clone()),
        }
    }

    fn cpu_threshold(&self) -> f64 {
        self.stop_cpu_fraction * self.time_limit_cpu
    }
}

// ── Roles ─────────────────────────────────────────────────────────────────────

/// Rank 0's half of the interruption protocol.
#[derive(Debug)]
pub struct Coordinator {
    policy: InterruptPolicy,
    last_restart_cpu: f64,
}

impl Coordinator {
    /// Look at markers and the CPU clock and decide.
    pub fn collect(&mut self, cpu_this_run: f64) -> Decision {
        let dir = &self.policy.output_dir;
        if consume(dir, Marker::Stop) {
            Decision::StopSignal
        } else if consume(dir, Marker::Restart) {
            Decision::CheckpointOnly
        } else if cpu_this_run > self.policy.cpu_threshold() {
            Decision::StopCpuBudget
        } else {
            Decision::Continue
        }
    }

    fn periodic_due(&self, cpu_this_run: f64) -> bool {
        cpu_this_run - self.last_restart_cpu >= self.policy.cpu_time_bet_restart_file
    }

    /// Rank-0 side effects once the group's checkpoint is on disk.
    fn after_checkpoint(&self, decision: Decision) -> io::Result<()> {
        if decision != Decision::StopCpuBudget {
            return Ok(());
        }
        let cont = Marker::Continuation.path(&self.policy.output_dir);
        fs::write(&cont, "ok\n")?;
        info!(file = %cont.display(), "continuation marker written");

        if let Some(cmd) = &self.policy.resubmit_command {
            info!(command = %cmd, "resubmitting job");
            match Command::new("sh").arg("-c").arg(cmd).status() {
                Ok(status) if status.success() => {}
                Ok(status) => warn!(command = %cmd, %status, "resubmit command failed"),
                Err(e) => warn!(command = %cmd, error = %e, "cannot run resubmit command"),
            }
        }
        Ok(())
    }
}

/// Every other rank: receives decisions, never makes them.
#[derive(Debug)]
pub struct Participant {
    _private: (),
}

#[derive(Debug)]
pub enum Role {
    Coordinator(Coordinator),
    Participant(Participant),
}

// ── InterruptController ───────────────────────────────────────────────────────

/// Per-rank driver of the interruption protocol.
#[derive(Debug)]
pub struct InterruptController {
    role: Role,
}

impl InterruptController {
    /// Rank 0 becomes the coordinator.
    pub fn new(rank: usize, policy: InterruptPolicy) -> Self {
        let role = if rank == 0 {
            Role::Coordinator(Coordinator {
                policy,
                last_restart_cpu: 0.0,
            })
        } else {
            Role::Participant(Participant { _private: () })
        };
        Self { role }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Collective: agree on this step's decision.
    pub fn check<C: Communicator>(&mut self, comm: &C, cpu_this_run: f64) -> Result<Decision, CommError> {
        let proposal = match &mut self.role {
            Role::Coordinator(c) => Some(c.collect(cpu_this_run).code()),
            Role::Participant(_) => None,
        };
        let decision = Decision::from_code(comm.broadcast(proposal)?)?;
        if decision != Decision::Continue && comm.is_root() {
            info!(?decision, cpu_this_run, "interruption requested");
        }
        Ok(decision)
    }

    /// Collective: is a periodic checkpoint due?  Only asked after a
    /// [`Decision::Continue`].
    pub fn periodic_checkpoint_due<C: Communicator>(
        &mut self,
        comm: &C,
        cpu_this_run: f64,
    ) -> Result<bool, CommError> {
        let proposal = match &self.role {
            Role::Coordinator(c) => Some(u64::from(c.periodic_due(cpu_this_run))),
            Role::Participant(_) => None,
        };
        Ok(comm.broadcast(proposal)? != 0)
    }

    /// Record that a checkpoint was written at `cpu_this_run` and run the
    /// coordinator's follow-up actions for `decision`.
    pub fn checkpoint_written(&mut self, decision: Decision, cpu_this_run: f64) -> io::Result<()> {
        match &mut self.role {
            Role::Coordinator(c) => {
                c.last_restart_cpu = cpu_this_run;
                c.after_checkpoint(decision)
            }
            Role::Participant(_) => Ok(()),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalGroup;
    use tempfile::tempdir;

    fn policy(dir: &Path) -> InterruptPolicy {
        InterruptPolicy {
            output_dir: dir.to_path_buf(),
            time_limit_cpu: 100.0,
            stop_cpu_fraction: 0.85,
            cpu_time_bet_restart_file: 10.0,
            resubmit_command: None,
        }
    }

    fn coordinator(dir: &Path) -> Coordinator {
        Coordinator {
            policy: policy(dir),
            last_restart_cpu: 0.0,
        }
    }

    fn touch(dir: &Path, m: Marker) {
        fs::write(m.path(dir), "").unwrap();
    }

    // ── decision codes ────────────────────────────────────────────────────────

    #[test]
    fn wire_codes_are_stable() {
        let all = [
            Decision::Continue,
            Decision::StopSignal,
            Decision::StopCpuBudget,
            Decision::CheckpointOnly,
        ];
        let codes: Vec<u64> = all.iter().map(|d| d.code()).collect();
        assert_eq!(codes, vec![0, 1, 2, 3]);
        assert!(Decision::from_code(4).is_err());
        assert!(Decision::CheckpointOnly.needs_checkpoint());
        assert!(!Decision::CheckpointOnly.stops_run());
    }

    // ── marker priority ───────────────────────────────────────────────────────

    #[test]
    fn no_markers_within_budget_continues() {
        let dir = tempdir().unwrap();
        assert_eq!(coordinator(dir.path()).collect(10.0), Decision::Continue);
    }

    #[test]
    fn stop_wins_over_restart_and_leaves_restart_in_place() {
        let dir = tempdir().unwrap();
        touch(dir.path(), Marker::Stop);
        touch(dir.path(), Marker::Restart);
        let mut c = coordinator(dir.path());

        assert_eq!(c.collect(99.0), Decision::StopSignal);
        assert!(!Marker::Stop.path(dir.path()).exists());
        assert!(Marker::Restart.path(dir.path()).exists());

        // the stop marker fires exactly once
        assert_eq!(c.collect(0.0), Decision::CheckpointOnly);
        assert_eq!(c.collect(0.0), Decision::Continue);
    }

    #[test]
    fn restart_marker_wins_over_cpu_budget() {
        let dir = tempdir().unwrap();
        touch(dir.path(), Marker::Restart);
        let mut c = coordinator(dir.path());
        assert_eq!(c.collect(90.0), Decision::CheckpointOnly);
        assert_eq!(c.collect(90.0), Decision::StopCpuBudget);
    }

    #[test]
    fn cpu_threshold_is_strict() {
        let dir = tempdir().unwrap();
        let mut c = coordinator(dir.path());
        assert_eq!(c.collect(85.0), Decision::Continue);
        assert_eq!(c.collect(85.1), Decision::StopCpuBudget);
    }

    // ── checkpoint follow-up ──────────────────────────────────────────────────

    #[test]
    fn cpu_stop_writes_continuation_marker() {
        let dir = tempdir().unwrap();
        let mut ctl = InterruptController::new(0, policy(dir.path()));
        ctl.checkpoint_written(Decision::StopSignal, 1.0).unwrap();
        assert!(!Marker::Continuation.path(dir.path()).exists());

        ctl.checkpoint_written(Decision::StopCpuBudget, 2.0).unwrap();
        assert!(Marker::Continuation.path(dir.path()).exists());

        clear_continuation_marker(dir.path()).unwrap();
        assert!(!Marker::Continuation.path(dir.path()).exists());
        clear_continuation_marker(dir.path()).unwrap();
    }

    #[test]
    fn resubmit_command_runs_after_cpu_stop() {
        let dir = tempdir().unwrap();
        let flag = dir.path().join("resubmitted");
        let mut p = policy(dir.path());
        p.resubmit_command = Some(format!("touch {}", flag.display()));
        let mut ctl = InterruptController::new(0, p);
        ctl.checkpoint_written(Decision::StopCpuBudget, 0.0).unwrap();
        assert!(flag.exists());
    }

    #[test]
    fn participants_never_touch_the_filesystem() {
        let dir = tempdir().unwrap();
        let mut ctl = InterruptController::new(3, policy(dir.path()));
        assert!(matches!(ctl.role(), Role::Participant(_)));
        ctl.checkpoint_written(Decision::StopCpuBudget, 0.0).unwrap();
        assert!(!Marker::Continuation.path(dir.path()).exists());
    }

    // ── collective agreement ──────────────────────────────────────────────────

    #[test]
    fn every_rank_receives_the_coordinators_decision() {
        let dir = tempdir().unwrap();
        touch(dir.path(), Marker::Stop);
        let pol = policy(dir.path());

        let decisions: Vec<Decision> = std::thread::scope(|s| {
            let handles: Vec<_> = LocalGroup::new(3)
                .into_iter()
                .map(|comm| {
                    let pol = pol.clone();
                    s.spawn(move || {
                        let mut ctl = InterruptController::new(comm.rank(), pol);
                        ctl.check(&comm, 0.0).unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(decisions, vec![Decision::StopSignal; 3]);
    }

    #[test]
    fn periodic_checkpoint_follows_last_write() {
        let dir = tempdir().unwrap();
        let comm = LocalGroup::new(1).pop().unwrap();
        let mut ctl = InterruptController::new(0, policy(dir.path()));

        assert!(!ctl.periodic_checkpoint_due(&comm, 9.0).unwrap());
        assert!(ctl.periodic_checkpoint_due(&comm, 10.0).unwrap());
        ctl.checkpoint_written(Decision::Continue, 10.0).unwrap();
        assert!(!ctl.periodic_checkpoint_due(&comm, 15.0).unwrap());
        assert!(ctl.periodic_checkpoint_due(&comm, 20.5).unwrap());
    }
}
