/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-rank checkpoint files.
//!
//! Each rank writes `<output_dir>/restartfiles/restart.<rank>.yaml`.  A new
//! checkpoint goes to a temporary file first and is renamed into place; the
//! previous one is kept as `restart.<rank>.yaml.bak`, so a crash mid-write
//! never leaves a rank without a readable checkpoint.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::clock::{Tick, Timeline};
use crate::output::OutputKind;
use crate::timebins::ParticleClock;

use super::RunError;

/// Controller state that is identical on every rank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub ti_current: Tick,
    pub ti_old: Tick,
    pub ti_next_output: Tick,
    pub next_output_kind: OutputKind,
    pub ti_last_output: Option<Tick>,
    /// Number of snapshots written so far; also the next sequence number.
    pub snapshot_count: u32,
    pub step: u64,
    pub time_last_statistics: f64,
    /// CPU seconds accumulated over all previous jobs and this one.
    pub cpu_total: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub rank: usize,
    pub ranks: usize,
    pub timeline: Timeline,
    pub state: RunState,
    pub particles: Vec<ParticleClock>,
}

pub fn checkpoint_dir(output_dir: &Path) -> PathBuf {
    output_dir.join("restartfiles")
}

pub fn checkpoint_path(output_dir: &Path, rank: usize) -> PathBuf {
    checkpoint_dir(output_dir).join(format!("restart.{rank}.yaml"))
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> RunError {
    let path = path.to_path_buf();
    move |source| RunError::CheckpointIo { path, source }
}

impl Checkpoint {
    /// Write this rank's checkpoint and return its path.
    pub fn write(&self, output_dir: &Path) -> Result<PathBuf, RunError> {
        let dir = checkpoint_dir(output_dir);
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;

        let path = checkpoint_path(output_dir, self.rank);
        let tmp = path.with_extension("yaml.tmp");
        let text = serde_yaml::to_string(self).map_err(|source| RunError::CheckpointFormat {
            path: path.clone(),
            source,
        })?;

        fs::write(&tmp, text).map_err(io_err(&tmp))?;
        if path.exists() {
            fs::rename(&path, path.with_extension("yaml.bak")).map_err(io_err(&path))?;
        }
        fs::rename(&tmp, &path).map_err(io_err(&path))?;

        debug!(rank = self.rank, path = %path.display(), "checkpoint written");
        Ok(path)
    }

    /// Read the checkpoint of `rank` and check it belongs to a group of
    /// `ranks` ranks.
    pub fn read(output_dir: &Path, rank: usize, ranks: usize) -> Result<Self, RunError> {
        let path = checkpoint_path(output_dir, rank);
        let text = fs::read_to_string(&path).map_err(io_err(&path))?;
        let cp: Checkpoint = serde_yaml::from_str(&text).map_err(|source| {
            RunError::CheckpointFormat {
                path: path.clone(),
                source,
            }
        })?;
        if cp.rank != rank || cp.ranks != ranks {
            return Err(RunError::CheckpointMismatch {
                path,
                rank,
                ranks,
                found_rank: cp.rank,
                found_ranks: cp.ranks,
            });
        }
        Ok(cp)
    }
}
