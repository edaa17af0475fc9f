/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the run controller.
//!
//! Every variant of [`RunError`] is fatal: the controller escalates it to a
//! group-wide abort before returning it.  Graceful stops (marker files, CPU
//! budget) are not errors; they come back as
//! [`RunOutcome::Interrupted`](super::RunOutcome::Interrupted).

use std::path::PathBuf;

use thiserror::Error;

use crate::clock::{ClockError, Tick};
use crate::comm::CommError;
use crate::config::ConfigError;
use crate::output::OutputError;
use crate::timebins::TimestepError;

use super::Phase;

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error("output schedule: {0}")]
    Output(#[from] OutputError),

    #[error("collective failed: {0}")]
    Comm(#[from] CommError),

    #[error("timestep assignment: {0}")]
    Timestep(#[from] TimestepError),

    /// A collaborator call failed.
    #[error("{phase:?}: {source:#}")]
    Collaborator {
        phase: Phase,
        #[source]
        source: anyhow::Error,
    },

    /// The global next synchronization tick does not advance the clock.
    #[error("next synchronization tick {next} does not advance past {current}")]
    SyncStalled { current: Tick, next: Tick },

    /// A particle's local clock disagrees with the global tick at an output.
    #[error("particle {index} is at tick {local}, expected {global}")]
    ClockMismatch {
        index: usize,
        local: Tick,
        global: Tick,
    },

    #[error("checkpoint {path}: {source}")]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("checkpoint {path}: {source}")]
    CheckpointFormat {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// A checkpoint was written by a different rank layout.
    #[error("checkpoint {path} belongs to rank {found_rank} of {found_ranks}, expected rank {rank} of {ranks}")]
    CheckpointMismatch {
        path: PathBuf,
        rank: usize,
        ranks: usize,
        found_rank: usize,
        found_ranks: usize,
    },

    /// The checkpoint was written for a different time range.
    #[error("checkpoint {path} was written for a different timeline")]
    TimelineMismatch { path: PathBuf },

    /// The ranks loaded checkpoints taken at different steps.
    #[error("ranks resumed from different checkpoints (steps {lowest} to {highest})")]
    InconsistentCheckpoints { lowest: u64, highest: u64 },

    #[error("{what}: {source}")]
    Io {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl RunError {
    pub(crate) fn collaborator(phase: Phase) -> impl FnOnce(anyhow::Error) -> RunError {
        move |source| RunError::Collaborator { phase, source }
    }
}
