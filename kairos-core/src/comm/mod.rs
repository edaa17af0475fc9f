/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Collective operations between the ranks of an SPMD process group.
//!
//! Every rank runs the identical run loop; the only points where ranks meet
//! are the collectives below.  Each is a blocking rendezvous: a rank returns
//! only after every rank in the group has entered the same call, so one
//! straggler stalls the whole group.
//!
//! | Operation | Used for |
//! |---|---|
//! | [`all_min`](Communicator::all_min) | next synchronization tick |
//! | [`all_sum`](Communicator::all_sum) | timebin occupancy, active counts |
//! | [`broadcast`](Communicator::broadcast) | interruption decisions from rank 0 |
//! | [`barrier`](Communicator::barrier) | completion of checkpoint writes |
//! | [`abort`](Communicator::abort) | escalation of a fatal error to the group |
//!
//! [`LocalGroup`] implements the trait for ranks running as threads of one
//! process.  A message-passing backend only needs to provide
//! [`all_gather`](Communicator::all_gather) and
//! [`abort`](Communicator::abort); the other collectives are derived.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use thiserror::Error;
use tracing::error;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommError {
    /// Another rank aborted the group; every pending and future collective
    /// fails with this error.
    #[error("process group aborted by rank {rank}: {reason}")]
    Aborted { rank: usize, reason: String },

    /// A broadcast carried a value that does not decode on the receiving side.
    #[error("malformed broadcast payload: {0}")]
    Malformed(String),
}

// ── Communicator trait ────────────────────────────────────────────────────────

/// A rank's handle on its process group.
pub trait Communicator {
    /// This rank's index, `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks in the group.
    fn size(&self) -> usize;

    /// Contribute `values` and receive every rank's contribution, indexed by
    /// rank.
    fn all_gather(&self, values: &[u64]) -> Result<Vec<Vec<u64>>, CommError>;

    /// Abort the whole group.  Ranks blocked in (or later entering) a
    /// collective receive [`CommError::Aborted`].
    fn abort(&self, reason: &str);

    fn is_root(&self) -> bool {
        self.rank() == 0
    }

    /// Global minimum of `value`.
    fn all_min(&self, value: u64) -> Result<u64, CommError> {
        let all = self.all_gather(&[value])?;
        Ok(all.iter().filter_map(|v| v.first().copied()).min().unwrap_or(value))
    }

    /// Global maximum of `value`.
    fn all_max(&self, value: u64) -> Result<u64, CommError> {
        let all = self.all_gather(&[value])?;
        Ok(all.iter().filter_map(|v| v.first().copied()).max().unwrap_or(value))
    }

    /// Element-wise global sum.  Every rank must pass the same length.
    fn all_sum(&self, values: &[u64]) -> Result<Vec<u64>, CommError> {
        let all = self.all_gather(values)?;
        let mut out = vec![0u64; values.len()];
        for contribution in &all {
            if contribution.len() != out.len() {
                return Err(CommError::Malformed(format!(
                    "all_sum length mismatch: {} vs {}",
                    contribution.len(),
                    out.len()
                )));
            }
            for (o, v) in out.iter_mut().zip(contribution) {
                *o += v;
            }
        }
        Ok(out)
    }

    /// Distribute rank 0's `value` to every rank.
    ///
    /// The root passes `Some(value)`; all other ranks pass `None` and any value
    /// they might hold is ignored.
    fn broadcast(&self, value: Option<u64>) -> Result<u64, CommError> {
        let mine: Vec<u64> = if self.is_root() {
            value.into_iter().collect()
        } else {
            Vec::new()
        };
        let all = self.all_gather(&mine)?;
        all.first()
            .and_then(|root| root.first().copied())
            .ok_or_else(|| CommError::Malformed("root sent no broadcast value".into()))
    }

    /// Block until every rank has arrived.
    fn barrier(&self) -> Result<(), CommError> {
        self.all_gather(&[]).map(|_| ())
    }
}

// ── LocalGroup ────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Rendezvous {
    arrived: usize,
    generation: u64,
    slots: Vec<Vec<u64>>,
    published: Vec<Vec<u64>>,
    aborted: Option<(usize, String)>,
}

#[derive(Debug)]
struct Shared {
    size: usize,
    state: Mutex<Rendezvous>,
    wake: Condvar,
}

/// One rank of an in-process group; the ranks are threads sharing a
/// rendezvous point.
///
/// ```rust
/// use kairos_core::comm::{Communicator, LocalGroup};
///
/// let ranks = LocalGroup::new(3);
/// let mins: Vec<u64> = std::thread::scope(|s| {
///     let handles: Vec<_> = ranks
///         .into_iter()
///         .map(|comm| s.spawn(move || comm.all_min(10 + comm.rank() as u64).unwrap()))
///         .collect();
///     handles.into_iter().map(|h| h.join().unwrap()).collect()
/// });
/// assert_eq!(mins, vec![10, 10, 10]);
/// ```
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl LocalGroup {
    /// Create a group of `size` ranks; hand one handle to each thread.
    pub fn new(size: usize) -> Vec<LocalGroup> {
        let shared = Arc::new(Shared {
            size,
            state: Mutex::new(Rendezvous {
                arrived: 0,
                generation: 0,
                slots: vec![Vec::new(); size],
                published: Vec::new(),
                aborted: None,
            }),
            wake: Condvar::new(),
        });
        (0..size)
            .map(|rank| LocalGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, Rendezvous> {
        // a rank that panicked mid-collective leaves consistent counters behind
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Communicator for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.shared.size
    }

    fn all_gather(&self, values: &[u64]) -> Result<Vec<Vec<u64>>, CommError> {
        let mut state = self.lock();
        if let Some((rank, reason)) = &state.aborted {
            return Err(CommError::Aborted {
                rank: *rank,
                reason: reason.clone(),
            });
        }

        state.slots[self.rank] = values.to_vec();
        state.arrived += 1;

        if state.arrived == self.shared.size {
            // last to arrive publishes and releases everyone
            state.published = std::mem::take(&mut state.slots);
            state.slots = vec![Vec::new(); self.shared.size];
            state.arrived = 0;
            state.generation += 1;
            self.shared.wake.notify_all();
            return Ok(state.published.clone());
        }

        let generation = state.generation;
        let state = self
            .shared
            .wake
            .wait_while(state, |s| s.generation == generation && s.aborted.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if state.generation == generation {
            if let Some((rank, reason)) = &state.aborted {
                return Err(CommError::Aborted {
                    rank: *rank,
                    reason: reason.clone(),
                });
            }
        }
        // the next collective cannot complete before this rank joins it, so
        // `published` still holds this round's result
        Ok(state.published.clone())
    }

    fn abort(&self, reason: &str) {
        let mut state = self.lock();
        if state.aborted.is_none() {
            error!(rank = self.rank, reason, "aborting process group");
            state.aborted = Some((self.rank, reason.to_string()));
        }
        self.shared.wake.notify_all();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
