/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Min-ordered queue of pending sync and output events.
//!
//! With unsynchronized output enabled an output may fall strictly between two
//! synchronization points.  The controller pushes the next sync tick and the
//! next output tick, then pops in tick order until the sync event comes out.
//! On equal ticks the sync event wins, so an output that coincides with a
//! sync point is left to the regular snapshot check.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::clock::Tick;
use crate::output::OutputKind;

/// Variant order is the tie-break: `Sync` sorts before `Output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventKind {
    Sync,
    Output(OutputKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Event {
    pub tick: Tick,
    pub kind: EventKind,
}

impl Event {
    pub fn sync(tick: Tick) -> Self {
        Self {
            tick,
            kind: EventKind::Sync,
        }
    }

    pub fn output(tick: Tick, kind: OutputKind) -> Self {
        Self {
            tick,
            kind: EventKind::Output(kind),
        }
    }
}

#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.heap.push(Reverse(event));
    }

    /// Earliest pending event.
    pub fn pop(&mut self) -> Option<Event> {
        self.heap.pop().map(|Reverse(e)| e)
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }
}
