/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Kairos – time advancement and output scheduling for SPMD particle codes
//!
//! Module layout:
//!
//! ```text
//! lib.rs
//! ├── clock/          – integer timeline, tick ↔ time mapping, bin arithmetic
//! ├── timebins        – per-rank power-of-two timestep hierarchy
//! ├── output/         – snapshot schedule (explicit list or periodic rule)
//! ├── comm/           – collectives between ranks, in-process thread group
//! ├── interrupt/      – stop/restart markers, CPU budget, periodic checkpoints
//! ├── collab          – physics, domain and snapshot collaborator traits
//! ├── config/         – YAML run parameters
//! └── run/            – run-loop state machine, checkpoints, CPU log
//! ```

pub mod clock;
pub mod collab;
pub mod comm;
pub mod config;
pub mod interrupt;
pub mod output;
pub mod run;
pub mod timebins;
