/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Run-parameter loading and validation.
//!
//! The expected YAML structure is:
//! ```yaml
//! time_begin: 0.0
//! time_max: 1.0
//! comoving_integration_on: false
//! max_size_timestep: 0.01
//!
//! # periodic outputs ...
//! time_of_first_snapshot: 0.1
//! time_bet_snapshot: 0.1
//! # ... or an explicit list (inline or from a text file)
//! output_list_on: false
//! output_list:
//!   - { time: 0.5, kind: full }
//!   - { time: 0.9, kind: most_bound }
//! output_list_filename: outputs.txt
//!
//! time_bet_statistics: 0.05
//! time_limit_cpu: 86400
//! cpu_time_bet_restart_file: 3600
//! output_dir: ./output
//! allow_unsync_output: false
//! domain_rebuild:
//!   active_fraction: 0.01      # or: min_bin: 12
//! domain_rebuild_before_output: false
//! group_finding_on_output: false
//! resubmit_on: false
//! resubmit_command: "sbatch job.sh"
//! ```
//!
//! An output list file holds one `time [flag]` pair per line (`1` = full
//! snapshot, `2` = most-bound snapshot, default `1`); `#` starts a comment.
//! A relative `output_list_filename` is resolved against the directory of the
//! parameter file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock::math::{bin_of_granularity, snap_granularity};
use crate::clock::{ClockError, Timeline, NUM_TIMEBINS};
use crate::output::{OutputError, OutputKind, OutputListEntry, OutputSchedule};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Semantic problems in an otherwise well-formed parameter file.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Clock(#[from] ClockError),

    #[error(transparent)]
    Output(#[from] OutputError),

    #[error("max_size_timestep must be > 0 (got {0})")]
    NonPositiveMaxTimestep(f64),

    #[error("{name} must be >= 0 (got {value})")]
    NegativeBudget { name: &'static str, value: f64 },

    #[error("stop_cpu_fraction must lie in (0, 1] (got {0})")]
    InvalidStopFraction(f64),

    #[error("domain_rebuild accepts either min_bin or active_fraction, not both")]
    AmbiguousDomainRule,

    #[error("domain_rebuild.min_bin {0} is outside 0..{max}", max = NUM_TIMEBINS)]
    DomainBinOutOfRange(u8),

    #[error("domain_rebuild.active_fraction must lie in [0, 1] (got {0})")]
    InvalidActiveFraction(f64),

    #[error("resubmit_on is set but resubmit_command is empty")]
    MissingResubmitCommand,

    #[error("output list line {line}: cannot parse '{content}'")]
    OutputListLine { line: usize, content: String },
}

// ── Private YAML deserialization types ────────────────────────────────────────

/// Maps directly onto the YAML file layout.  Callers work with [`RunParams`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamFile {
    time_begin: f64,
    time_max: f64,
    #[serde(default)]
    comoving_integration_on: bool,
    max_size_timestep: f64,
    #[serde(default)]
    time_of_first_snapshot: f64,
    #[serde(default)]
    time_bet_snapshot: f64,
    #[serde(default)]
    output_list_on: bool,
    #[serde(default)]
    output_list: Vec<OutputListEntry>,
    output_list_filename: Option<PathBuf>,
    time_bet_statistics: Option<f64>,
    #[serde(default = "default_time_limit_cpu")]
    time_limit_cpu: f64,
    #[serde(default = "default_cpu_time_bet_restart_file")]
    cpu_time_bet_restart_file: f64,
    #[serde(default = "default_stop_cpu_fraction")]
    stop_cpu_fraction: f64,
    #[serde(default = "default_output_dir")]
    output_dir: PathBuf,
    #[serde(default)]
    allow_unsync_output: bool,
    #[serde(default)]
    domain_rebuild: DomainRebuildEntry,
    #[serde(default)]
    domain_rebuild_before_output: bool,
    #[serde(default)]
    group_finding_on_output: bool,
    #[serde(default)]
    resubmit_on: bool,
    #[serde(default)]
    resubmit_command: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DomainRebuildEntry {
    min_bin: Option<u8>,
    active_fraction: Option<f64>,
}

fn default_time_limit_cpu() -> f64 {
    86_400.0
}

fn default_cpu_time_bet_restart_file() -> f64 {
    3_600.0
}

/// Stop once this fraction of `time_limit_cpu` has been used.
fn default_stop_cpu_fraction() -> f64 {
    0.85
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

/// Default share of particles that must be active before the domain is rebuilt.
pub const DEFAULT_ACTIVE_FRACTION: f64 = 0.01;

// ── Public data structures ────────────────────────────────────────────────────

/// When is a synchronization point "large" enough to rebuild the domain?
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DomainRebuildRule {
    /// Rebuild when the coarsest active bin is at least this bin.
    MinBin(u8),
    /// Derive the threshold bin every step: the smallest bin whose cumulative
    /// population exceeds this fraction of all particles.
    ActiveFraction(f64),
}

impl Default for DomainRebuildRule {
    fn default() -> Self {
        DomainRebuildRule::ActiveFraction(DEFAULT_ACTIVE_FRACTION)
    }
}

/// Validated run parameters consumed by the run controller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParams {
    pub time_begin: f64,
    pub time_max: f64,
    pub comoving_integration_on: bool,
    pub max_size_timestep: f64,
    pub time_of_first_snapshot: f64,
    pub time_bet_snapshot: f64,
    pub output_list_on: bool,
    pub output_list: Vec<OutputListEntry>,
    /// `None` disables the periodic energy statistics.
    pub time_bet_statistics: Option<f64>,
    /// Wall-clock budget of one job, seconds.
    pub time_limit_cpu: f64,
    /// Seconds between automatic checkpoints.
    pub cpu_time_bet_restart_file: f64,
    pub stop_cpu_fraction: f64,
    /// Directory holding markers (`stop`, `restart`, `cont`), `cpu.txt` and
    /// `restartfiles/`.
    pub output_dir: PathBuf,
    /// Allow outputs between synchronization points (drift-only, unsnapped).
    pub allow_unsync_output: bool,
    pub domain_rebuild: DomainRebuildRule,
    pub domain_rebuild_before_output: bool,
    pub group_finding_on_output: bool,
    pub resubmit_on: bool,
    pub resubmit_command: String,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            time_begin: 0.0,
            time_max: 1.0,
            comoving_integration_on: false,
            max_size_timestep: 0.01,
            time_of_first_snapshot: 0.1,
            time_bet_snapshot: 0.1,
            output_list_on: false,
            output_list: Vec::new(),
            time_bet_statistics: None,
            time_limit_cpu: default_time_limit_cpu(),
            cpu_time_bet_restart_file: default_cpu_time_bet_restart_file(),
            stop_cpu_fraction: default_stop_cpu_fraction(),
            output_dir: default_output_dir(),
            allow_unsync_output: false,
            domain_rebuild: DomainRebuildRule::default(),
            domain_rebuild_before_output: false,
            group_finding_on_output: false,
            resubmit_on: false,
            resubmit_command: String::new(),
        }
    }
}

impl RunParams {
    /// Parse and validate the parameter file at `path`.
    ///
    /// # Errors
    /// Returns an error if the file (or its output list file) cannot be read,
    /// if the YAML is structurally invalid, or if validation fails.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        info!("Loading run parameters from: {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open parameter file: {}", path.display()))?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_yaml_str(&content, base_dir)
            .with_context(|| format!("Invalid parameter file: {}", path.display()))
    }

    /// Parse parameters from YAML text; relative file names resolve against
    /// `base_dir`.
    pub fn from_yaml_str(content: &str, base_dir: &Path) -> Result<Self> {
        let file: ParamFile = serde_yaml::from_str(content).context("Failed to parse YAML")?;

        let domain_rebuild = match (file.domain_rebuild.min_bin, file.domain_rebuild.active_fraction) {
            (Some(_), Some(_)) => return Err(ConfigError::AmbiguousDomainRule.into()),
            (Some(bin), None) => DomainRebuildRule::MinBin(bin),
            (None, Some(frac)) => DomainRebuildRule::ActiveFraction(frac),
            (None, None) => DomainRebuildRule::default(),
        };

        let mut output_list = file.output_list;
        if let Some(name) = &file.output_list_filename {
            let list_path = base_dir.join(name);
            let text = std::fs::read_to_string(&list_path).with_context(|| {
                format!("Cannot open output list file: {}", list_path.display())
            })?;
            let from_file = parse_output_list(&text)?;
            debug!(
                entries = from_file.len(),
                file = %list_path.display(),
                "read output list"
            );
            output_list.extend(from_file);
        }

        let params = RunParams {
            time_begin: file.time_begin,
            time_max: file.time_max,
            comoving_integration_on: file.comoving_integration_on,
            max_size_timestep: file.max_size_timestep,
            time_of_first_snapshot: file.time_of_first_snapshot,
            time_bet_snapshot: file.time_bet_snapshot,
            output_list_on: file.output_list_on,
            output_list,
            time_bet_statistics: file.time_bet_statistics,
            time_limit_cpu: file.time_limit_cpu,
            cpu_time_bet_restart_file: file.cpu_time_bet_restart_file,
            stop_cpu_fraction: file.stop_cpu_fraction,
            output_dir: file.output_dir,
            allow_unsync_output: file.allow_unsync_output,
            domain_rebuild,
            domain_rebuild_before_output: file.domain_rebuild_before_output,
            group_finding_on_output: file.group_finding_on_output,
            resubmit_on: file.resubmit_on,
            resubmit_command: file.resubmit_command,
        };

        params.validate()?;
        Ok(params)
    }

    /// Check every semantic constraint, including the snapshot interval bound
    /// for periodic output.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeline = self.timeline()?;

        if !(self.max_size_timestep > 0.0) {
            return Err(ConfigError::NonPositiveMaxTimestep(self.max_size_timestep));
        }
        for (name, value) in [
            ("time_limit_cpu", self.time_limit_cpu),
            ("cpu_time_bet_restart_file", self.cpu_time_bet_restart_file),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::NegativeBudget { name, value });
            }
        }
        if !(self.stop_cpu_fraction > 0.0 && self.stop_cpu_fraction <= 1.0) {
            return Err(ConfigError::InvalidStopFraction(self.stop_cpu_fraction));
        }
        match self.domain_rebuild {
            DomainRebuildRule::MinBin(bin) if bin as usize >= NUM_TIMEBINS => {
                return Err(ConfigError::DomainBinOutOfRange(bin));
            }
            DomainRebuildRule::ActiveFraction(f) if !(0.0..=1.0).contains(&f) => {
                return Err(ConfigError::InvalidActiveFraction(f));
            }
            _ => {}
        }
        if self.resubmit_on && self.resubmit_command.trim().is_empty() {
            return Err(ConfigError::MissingResubmitCommand);
        }

        if self.output_list_on {
            let outside = self
                .output_list
                .iter()
                .filter(|e| timeline.tick_of(e.time).is_none())
                .count();
            if outside > 0 {
                warn!(
                    outside,
                    total = self.output_list.len(),
                    "output list entries outside [time_begin, time_max] will be ignored"
                );
            }
        } else {
            timeline.check_snapshot_interval(self.time_bet_snapshot)?;
        }
        Ok(())
    }

    pub fn timeline(&self) -> Result<Timeline, ClockError> {
        Timeline::new(self.time_begin, self.time_max, self.comoving_integration_on)
    }

    /// The output schedule described by these parameters.
    pub fn output_schedule(&self) -> Result<OutputSchedule, ConfigError> {
        let timeline = self.timeline()?;
        let snap = !self.allow_unsync_output;
        if self.output_list_on {
            Ok(OutputSchedule::from_list(
                timeline,
                self.output_list.clone(),
                self.max_size_timestep,
                snap,
            ))
        } else {
            Ok(OutputSchedule::periodic(
                timeline,
                self.time_of_first_snapshot,
                self.time_bet_snapshot,
                self.max_size_timestep,
                snap,
            )?)
        }
    }

    /// Largest timebin a particle may occupy, derived from `max_size_timestep`
    /// on the same power-of-two grid output ticks are snapped to.
    pub fn max_timestep_bin(&self) -> Result<u8, ClockError> {
        let timeline = self.timeline()?;
        Ok(bin_of_granularity(snap_granularity(
            timeline.ticks_for_step(self.max_size_timestep),
        )))
    }
}

/// Parse the text output-list format.
pub fn parse_output_list(text: &str) -> Result<Vec<OutputListEntry>, ConfigError> {
    let mut entries = Vec::new();
    for (n, raw) in text.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let bad = || ConfigError::OutputListLine {
            line: n + 1,
            content: raw.to_string(),
        };
        let mut fields = line.split_whitespace();
        let time: f64 = fields
            .next()
            .and_then(|t| t.parse().ok())
            .ok_or_else(bad)?;
        let kind = match fields.next() {
            None => OutputKind::Full,
            Some(flag) => flag
                .parse::<i64>()
                .ok()
                .and_then(OutputKind::from_flag)
                .ok_or_else(bad)?,
        };
        if fields.next().is_some() {
            return Err(bad());
        }
        entries.push(OutputListEntry { time, kind });
    }
    Ok(entries)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
