/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

use std::path::PathBuf;
use std::process;

use clap::Parser;
use tracing::{error, info, warn};

use kairos_core::clock::math::step_of_bin;
use kairos_core::clock::TIMEBASE;
use kairos_core::config::RunParams;

// ── CLI argument definition ───────────────────────────────────────────────────

/// Kairos schedule inspector.
///
/// Loads a run parameter file and prints the timeline and the output ticks the
/// run loop would use.
///
/// Example:
///   kairos --params run.yaml --max-outputs 20
#[derive(Debug, Parser)]
#[command(
    name = "kairos",
    about = "Kairos – inspect the timeline and output schedule of a run",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML run parameter file.
    #[arg(short = 'c', long = "params")]
    params: PathBuf,

    /// Maximum number of outputs to list.
    #[arg(short = 'n', long = "max-outputs", default_value_t = 100)]
    max_outputs: usize,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    // Initialise structured logging.
    // Level is controlled by the RUST_LOG env-var (e.g. RUST_LOG=debug).
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(e) = inspect(&cli) {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn inspect(cli: &Cli) -> anyhow::Result<()> {
    let params = RunParams::load_from_file(&cli.params)?;
    let timeline = params.timeline()?;
    let schedule = params.output_schedule()?;
    let max_bin = params.max_timestep_bin()?;

    info!(
        time_begin = timeline.time_begin(),
        time_max   = timeline.time_max(),
        comoving   = timeline.is_comoving(),
        interval   = timeline.interval(),
        "Timeline"
    );
    info!(
        max_timestep_bin = max_bin,
        max_step_ticks = step_of_bin(max_bin),
        granularity = ?schedule.granularity(),
        "Timestep limits"
    );
    if params.allow_unsync_output {
        warn!("Unsynchronized output enabled: output ticks are not snapped");
    }

    let outputs = schedule.upcoming(0, cli.max_outputs)?;
    info!("{} output(s) scheduled:", outputs.len());
    for (seq, out) in outputs.iter().enumerate() {
        info!(
            "  [{seq:03}]  tick={tick:>10}  time={time:.6}  kind={kind:?}{end}",
            tick = out.tick,
            time = timeline.time_of(out.tick),
            kind = out.kind,
            end = if out.tick == TIMEBASE { "  (end of run)" } else { "" },
        );
    }
    if outputs.last().map_or(true, |o| o.tick != TIMEBASE) {
        info!("  a final full snapshot will be written at the end of the run");
    }
    Ok(())
}
