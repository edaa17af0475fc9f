/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! toy-run – drive the run controller with the synthetic simulation.
//!
//! Example:
//!   toy-run --params run.yaml --ranks 4 --particles 64
//!   touch output/stop            # from another shell: checkpoint and stop
//!   toy-run --params run.yaml --ranks 4 --resume

use std::path::PathBuf;
use std::process;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use kairos_core::config::RunParams;
use kairos_core::run::RunOutcome;
use kairos_sim::{run_group, Recorder, ToyConfig};

#[derive(Debug, Parser)]
#[command(
    name = "toy-run",
    about = "Run the synthetic particle simulation under Kairos run control",
    long_about = None,
)]
struct Cli {
    /// Path to the YAML run parameter file.
    #[arg(short = 'c', long = "params")]
    params: PathBuf,

    /// Number of in-process ranks.
    #[arg(short = 'r', long = "ranks", default_value_t = 2)]
    ranks: usize,

    /// Initial particles per rank.
    #[arg(short = 'n', long = "particles", default_value_t = 16)]
    particles: usize,

    /// Continue from the checkpoints in the output directory.
    #[arg(long = "resume", default_value_t = false)]
    resume: bool,

    /// Spawn one particle per rank every N steps.
    #[arg(long = "spawn-every")]
    spawn_every: Option<u64>,

    /// Inject a failure at this step (tests group abort).
    #[arg(long = "fail-at-step")]
    fail_at_step: Option<u64>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

/// Returns `false` if any rank failed.
async fn run(cli: Cli) -> Result<bool> {
    let params = RunParams::load_from_file(&cli.params)?;
    let toy = ToyConfig {
        particles: cli.particles,
        spawn_every: cli.spawn_every,
        fail_at_step: cli.fail_at_step,
        ..ToyConfig::default()
    };
    info!(
        ranks     = cli.ranks,
        particles = cli.particles,
        resume    = cli.resume,
        output    = %params.output_dir.display(),
        "Starting toy run"
    );

    let recorder = Recorder::default();
    let results = run_group(params, cli.ranks, toy, cli.resume, recorder.clone()).await?;

    let mut ok = true;
    for (rank, result) in results.iter().enumerate() {
        match result {
            Ok(RunOutcome::Completed) => info!(rank, "completed"),
            Ok(RunOutcome::Interrupted(decision)) => info!(rank, ?decision, "interrupted"),
            Err(e) => {
                error!(rank, "{:#}", e);
                ok = false;
            }
        }
    }

    let root = recorder.rank(0);
    info!(
        sync_points   = root.sync_ticks.len(),
        snapshots     = root.snapshots.len(),
        domain_builds = root.domain_builds,
        "Rank 0 summary"
    );
    Ok(ok)
}
