/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Wall-clock accounting per run-loop phase.
//!
//! Every rank times its own phases; rank 0 additionally appends one line per
//! step to `<output_dir>/cpu.txt`:
//!
//! ```text
//! # step time cpu_total sync domain_rebuild ... interrupt_check
//! 12 0.0234375 1.532 0.002 0.410 ... 0.001
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use super::Phase;

#[derive(Debug)]
pub struct CpuLog {
    started: Instant,
    /// CPU seconds spent in earlier jobs of the same run.
    cpu_before: f64,
    per_phase: [f64; Phase::COUNT],
    writer: Option<BufWriter<File>>,
}

impl CpuLog {
    /// Start the clock.  `file` is `Some(output_dir)` on the rank that keeps
    /// `cpu.txt`; `resume` appends to an existing log instead of starting over.
    pub fn start(file: Option<&Path>, cpu_before: f64, resume: bool) -> io::Result<Self> {
        let writer = match file {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                let path = dir.join("cpu.txt");
                let f = if resume {
                    OpenOptions::new().create(true).append(true).open(path)?
                } else {
                    File::create(path)?
                };
                let mut w = BufWriter::new(f);
                if !resume {
                    write!(w, "# step time cpu_total")?;
                    for phase in Phase::ALL {
                        write!(w, " {}", phase.name())?;
                    }
                    writeln!(w)?;
                }
                Some(w)
            }
            None => None,
        };
        Ok(Self {
            started: Instant::now(),
            cpu_before,
            per_phase: [0.0; Phase::COUNT],
            writer,
        })
    }

    /// Charge the time since `since` to `phase`.
    pub fn record(&mut self, phase: Phase, since: Instant) {
        self.per_phase[phase.index()] += since.elapsed().as_secs_f64();
    }

    /// Seconds spent in `phase` during this job.
    pub fn phase_total(&self, phase: Phase) -> f64 {
        self.per_phase[phase.index()]
    }

    /// Seconds since this job started.
    pub fn cpu_this_run(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    pub fn cpu_total(&self) -> f64 {
        self.cpu_before + self.cpu_this_run()
    }

    pub fn log_step(&mut self, step: u64, time: f64) -> io::Result<()> {
        let total = self.cpu_total();
        if let Some(w) = self.writer.as_mut() {
            write!(w, "{step} {time} {total:.3}")?;
            for t in &self.per_phase {
                write!(w, " {t:.3}")?;
            }
            writeln!(w)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.writer.as_mut() {
            Some(w) => w.flush(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_header_and_one_line_per_step() {
        let dir = tempdir().unwrap();
        let mut log = CpuLog::start(Some(dir.path()), 0.0, false).unwrap();
        log.record(Phase::Sync, Instant::now());
        log.log_step(1, 0.5).unwrap();
        log.log_step(2, 0.75).unwrap();
        log.flush().unwrap();

        let text = std::fs::read_to_string(dir.path().join("cpu.txt")).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("# step time cpu_total sync"));
        assert!(lines[2].starts_with("2 0.75 "));
        assert_eq!(lines[2].split_whitespace().count(), 3 + Phase::ALL.len());
    }

    #[test]
    fn resume_appends() {
        let dir = tempdir().unwrap();
        let mut first = CpuLog::start(Some(dir.path()), 0.0, false).unwrap();
        first.log_step(1, 0.1).unwrap();
        first.flush().unwrap();
        drop(first);

        let mut second = CpuLog::start(Some(dir.path()), 100.0, true).unwrap();
        assert!(second.cpu_total() >= 100.0);
        second.log_step(2, 0.2).unwrap();
        second.flush().unwrap();

        let text = std::fs::read_to_string(dir.path().join("cpu.txt")).unwrap();
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn ranks_without_a_file_still_time_phases() {
        let mut log = CpuLog::start(None, 0.0, false).unwrap();
        let t0 = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(2));
        log.record(Phase::SnapshotCheck, t0);
        assert!(log.phase_total(Phase::SnapshotCheck) > 0.0);
        assert_eq!(log.phase_total(Phase::Sync), 0.0);
        log.log_step(1, 0.0).unwrap();
    }
}
