//! Cargo-style status output for zbackup
//!
//! ```text
//!    Snapshot test-20240101000000 on 3 datasets
//!      Synced pool/data -> backup/pool/data (2 snapshots)
//!    Finished 3 datasets in 4.21s
//! ```

use std::io::Write as _;
use std::time::Instant;

use zbackup_core::PitObject;
use zbackup_zfs::{JobReport, SyncReport};

/// Status verbs, right-aligned to 12 chars
struct Status;

impl Status {
    const SNAPSHOT: &str = "Snapshot";
    const SYNCED: &str = "Synced";
    const RESUMED: &str = "Resumed";
    const UP_TO_DATE: &str = "Fresh";
    const MISSING: &str = "Missing";
    const FINISHED: &str = "Finished";
    const FAILED: &str = "Failed";
}

fn print_styled(style: &console::Style, status: &str, message: &str) {
    let mut term = console::Term::stderr();
    let _ = writeln!(term, "{:>12} {}", style.apply_to(status), message);
}

/// Print a cargo-style status line
fn print_status(status: &str, message: &str) {
    print_styled(&console::Style::new().green().bold(), status, message);
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("{count} {word}")
    } else {
        format!("{count} {word}s")
    }
}

fn sync_line(synced: &SyncReport) -> (&'static str, String) {
    let status = if synced.resumed {
        Status::RESUMED
    } else if synced.transferred == 0 {
        Status::UP_TO_DATE
    } else {
        Status::SYNCED
    };
    let message = format!(
        "{} -> {} ({})",
        synced.source,
        synced.target,
        plural(synced.transferred, "snapshot")
    );
    (status, message)
}

/// Timer for the summary at the end of a run
pub struct RunProgress {
    start: Instant,
}

impl RunProgress {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    /// Show what the run did
    pub fn finish(&self, report: &JobReport) {
        if let Some(suffix) = &report.snapshot {
            print_status(
                Status::SNAPSHOT,
                &format!("{suffix} on {}", plural(report.selected.len(), "dataset")),
            );
        }
        for synced in &report.synced {
            let (status, message) = sync_line(synced);
            print_status(status, &message);
        }
        for missing in &report.missing {
            print_status(Status::MISSING, &format!("{} ({:?})", missing.dataset, missing.plan.verdict));
        }

        let elapsed = self.start.elapsed();
        let elapsed_str = if elapsed.as_secs() >= 1 {
            format!("{:.2}s", elapsed.as_secs_f64())
        } else {
            format!("{}ms", elapsed.as_millis())
        };

        if report.failures == 0 {
            print_status(
                Status::FINISHED,
                &format!("{} in {elapsed_str}", plural(report.selected.len(), "dataset")),
            );
        } else {
            print_styled(
                &console::Style::new().yellow().bold(),
                Status::FAILED,
                &format!(
                    "{} of {} in {elapsed_str}",
                    report.failures,
                    plural(report.selected.len(), "dataset")
                ),
            );
        }
    }
}

impl Default for RunProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Human readable plan of every dataset, on stdout
pub fn print_plan(report: &JobReport) {
    if let Some(suffix) = &report.snapshot {
        println!("snapshot {suffix}");
    }
    for synced in &report.synced {
        let plan = &synced.plan;
        println!("{} -> {}", synced.source, synced.target);
        match &plan.common {
            Some(common) => println!("  common    {}", common.source.name()),
            None => println!("  common    (none, full transfer)"),
        }
        for snapshot in &plan.transfers {
            println!("  send      {}", snapshot.suffix);
        }
        for snapshot in &plan.incompatible {
            println!("  conflict  {}", snapshot.name());
        }
        for snapshot in &plan.source_obsoletes {
            println!("  thin src  {}", snapshot.suffix);
        }
        for snapshot in &plan.target_obsoletes {
            println!("  thin dst  {}", snapshot.suffix);
        }
    }
    for missing in &report.missing {
        println!("{} missing on source: {:?}", missing.dataset, missing.plan.verdict);
    }
}
