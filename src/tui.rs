//! Utilities for terminal output during scanning.
//!
//! Accessible mode prints the bare message with no symbols or colour, which
//! keeps screen readers quiet.
use colored::Colorize;

use crate::state::{ScanState, Stage, Statistics};

/// Status line prefixed with a red `[!]`.
#[macro_export]
macro_rules! warning {
    ($name:expr) => {
        println!("{} {}", colored::Colorize::bold(colored::Colorize::red("[!]")), $name);
    };
    ($name:expr, $accessible:expr) => {
        if $accessible {
            println!("{}", $name);
        } else {
            println!("{} {}", colored::Colorize::bold(colored::Colorize::red("[!]")), $name);
        }
    };
}

/// Status line prefixed with a blue `[~]`.
#[macro_export]
macro_rules! detail {
    ($name:expr) => {
        println!("{} {}", colored::Colorize::bold(colored::Colorize::blue("[~]")), $name);
    };
    ($name:expr, $accessible:expr) => {
        if $accessible {
            println!("{}", $name);
        } else {
            println!("{} {}", colored::Colorize::bold(colored::Colorize::blue("[~]")), $name);
        }
    };
}

/// Result line prefixed with a green `[>]`.
#[macro_export]
macro_rules! output {
    ($name:expr) => {
        println!(
            "{} {}",
            colored::Colorize::bold(colored::Colorize::truecolor("[>]", 0, 255, 9)),
            $name
        );
    };
    ($name:expr, $accessible:expr) => {
        if $accessible {
            println!("{}", $name);
        } else {
            println!(
                "{} {}",
                colored::Colorize::bold(colored::Colorize::truecolor("[>]", 0, 255, 9)),
                $name
            );
        }
    };
}

/// Prints the name and version line shown at start-up.
pub fn print_opening(accessible: bool) {
    let line = format!("reconflow {}", env!("CARGO_PKG_VERSION"));
    if accessible {
        println!("{line}");
    } else {
        println!("{}", line.bold().green());
        println!("{}", "-".repeat(line.len()).dimmed());
    }
}

/// Per-outcome counts, e.g. when resuming.
pub fn print_statistics(stats: &Statistics, accessible: bool) {
    detail!(
        format!(
            "{} targets: {} complete, {} failed, {} in progress, {} pending",
            stats.total, stats.completed, stats.failed, stats.in_progress, stats.pending
        ),
        accessible
    );
    if stats.no_hosts > 0 || stats.no_ports > 0 {
        detail!(
            format!(
                "{} finished without live hosts, {} without open ports",
                stats.no_hosts, stats.no_ports
            ),
            accessible
        );
    }
    for (stage, count) in &stats.by_stage {
        if !matches!(stage, Stage::Complete | Stage::Failed | Stage::Pending) {
            detail!(format!("  {stage}: {count}"), accessible);
        }
    }
}

/// Final report printed when a run ends.
pub fn print_summary(state: &ScanState, accessible: bool) {
    let summary = state.summary();
    print_statistics(&state.statistics(), accessible);
    output!(
        format!(
            "{} live hosts, {} open ports across {} hosts",
            summary.total_hosts, summary.total_ports, summary.hosts_with_ports
        ),
        accessible
    );
    if let Some(duration) = summary.duration {
        output!(format!("Elapsed {}", format_duration(duration)), accessible);
    }

    for unit in state.units().filter(|u| u.stage == Stage::Failed) {
        warning!(
            format!(
                "{}: {}",
                unit.target,
                unit.error.as_deref().unwrap_or("unknown error")
            ),
            accessible
        );
    }
}

/// `1h 02m 03s` style, dropping leading zero units.
pub fn format_duration(duration: std::time::Duration) -> String {
    let secs = duration.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
