//! Formatting helpers for the statistics and state dumps.
use std::time::Duration;

/// Format a byte count (or a byte rate) with a decimal unit.
pub fn to_human_readable(n: f64) -> String {
    let units = ["B", "KB", "MB", "GB", "TB", "PB"];
    let delimiter = 1000_f64;

    // negative counts show up in credit balances
    if n.abs() < delimiter {
        return format!("{} B", n.round());
    }

    let mut n = n;
    let mut u = 0;
    while n.abs() >= delimiter && u < units.len() - 1 {
        n /= delimiter;
        u += 1;
    }

    format!("{:.2} {}", n, units[u])
}

/// Format a duration with the largest unit that keeps it above one.
pub fn format_duration(d: Duration) -> String {
    let t = d.as_secs_f64();
    if t == 0.0 {
        return "0 s".to_owned();
    }
    if t < 1e-6 {
        return format!("{:.1} ns", t * 1e9);
    }
    if t < 1e-3 {
        return format!("{:.1} us", t * 1e6);
    }
    if t < 1.0 {
        return format!("{:.1} ms", t * 1e3);
    }
    format!("{t:.1} s")
}
