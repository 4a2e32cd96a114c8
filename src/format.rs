//! Human-readable sizes, rates, fractions and durations for CLI output.

use std::time::Duration;

const KB: u64 = 1024;
const MB: u64 = KB * 1024;
const GB: u64 = MB * 1024;

/// Formats a byte count with a binary unit (B, KB, MB, GB).
#[allow(clippy::cast_precision_loss)]
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    match bytes {
        b if b >= GB => format!("{:.2} GB", b as f64 / GB as f64),
        b if b >= MB => format!("{:.2} MB", b as f64 / MB as f64),
        b if b >= KB => format!("{:.2} KB", b as f64 / KB as f64),
        b => format!("{b} B"),
    }
}

/// Formats a speed in bytes per second, e.g. "1.50 MB/s".
#[must_use]
pub fn format_rate(bytes_per_sec: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

/// Formats a `[0, 1]` fraction as a percentage with one decimal.
#[must_use]
pub fn format_percent(fraction: f64) -> String {
    format!("{:.1}%", fraction.clamp(0.0, 1.0) * 100.0)
}

/// Formats a duration, e.g. "5.0s", "1m 05s", "1h 01m 05s".
#[must_use]
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    match secs {
        s if s >= 3600 => format!("{}h {:02}m {:02}s", s / 3600, (s % 3600) / 60, s % 60),
        s if s >= 60 => format!("{}m {:02}s", s / 60, s % 60),
        s => format!("{s}.{}s", d.subsec_millis() / 100),
    }
}
