//! Progress bar and summary reporting for CLI downloads.

use indicatif::{ProgressBar, ProgressStyle};

use crate::coordinator::DownloadState;
use crate::format::{format_bytes, format_duration, format_percent, format_rate};
use crate::progress::fraction;
use crate::stats::TransferSummary;

const SEPARATOR: &str = "────────────────────────────────────────────────────────────";

/// Creates a byte progress bar for one asset. The length is set once the
/// first progress event arrives.
pub fn make_progress_bar(asset_id: &str) -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:40.cyan/blue}] {bytes}/{total_bytes} @ {bytes_per_sec} - {msg}",
        )
        .expect("progress template is valid")
        .progress_chars("━━╌"),
    );
    bar.set_message(asset_id.to_string());
    bar
}

/// Human-readable name of a lifecycle state.
pub const fn state_label(state: DownloadState) -> &'static str {
    match state {
        DownloadState::Idle => "not downloaded",
        DownloadState::Probing => "probing",
        DownloadState::Planning => "planning",
        DownloadState::Active => "downloading",
        DownloadState::Assembling => "assembling",
        DownloadState::Completed => "completed",
        DownloadState::Failed => "failed",
        DownloadState::Paused => "paused",
    }
}

/// Prints the stored state of one asset.
pub fn print_status(
    asset_id: &str,
    state: DownloadState,
    stored: Option<(u64, u64)>,
    path: Option<&std::path::Path>,
) {
    println!("{asset_id}: {}", state_label(state));
    if let Some((received, total)) = stored {
        println!(
            "  on disk: {} of {} ({})",
            format_bytes(received),
            format_bytes(total),
            format_percent(fraction(received, total))
        );
    }
    if let Some(path) = path {
        println!("  file: {}", path.display());
    }
}

/// Prints a summary of a completed download.
pub fn print_summary(summary: &TransferSummary) {
    println!("\n{SEPARATOR}");
    println!("Download Summary");
    println!("{SEPARATOR}");
    println!("  Asset:             {}", summary.asset_id);
    println!("  File:              {}", summary.path.display());
    println!("  Size:              {}", format_bytes(summary.size));
    if summary.transferred < summary.size {
        println!(
            "  Fetched this run:  {} (rest resumed from disk)",
            format_bytes(summary.transferred)
        );
    }
    println!("  Total time:        {}", format_duration(summary.elapsed));
    println!("  Average speed:     {}", format_rate(summary.average_speed));
    println!("  Peak speed:        {}", format_rate(summary.peak_speed));
    println!("{SEPARATOR}");
}
