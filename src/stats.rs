//! Transfer statistics for a single download run.

use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub asset_id: String,
    pub path: PathBuf,
    /// Size of the assembled file.
    pub size: u64,
    /// Bytes fetched during this run. Less than `size` after a resume.
    pub transferred: u64,
    pub elapsed: Duration,
    /// Average speed over the run in bytes per second.
    pub average_speed: u64,
    /// Highest sampled speed in bytes per second.
    pub peak_speed: u64,
}

/// Tracks speed from the cumulative byte counts in progress events.
///
/// The first sample is taken as the starting point, so bytes already on disk
/// from an earlier run do not count towards the speed.
#[derive(Debug)]
pub struct TransferStats {
    start_time: Instant,
    baseline: Option<u64>,
    latest: u64,
    last_sample: Option<(Instant, u64)>,
    peak_speed: u64,
}

impl Default for TransferStats {
    fn default() -> Self {
        Self::new()
    }
}

impl TransferStats {
    #[must_use]
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            baseline: None,
            latest: 0,
            last_sample: None,
            peak_speed: 0,
        }
    }

    /// Records the asset's cumulative received bytes.
    ///
    /// Returns the speed since the previous sample in bytes per second.
    pub fn record(&mut self, received: u64) -> u64 {
        self.record_at(received, Instant::now())
    }

    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn record_at(&mut self, received: u64, now: Instant) -> u64 {
        self.baseline.get_or_insert(received);
        self.latest = self.latest.max(received);

        let speed = match self.last_sample {
            Some((at, bytes)) => {
                let secs = now.saturating_duration_since(at).as_secs_f64();
                if secs > 0.0 {
                    (received.saturating_sub(bytes) as f64 / secs) as u64
                } else {
                    0
                }
            }
            None => 0,
        };
        self.last_sample = Some((now, received));
        self.peak_speed = self.peak_speed.max(speed);
        speed
    }

    /// Bytes received since the first sample.
    #[must_use]
    pub fn transferred(&self) -> u64 {
        self.latest.saturating_sub(self.baseline.unwrap_or(self.latest))
    }

    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    #[must_use]
    pub const fn peak_speed(&self) -> u64 {
        self.peak_speed
    }

    /// Average speed over the run in bytes per second.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn average_speed(&self) -> u64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            (self.transferred() as f64 / secs) as u64
        } else {
            0
        }
    }

    /// Converts the tracker into a summary for the assembled file.
    #[must_use]
    pub fn into_summary(self, asset_id: &str, path: PathBuf, size: u64) -> TransferSummary {
        TransferSummary {
            asset_id: asset_id.to_string(),
            path,
            size,
            transferred: self.transferred(),
            elapsed: self.elapsed(),
            average_speed: self.average_speed(),
            peak_speed: self.peak_speed,
        }
    }
}
