//! Monotonic progress reporting.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::observer::DownloadObserver;

/// Fraction of `total` covered by `received`, in `[0, 1]`.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn fraction(received: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (received as f64 / total as f64).min(1.0)
}

/// Forwards progress to an observer, never letting an asset's fraction go
/// backwards.
///
/// The high-water mark outlives a single run, so a paused and resumed asset
/// keeps reporting from where it left off.
pub struct ProgressReporter {
    observer: Arc<dyn DownloadObserver>,
    high_water: Mutex<HashMap<String, f64>>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(observer: Arc<dyn DownloadObserver>) -> Self {
        Self {
            observer,
            high_water: Mutex::new(HashMap::new()),
        }
    }

    fn high_water(&self) -> MutexGuard<'_, HashMap<String, f64>> {
        self.high_water.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reports `received` of `total` bytes and returns the fraction delivered.
    pub fn report(&self, asset_id: &str, received: u64, total: u64) -> f64 {
        let mut high_water = self.high_water();
        self.deliver(&mut high_water, asset_id, received, total)
    }

    /// Like [`report`](Self::report), but delivers nothing once `token` is
    /// cancelled.
    ///
    /// The check happens under the same lock as [`silence`](Self::silence),
    /// so no report for a run can follow its cancellation.
    pub fn report_live(
        &self,
        token: &CancellationToken,
        asset_id: &str,
        received: u64,
        total: u64,
    ) -> Option<f64> {
        let mut high_water = self.high_water();
        if token.is_cancelled() {
            return None;
        }
        Some(self.deliver(&mut high_water, asset_id, received, total))
    }

    /// Cancels `token`, waiting for any report in progress to be delivered.
    pub fn silence(&self, token: &CancellationToken) {
        let _high_water = self.high_water();
        token.cancel();
    }

    /// Forgets an asset's high-water mark.
    pub fn reset(&self, asset_id: &str) {
        self.high_water().remove(asset_id);
    }

    fn deliver(
        &self,
        high_water: &mut HashMap<String, f64>,
        asset_id: &str,
        received: u64,
        total: u64,
    ) -> f64 {
        let last = high_water.entry(asset_id.to_string()).or_insert(0.0);
        let clamped = fraction(received, total).max(*last);
        *last = clamped;
        // Delivered under the lock so events for one asset stay ordered.
        self.observer.on_progress(asset_id, received, total, clamped);
        clamped
    }
}
