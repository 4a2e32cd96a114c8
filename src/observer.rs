//! Event delivery to collaborators and platform background-work hooks.

use std::path::{Path, PathBuf};

use tokio::sync::mpsc;

use crate::error::Error;

/// Trait for receiving per-asset download events.
///
/// All methods have default no-op implementations for convenience. Callbacks
/// run on the engine's tasks and should return quickly.
pub trait DownloadObserver: Send + Sync {
    /// Called when more of the asset is on disk. `fraction` never decreases
    /// for a given asset.
    fn on_progress(&self, _asset_id: &str, _received: u64, _total: u64, _fraction: f64) {}

    /// Called once the final file has been assembled.
    fn on_complete(&self, _asset_id: &str, _path: &Path) {}

    /// Called when the asset reaches the failed state.
    fn on_fail(&self, _asset_id: &str, _error: &Error) {}
}

/// An observer that ignores all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoObserver;

impl DownloadObserver for NoObserver {}

/// Events forwarded by [`ChannelObserver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress {
        asset_id: String,
        received: u64,
        total: u64,
        fraction: f64,
    },
    Completed {
        asset_id: String,
        path: PathBuf,
    },
    Failed {
        asset_id: String,
        error: String,
    },
}

impl DownloadEvent {
    /// Asset the event belongs to.
    #[must_use]
    pub fn asset_id(&self) -> &str {
        match self {
            Self::Progress { asset_id, .. }
            | Self::Completed { asset_id, .. }
            | Self::Failed { asset_id, .. } => asset_id,
        }
    }

    /// Whether this is the last event of a run.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Forwards every callback as a [`DownloadEvent`] over an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelObserver {
    /// Creates an observer and the receiving end of its channel.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: DownloadEvent) {
        if self.tx.send(event).is_err() {
            log::debug!("Event receiver dropped");
        }
    }
}

impl DownloadObserver for ChannelObserver {
    fn on_progress(&self, asset_id: &str, received: u64, total: u64, fraction: f64) {
        self.send(DownloadEvent::Progress {
            asset_id: asset_id.to_string(),
            received,
            total,
            fraction,
        });
    }

    fn on_complete(&self, asset_id: &str, path: &Path) {
        self.send(DownloadEvent::Completed {
            asset_id: asset_id.to_string(),
            path: path.to_path_buf(),
        });
    }

    fn on_fail(&self, asset_id: &str, error: &Error) {
        self.send(DownloadEvent::Failed {
            asset_id: asset_id.to_string(),
            error: error.to_string(),
        });
    }
}

/// Platform hook for extended runtime while downloads are active.
///
/// `begin_background_work` is called when the first asset becomes active and
/// `end_background_work` when the last one stops.
pub trait BackgroundWork: Send + Sync {
    fn begin_background_work(&self) {}
    fn end_background_work(&self) {}
}

/// Background-work hook for platforms without one.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackgroundWork;

impl BackgroundWork for NoBackgroundWork {}
