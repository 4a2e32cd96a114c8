//! resumable-dl - Segmented, resumable HTTP downloads.
//!
//! Assets are split into fixed-size byte ranges that are fetched in parallel
//! (optionally alternating between two mirror hosts), persisted one file per
//! segment, and concatenated into the final file once every segment is on
//! disk. Progress survives pauses and process restarts: on resume only the
//! segments missing from disk are requested again.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use resumable_dl::{ChannelObserver, DownloadCoordinator, DownloadEvent, EngineConfig, ReqwestTransport};
//!
//! # async fn example() -> resumable_dl::Result<()> {
//! let config = EngineConfig::default().with_max_concurrent_segments(4);
//! let transport = Arc::new(ReqwestTransport::new(config.request_timeout())?);
//! let (observer, mut events) = ChannelObserver::channel();
//!
//! let coordinator = DownloadCoordinator::new(config, "/tmp/rdl", transport, Arc::new(observer))?;
//! coordinator
//!     .start_download("intro-video", "https://cdn.example.com/intro.mp4")
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     match event {
//!         DownloadEvent::Progress { fraction, .. } => println!("{:.0}%", fraction * 100.0),
//!         DownloadEvent::Completed { path, .. } => {
//!             println!("saved to {}", path.display());
//!             break;
//!         }
//!         DownloadEvent::Failed { error, .. } => {
//!             eprintln!("failed: {error}");
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod assembler;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fetch;
pub mod format;
pub mod fs;
pub mod layout;
pub mod metadata;
pub mod observer;
pub mod origin;
pub mod plan;
pub mod probe;
pub mod progress;
pub mod scheduler;
pub mod stats;
pub mod transport;

// Re-export main types for convenience
pub use config::{AppConfig, EngineConfig, MirrorRule, StorageConfig};
pub use coordinator::{DownloadCoordinator, DownloadState};
pub use error::{AssembleError, Error, FetchError, ProbeError, Result};
pub use format::{format_bytes, format_duration};
pub use fs::{FileSystem, TokioFileSystem};
pub use metadata::{DownloadMetadata, MetadataStore};
pub use observer::{
    BackgroundWork, ChannelObserver, DownloadEvent, DownloadObserver, NoBackgroundWork, NoObserver,
};
pub use plan::{ByteRange, SegmentPlan};
pub use transport::{HeadResponse, RangeResponse, ReqwestTransport, Transport, TransportError};
