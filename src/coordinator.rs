//! Asset lifecycle: start, pause, resume, remove, and queries.
//!
//! The coordinator owns a registry of active assets. Each active asset has a
//! cancellation token, a generation number and a driver task that walks the
//! asset through probing, planning, segment fetching and assembly. Callbacks
//! from a driver whose generation has been superseded are dropped, so a
//! restarted asset never sees events from its previous run.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::assembler::Assembler;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::fetch::SegmentFetcher;
use crate::fs::{FileSystem, TokioFileSystem};
use crate::layout::{SegmentStore, StorageLayout};
use crate::metadata::{DownloadMetadata, MetadataStore};
use crate::observer::{BackgroundWork, DownloadObserver, NoBackgroundWork};
use crate::origin::{OriginPair, parse_url, resolve_extension};
use crate::probe::{ProbeInfo, SizeProbe};
use crate::progress::ProgressReporter;
use crate::scheduler::DownloadScheduler;
use crate::transport::Transport;

/// Where an asset is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    /// Nothing known about the asset.
    Idle,
    /// Discovering the resource size.
    Probing,
    /// Reconciling metadata and building the segment plan.
    Planning,
    /// Fetching segments.
    Active,
    /// Concatenating segments into the final file.
    Assembling,
    /// The final file exists.
    Completed,
    /// The last run ended in an error.
    Failed,
    /// Partial data exists but nothing is running.
    Paused,
}

struct ActiveDownload {
    generation: u64,
    token: CancellationToken,
    state: DownloadState,
    handle: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Registry {
    active: HashMap<String, ActiveDownload>,
    failed: HashSet<String>,
    next_generation: u64,
}

/// Whether to keep downloading from the previously stored URL.
///
/// The stored target wins only while it has strictly fewer bytes left than
/// the new target has in total.
#[must_use]
pub const fn prefer_existing_target(existing_remaining: u64, new_total: u64) -> bool {
    existing_remaining < new_total
}

struct Inner {
    config: Arc<EngineConfig>,
    probe: SizeProbe,
    scheduler: DownloadScheduler,
    assembler: Assembler,
    segments: SegmentStore,
    metadata: Arc<MetadataStore>,
    progress: ProgressReporter,
    observer: Arc<dyn DownloadObserver>,
    background: Arc<dyn BackgroundWork>,
    registry: Mutex<Registry>,
}

/// Entry point for starting, pausing and removing segmented downloads.
///
/// Cheap to clone; clones share the same registry and storage.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    /// Creates a coordinator storing data under `root` on the local disk.
    ///
    /// Existing metadata records under `root` are loaded, so downloads
    /// interrupted by a previous process can be resumed with
    /// [`start_download`](Self::start_download).
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata directory cannot be created or read.
    pub fn new(
        config: EngineConfig,
        root: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        observer: Arc<dyn DownloadObserver>,
    ) -> Result<Self> {
        Self::with_parts(
            config,
            root,
            transport,
            Arc::new(TokioFileSystem::new()),
            observer,
            Arc::new(NoBackgroundWork),
        )
    }

    /// Creates a coordinator with every collaborator supplied by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata directory cannot be created or read.
    pub fn with_parts(
        config: EngineConfig,
        root: impl Into<PathBuf>,
        transport: Arc<dyn Transport>,
        fs: Arc<dyn FileSystem>,
        observer: Arc<dyn DownloadObserver>,
        background: Arc<dyn BackgroundWork>,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let layout = StorageLayout::new(root);
        let metadata = Arc::new(MetadataStore::open(layout.metadata_dir())?);
        let segments = SegmentStore::new(layout, Arc::clone(&fs));
        let timeout = config.request_timeout();

        let probe = SizeProbe::new(Arc::clone(&transport), timeout);
        let fetcher = SegmentFetcher::new(transport, fs, timeout);
        let scheduler = DownloadScheduler::new(
            Arc::clone(&config),
            fetcher,
            segments.clone(),
            Arc::clone(&metadata),
        );
        let assembler = Assembler::new(segments.clone(), Arc::clone(&metadata));

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                probe,
                scheduler,
                assembler,
                segments,
                metadata,
                progress: ProgressReporter::new(Arc::clone(&observer)),
                observer,
                background,
                registry: Mutex::new(Registry::default()),
            }),
        })
    }

    /// Starts or resumes downloading `asset_id` from `url`.
    ///
    /// Any run already in progress for the asset is cancelled and awaited
    /// first. The work itself happens on a spawned task; the outcome is
    /// reported through the observer.
    ///
    /// If the asset already has metadata for a different URL, the engine
    /// decides between continuing the stored target and switching to `url`
    /// based on how much data each would still need.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] for an empty asset id or an unusable
    /// URL. The observer's `on_fail` is called as well.
    pub async fn start_download(&self, asset_id: &str, url: &str) -> Result<()> {
        let validation = if asset_id.is_empty() {
            Err(Error::InvalidState("empty asset id".into()))
        } else {
            parse_url(url).map(|_| ())
        };
        if let Err(e) = validation {
            log::error!("{asset_id}: cannot start: {e}");
            self.inner.lock().failed.insert(asset_id.to_string());
            self.inner.observer.on_fail(asset_id, &e);
            return Err(e);
        }

        self.inner.cancel_active(asset_id).await;

        let token = CancellationToken::new();
        let generation = {
            let mut registry = self.inner.lock();
            registry.next_generation += 1;
            let generation = registry.next_generation;
            registry.failed.remove(asset_id);
            let was_idle = registry.active.is_empty();
            let previous = registry.active.insert(
                asset_id.to_string(),
                ActiveDownload {
                    generation,
                    token: token.clone(),
                    state: DownloadState::Probing,
                    handle: None,
                },
            );
            if let Some(previous) = previous {
                previous.token.cancel();
            }
            if was_idle {
                self.inner.background.begin_background_work();
            }
            generation
        };

        log::info!("{asset_id}: starting from {url}");
        let inner = Arc::clone(&self.inner);
        let task_asset = asset_id.to_string();
        let task_url = url.to_string();
        let handle = tokio::spawn(async move {
            inner.drive(task_asset, task_url, generation, token).await;
        });

        let mut registry = self.inner.lock();
        if let Some(entry) = registry.active.get_mut(asset_id)
            && entry.generation == generation
        {
            entry.handle = Some(handle);
        }
        Ok(())
    }

    /// Pauses an asset, keeping its segments and metadata.
    ///
    /// Returns once the asset's driver has stopped. No further callbacks are
    /// delivered for the cancelled run. Returns `false` if the asset was not
    /// active.
    pub async fn cancel_download(&self, asset_id: &str) -> bool {
        let was_active = self.inner.cancel_active(asset_id).await;
        if was_active {
            log::info!("{asset_id}: paused");
        }
        was_active
    }

    /// Cancels an asset and deletes everything stored for it: segments,
    /// final output and metadata.
    ///
    /// # Errors
    ///
    /// Returns an error if files exist but cannot be deleted.
    pub async fn remove_download_completely(&self, asset_id: &str) -> Result<()> {
        self.inner.cancel_active(asset_id).await;
        self.inner.segments.remove_all(asset_id).await?;
        self.inner.segments.remove_output(asset_id).await?;
        self.inner.metadata.remove(asset_id)?;
        self.inner.progress.reset(asset_id);
        self.inner.lock().failed.remove(asset_id);
        log::info!("{asset_id}: removed");
        Ok(())
    }

    /// Whether a run is in progress for the asset.
    #[must_use]
    pub fn is_active(&self, asset_id: &str) -> bool {
        self.inner.lock().active.contains_key(asset_id)
    }

    /// Ids of assets with a run in progress.
    #[must_use]
    pub fn active_assets(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().active.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of assets with stored metadata, i.e. downloads that can be resumed.
    #[must_use]
    pub fn resumable_assets(&self) -> Vec<String> {
        self.inner.metadata.asset_ids()
    }

    /// Whether the asset has metadata and at least one finished segment.
    pub async fn has_partial_data(&self, asset_id: &str) -> bool {
        match self.inner.metadata.load(asset_id) {
            Some(record) => self.inner.has_partial(&record).await,
            None => false,
        }
    }

    /// Bytes recorded on disk and total size for an asset with stored
    /// metadata.
    #[must_use]
    pub fn stored_progress(&self, asset_id: &str) -> Option<(u64, u64)> {
        let record = self.inner.metadata.load(asset_id)?;
        let plan = record.plan(self.inner.config.chunk_size).ok()?;
        Some((plan.bytes_for(&record.finished_segments), record.total_size))
    }

    /// Whether the asset's final file exists.
    pub async fn local_file_exists(&self, asset_id: &str) -> bool {
        self.inner.segments.find_final(asset_id).await.is_some()
    }

    /// Path of the asset's final file, if it has been assembled.
    pub async fn local_file_path(&self, asset_id: &str) -> Option<PathBuf> {
        self.inner.segments.find_final(asset_id).await
    }

    /// Current lifecycle state of the asset.
    pub async fn state(&self, asset_id: &str) -> DownloadState {
        {
            let registry = self.inner.lock();
            if let Some(entry) = registry.active.get(asset_id) {
                return entry.state;
            }
            if registry.failed.contains(asset_id) {
                return DownloadState::Failed;
            }
        }
        if self.local_file_exists(asset_id).await {
            DownloadState::Completed
        } else if self.inner.metadata.load(asset_id).is_some() {
            DownloadState::Paused
        } else {
            DownloadState::Idle
        }
    }

    /// Storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.inner.segments.layout().root()
    }

    /// Engine configuration in use.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, asset_id: &str, generation: u64) -> bool {
        self.lock()
            .active
            .get(asset_id)
            .is_some_and(|entry| entry.generation == generation)
    }

    fn set_state(&self, asset_id: &str, generation: u64, state: DownloadState) {
        if let Some(entry) = self.lock().active.get_mut(asset_id)
            && entry.generation == generation
        {
            entry.state = state;
        }
    }

    /// Removes the asset from the registry if `generation` is still current.
    ///
    /// Returns whether it was.
    fn deregister(&self, asset_id: &str, generation: u64, failed: bool) -> bool {
        let mut registry = self.lock();
        let current = registry
            .active
            .get(asset_id)
            .is_some_and(|entry| entry.generation == generation);
        if !current {
            return false;
        }
        registry.active.remove(asset_id);
        if failed {
            registry.failed.insert(asset_id.to_string());
        }
        if registry.active.is_empty() {
            self.background.end_background_work();
        }
        true
    }

    /// Cancels the asset's run, if any, and waits for its driver to exit.
    async fn cancel_active(&self, asset_id: &str) -> bool {
        let snapshot = self
            .lock()
            .active
            .get(asset_id)
            .map(|entry| (entry.generation, entry.token.clone()));
        let Some((generation, token)) = snapshot else {
            return false;
        };
        // The run goes quiet before the asset leaves the registry.
        self.progress.silence(&token);

        let handle = {
            let mut registry = self.lock();
            let current = registry
                .active
                .get(asset_id)
                .is_some_and(|entry| entry.generation == generation);
            if !current {
                return true;
            }
            let entry = registry.active.remove(asset_id);
            if registry.active.is_empty() {
                self.background.end_background_work();
            }
            entry.and_then(|entry| entry.handle)
        };

        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            log::warn!("{asset_id}: driver task ended abnormally: {e}");
        }
        true
    }

    async fn has_partial(&self, record: &DownloadMetadata) -> bool {
        !record.finished_segments.is_empty() || self.segments.has_any(&record.asset_id).await
    }

    async fn drive(
        self: Arc<Self>,
        asset_id: String,
        url: String,
        generation: u64,
        token: CancellationToken,
    ) {
        let result = self.run(&asset_id, &url, generation, &token).await;
        match result {
            Ok(path) => {
                if self.deregister(&asset_id, generation, false) {
                    self.progress.reset(&asset_id);
                    self.observer.on_complete(&asset_id, &path);
                }
            }
            Err(Error::Cancelled) => {
                log::debug!("{asset_id}: run {generation} cancelled");
                self.deregister(&asset_id, generation, false);
            }
            Err(e) => {
                log::error!("{asset_id}: download failed: {e}");
                if self.deregister(&asset_id, generation, true) {
                    self.observer.on_fail(&asset_id, &e);
                }
            }
        }
    }

    async fn run(
        &self,
        asset_id: &str,
        url: &str,
        generation: u64,
        token: &CancellationToken,
    ) -> Result<PathBuf> {
        let record = tokio::select! {
            biased;
            () = token.cancelled() => return Err(Error::Cancelled),
            record = self.resolve_target(asset_id, url) => record?,
        };

        self.set_state(asset_id, generation, DownloadState::Planning);
        let origins = OriginPair::resolve(&record.origin_url, &self.config.mirrors)?;
        log::debug!("{asset_id}: origins {} / {}", origins.a(), origins.b());

        self.set_state(asset_id, generation, DownloadState::Active);
        let plan = self
            .scheduler
            .run(asset_id, &origins, token, &self.progress)
            .await?;

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }
        self.set_state(asset_id, generation, DownloadState::Assembling);
        let path = self
            .assembler
            .assemble(asset_id, plan.segment_count(), &record.final_extension)
            .await?;
        Ok(path)
    }

    /// Picks the metadata record the run will download.
    async fn resolve_target(&self, asset_id: &str, url: &str) -> Result<DownloadMetadata> {
        match self.metadata.load(asset_id) {
            Some(existing) if existing.total_size > 0 && existing.origin_url == url => {
                log::info!("{asset_id}: resuming");
                Ok(existing)
            }
            Some(existing) if existing.total_size > 0 => self.reconcile_url_change(existing, url).await,
            _ => {
                let info = self.probe.probe(url).await?;
                self.start_fresh(asset_id, url, &info).await
            }
        }
    }

    /// Chooses between the stored URL and a new one for the same asset.
    async fn reconcile_url_change(
        &self,
        existing: DownloadMetadata,
        new_url: &str,
    ) -> Result<DownloadMetadata> {
        let asset_id = existing.asset_id.clone();
        let new_info = match self.probe.probe(new_url).await {
            Ok(info) => info,
            Err(e) => {
                if self.has_partial(&existing).await {
                    log::warn!(
                        "{asset_id}: new URL unusable ({e}), continuing with {}",
                        existing.origin_url
                    );
                    return Ok(existing);
                }
                return Err(e.into());
            }
        };

        match self.probe.probe(&existing.origin_url).await {
            Err(e) => {
                log::info!("{asset_id}: stored URL unreachable ({e}), switching to {new_url}");
                self.start_fresh(&asset_id, new_url, &new_info).await
            }
            Ok(old_info) if old_info.size != existing.total_size => {
                log::info!(
                    "{asset_id}: stored URL changed size ({} -> {}), switching to {new_url}",
                    existing.total_size,
                    old_info.size
                );
                self.start_fresh(&asset_id, new_url, &new_info).await
            }
            Ok(_) => {
                let remaining = existing.remaining_bytes(self.config.chunk_size);
                if prefer_existing_target(remaining, new_info.size) {
                    log::info!(
                        "{asset_id}: keeping stored URL ({remaining} bytes left vs {} new)",
                        new_info.size
                    );
                    Ok(existing)
                } else {
                    log::info!(
                        "{asset_id}: switching to {new_url} ({remaining} bytes left vs {} new)",
                        new_info.size
                    );
                    self.start_fresh(&asset_id, new_url, &new_info).await
                }
            }
        }
    }

    /// Discards any stored data and writes a new record for `url`.
    async fn start_fresh(&self, asset_id: &str, url: &str, info: &ProbeInfo) -> Result<DownloadMetadata> {
        self.segments.remove_all(asset_id).await?;
        self.segments.remove_output(asset_id).await?;
        let extension = resolve_extension(url, info.content_type.as_deref());
        let record = DownloadMetadata::new(asset_id, url, info.size, extension)
            .with_chunk_size(self.config.chunk_size);
        self.metadata.save(&record)?;
        log::info!("{asset_id}: new target {url} ({} bytes)", info.size);
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::{ChannelObserver, DownloadEvent};
    use crate::transport::mock::MockTransport;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    const OLD: &str = "http://h.example/old.mp4";
    const NEW: &str = "http://h.example/new.mp4";

    #[derive(Default)]
    struct CountingBackground {
        begins: AtomicUsize,
        ends: AtomicUsize,
    }

    impl BackgroundWork for CountingBackground {
        fn begin_background_work(&self) {
            self.begins.fetch_add(1, Ordering::SeqCst);
        }

        fn end_background_work(&self) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        dir: TempDir,
        transport: Arc<MockTransport>,
        coordinator: DownloadCoordinator,
        events: UnboundedReceiver<DownloadEvent>,
        background: Arc<CountingBackground>,
    }

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_chunk_size(4)
            .with_max_concurrent_segments(2)
            .with_max_retries_per_segment(1)
            .with_retry_delay(Duration::from_millis(5))
            .with_request_timeout(Duration::from_secs(2))
    }

    fn harness_with(config: EngineConfig) -> Harness {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        let (observer, events) = ChannelObserver::channel();
        let background = Arc::new(CountingBackground::default());
        let coordinator = DownloadCoordinator::with_parts(
            config,
            dir.path(),
            transport.clone(),
            Arc::new(TokioFileSystem::new()),
            Arc::new(observer),
            background.clone(),
        )
        .unwrap();
        Harness {
            dir,
            transport,
            coordinator,
            events,
            background,
        }
    }

    fn harness() -> Harness {
        harness_with(config())
    }

    async fn next_terminal(events: &mut UnboundedReceiver<DownloadEvent>) -> DownloadEvent {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                let event = events.recv().await.expect("channel open");
                if event.is_terminal() {
                    return event;
                }
            }
        })
        .await
        .expect("terminal event")
    }

    /// Writes a record for `url` with the given finished segments and their files.
    fn seed_partial(h: &Harness, url: &str, total: u64, finished: &[u64]) {
        let layout = StorageLayout::new(h.dir.path());
        let store = MetadataStore::open(layout.metadata_dir()).unwrap();
        let mut record = DownloadMetadata::new("v1", url, total, "mp4").with_chunk_size(4);
        std::fs::create_dir_all(layout.segment_dir("v1")).unwrap();
        let plan = record.plan(4).unwrap();
        for &i in finished {
            let len = plan.range(i).unwrap().len();
            #[allow(clippy::cast_possible_truncation)]
            std::fs::write(layout.segment_path("v1", i), vec![b'x'; len as usize]).unwrap();
            record.finished_segments.insert(i);
        }
        store.save(&record).unwrap();
    }

    /// Rebuilds the coordinator so it picks up records written behind its back.
    fn reopen(h: Harness) -> Harness {
        let chunk = h.coordinator.config().chunk_size;
        reopen_with(h, config().with_chunk_size(chunk))
    }

    fn reopen_with(h: Harness, config: EngineConfig) -> Harness {
        let (observer, events) = ChannelObserver::channel();
        let coordinator = DownloadCoordinator::with_parts(
            config,
            h.dir.path(),
            h.transport.clone(),
            Arc::new(TokioFileSystem::new()),
            Arc::new(observer),
            h.background.clone(),
        )
        .unwrap();
        Harness {
            coordinator,
            events,
            ..h
        }
    }

    #[tokio::test]
    async fn downloads_ten_bytes_end_to_end() {
        let mut h = harness();
        h.transport.serve(OLD, &b"0123456789"[..], Some("video/mp4"));

        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Completed { path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };

        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
        assert_eq!(path.extension().unwrap(), "mp4");
        assert!(!h.coordinator.is_active("v1"));
        assert!(h.coordinator.local_file_exists("v1").await);
        assert_eq!(h.coordinator.local_file_path("v1").await, Some(path));
        assert!(!h.coordinator.has_partial_data("v1").await);
        assert_eq!(h.coordinator.state("v1").await, DownloadState::Completed);
        assert!(h.coordinator.resumable_assets().is_empty());

        let ranges: Vec<_> = h.transport.gets().into_iter().map(|(_, r)| (r.start, r.end)).collect();
        assert_eq!(ranges.len(), 3);
        for expected in [(0, 3), (4, 7), (8, 9)] {
            assert!(ranges.contains(&expected));
        }
    }

    #[tokio::test]
    async fn pause_and_resume_produces_identical_file() {
        let data: Vec<u8> = (0..=255u8).cycle().take(400).collect();
        let mut h = harness_with(config().with_chunk_size(10).with_max_concurrent_segments(1));
        h.transport.serve(OLD, data.clone(), None);
        h.transport.set_latency(Duration::from_millis(10));

        h.coordinator.start_download("v1", OLD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(h.coordinator.cancel_download("v1").await);
        assert!(!h.coordinator.is_active("v1"));
        assert!(h.coordinator.has_partial_data("v1").await);
        assert_eq!(h.coordinator.state("v1").await, DownloadState::Paused);
        let fetched_before = h.transport.gets().len();

        // Only progress from the cancelled run, never a terminal event.
        while let Ok(event) = h.events.try_recv() {
            assert!(!event.is_terminal());
        }

        h.transport.set_latency(Duration::ZERO);
        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Completed { path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        assert_eq!(std::fs::read(path).unwrap(), data);
        assert!(h.transport.gets().len() < fetched_before + 40);
    }

    #[tokio::test]
    async fn resume_skips_finished_segments() {
        let h = harness();
        seed_partial(&h, OLD, 10, &[0, 2]);
        let mut h = reopen(h);
        assert_eq!(h.coordinator.stored_progress("v1"), Some((6, 10)));
        assert_eq!(h.coordinator.resumable_assets(), vec!["v1".to_string()]);
        h.transport.serve(OLD, &b"0123456789"[..], None);

        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Completed { path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        let ranges: Vec<_> = h.transport.gets().into_iter().map(|(_, r)| r.start).collect();
        assert_eq!(ranges, vec![4]);
        assert!(h.transport.head_urls().is_empty());
        assert_eq!(h.coordinator.stored_progress("v1"), None);
        // Seeded segments were kept as they were.
        assert_eq!(std::fs::read(path).unwrap(), b"xxxx4567xx");
    }

    #[tokio::test]
    async fn resume_keeps_the_chunk_size_it_was_planned_with() {
        let h = harness();
        let layout = StorageLayout::new(h.dir.path());
        let store = MetadataStore::open(layout.metadata_dir()).unwrap();
        let mut record = DownloadMetadata::new("v1", OLD, 10, "mp4").with_chunk_size(4);
        record.finished_segments.insert(2);
        std::fs::create_dir_all(layout.segment_dir("v1")).unwrap();
        std::fs::write(layout.segment_path("v1", 2), b"89").unwrap();
        store.save(&record).unwrap();

        // The configured chunk size changed between runs.
        let mut h = reopen_with(h, config().with_chunk_size(2));
        assert_eq!(h.coordinator.stored_progress("v1"), Some((2, 10)));
        h.transport.serve(OLD, &b"0123456789"[..], None);

        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Completed { path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        assert_eq!(std::fs::read(path).unwrap(), b"0123456789");
        let mut starts: Vec<_> = h.transport.gets().into_iter().map(|(_, r)| r.start).collect();
        starts.sort_unstable();
        assert_eq!(starts, vec![0, 4]);
    }

    #[tokio::test]
    async fn keeps_old_url_when_it_needs_fewer_bytes() {
        let h = harness_with(config().with_chunk_size(1_000));
        // 1,000,000 byte asset with 500 of 1000 segments done: 500,000 left.
        let layout = StorageLayout::new(h.dir.path());
        let store = MetadataStore::open(layout.metadata_dir()).unwrap();
        let mut record = DownloadMetadata::new("v1", OLD, 1_000_000, "mp4").with_chunk_size(1_000);
        record.finished_segments = (0..500).collect();
        store.save(&record).unwrap();
        let h = reopen(h);
        h.transport.serve(OLD, vec![1u8; 1_000_000], None);
        h.transport.serve(NEW, vec![2u8; 2_000_000], None);

        let chosen = h.coordinator.inner.resolve_target("v1", NEW).await.unwrap();
        assert_eq!(chosen.origin_url, OLD);
        assert_eq!(chosen.finished_segments.len(), 500);
    }

    #[tokio::test]
    async fn switches_when_new_url_is_cheaper() {
        let h = harness_with(config().with_chunk_size(1_000));
        let layout = StorageLayout::new(h.dir.path());
        let store = MetadataStore::open(layout.metadata_dir()).unwrap();
        let mut record = DownloadMetadata::new("v1", OLD, 3_000_000, "mp4").with_chunk_size(1_000);
        record.finished_segments = (0..100).collect();
        store.save(&record).unwrap();
        let h = reopen(h);
        h.transport.serve(OLD, vec![1u8; 3_000_000], None);
        h.transport.serve(NEW, vec![2u8; 1_000_000], Some("video/webm"));

        let chosen = h.coordinator.inner.resolve_target("v1", NEW).await.unwrap();
        assert_eq!(chosen.origin_url, NEW);
        assert_eq!(chosen.total_size, 1_000_000);
        assert_eq!(chosen.final_extension, "webm");
        assert!(chosen.finished_segments.is_empty());
        assert_eq!(h.coordinator.inner.metadata.load("v1").unwrap().origin_url, NEW);
    }

    #[tokio::test]
    async fn switches_when_old_url_is_unreachable() {
        let h = harness();
        seed_partial(&h, OLD, 10, &[0]);
        let mut h = reopen(h);
        h.transport.set_unreachable(OLD);
        h.transport.serve(NEW, &b"abcdefghij"[..], None);

        h.coordinator.start_download("v1", NEW).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Completed { path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };
        assert_eq!(std::fs::read(path).unwrap(), b"abcdefghij");
    }

    #[tokio::test]
    async fn switches_when_stored_url_changed_size() {
        let h = harness();
        seed_partial(&h, OLD, 10, &[0]);
        let h = reopen(h);
        // 6 bytes left on the stored URL would otherwise win against 20.
        h.transport.serve(OLD, vec![1u8; 12], None);
        h.transport.serve(NEW, vec![2u8; 20], None);

        let chosen = h.coordinator.inner.resolve_target("v1", NEW).await.unwrap();
        assert_eq!(chosen.origin_url, NEW);
        assert_eq!(chosen.total_size, 20);
        assert!(chosen.finished_segments.is_empty());
        assert!(!StorageLayout::new(h.dir.path()).segment_path("v1", 0).exists());
    }

    #[tokio::test]
    async fn falls_back_to_partial_data_when_new_url_fails() {
        let h = harness();
        seed_partial(&h, OLD, 10, &[0]);
        let h = reopen(h);
        h.transport.set_unreachable(NEW);
        h.transport.serve(OLD, &b"0123456789"[..], None);

        let chosen = h.coordinator.inner.resolve_target("v1", NEW).await.unwrap();
        assert_eq!(chosen.origin_url, OLD);
        assert_eq!(chosen.finished_segments.len(), 1);
    }

    #[tokio::test]
    async fn new_url_failure_without_partial_data_fails() {
        let h = harness();
        seed_partial(&h, OLD, 10, &[]);
        let mut h = reopen(h);
        h.transport.set_unreachable(NEW);
        h.transport.serve(OLD, &b"0123456789"[..], None);

        h.coordinator.start_download("v1", NEW).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        assert!(matches!(event, DownloadEvent::Failed { .. }), "{event:?}");
        assert_eq!(h.coordinator.state("v1").await, DownloadState::Failed);
    }

    #[tokio::test]
    async fn probe_failure_fails_the_asset() {
        let mut h = harness();
        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Failed { error, .. } = event else {
            panic!("expected failure, got {event:?}");
        };
        assert!(error.contains("404"), "{error}");
        assert!(!h.coordinator.is_active("v1"));
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_asset_and_keep_partial_data() {
        let mut h = harness();
        h.transport.serve(OLD, &b"0123456789"[..], None);
        h.transport.fail_range(8, 100);

        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        assert!(matches!(event, DownloadEvent::Failed { .. }), "{event:?}");
        assert_eq!(h.coordinator.state("v1").await, DownloadState::Failed);
        assert!(!h.coordinator.local_file_exists("v1").await);
        assert!(h.coordinator.has_partial_data("v1").await);
    }

    #[tokio::test]
    async fn invalid_url_is_rejected() {
        let mut h = harness();
        let err = h.coordinator.start_download("v1", "not a url").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
        assert!(matches!(h.events.recv().await, Some(DownloadEvent::Failed { .. })));
        assert!(!h.coordinator.is_active("v1"));
        assert_eq!(h.coordinator.state("v1").await, DownloadState::Failed);
    }

    #[tokio::test]
    async fn remove_deletes_everything() {
        let mut h = harness();
        h.transport.serve(OLD, &b"0123456789"[..], None);
        h.coordinator.start_download("v1", OLD).await.unwrap();
        next_terminal(&mut h.events).await;
        assert!(h.coordinator.local_file_exists("v1").await);

        h.coordinator.remove_download_completely("v1").await.unwrap();
        assert!(!h.coordinator.local_file_exists("v1").await);
        assert!(!h.coordinator.has_partial_data("v1").await);
        assert_eq!(h.coordinator.state("v1").await, DownloadState::Idle);
        // Removing an unknown asset is fine.
        h.coordinator.remove_download_completely("nope").await.unwrap();
    }

    #[tokio::test]
    async fn remove_cancels_active_run() {
        let mut h = harness_with(config().with_chunk_size(1).with_max_concurrent_segments(1));
        h.transport.serve(OLD, vec![0u8; 100], None);
        h.transport.set_latency(Duration::from_millis(10));

        h.coordinator.start_download("v1", OLD).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        h.coordinator.remove_download_completely("v1").await.unwrap();

        assert!(!h.coordinator.is_active("v1"));
        assert!(!h.coordinator.has_partial_data("v1").await);
        assert!(!StorageLayout::new(h.dir.path()).segment_dir("v1").exists());
        while let Ok(event) = h.events.try_recv() {
            assert!(!event.is_terminal());
        }
    }

    #[tokio::test]
    async fn similar_ids_do_not_share_storage() {
        let mut h = harness();
        h.transport.serve(OLD, &b"0123456789"[..], None);

        h.coordinator.start_download("a/b", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        let DownloadEvent::Completed { path, .. } = event else {
            panic!("expected completion, got {event:?}");
        };

        assert!(!h.coordinator.local_file_exists("a_b").await);
        assert_eq!(h.coordinator.state("a_b").await, DownloadState::Idle);
        h.coordinator.remove_download_completely("a_b").await.unwrap();
        assert!(path.exists());
        assert!(h.coordinator.local_file_exists("a/b").await);
    }

    /// Counts progress callbacks delivered while the asset is not registered.
    #[derive(Default)]
    struct RegistryCheckingObserver {
        coordinator: OnceLock<DownloadCoordinator>,
        reports: AtomicUsize,
        unregistered: AtomicUsize,
    }

    impl DownloadObserver for RegistryCheckingObserver {
        fn on_progress(&self, asset_id: &str, _received: u64, _total: u64, _fraction: f64) {
            self.reports.fetch_add(1, Ordering::SeqCst);
            if self
                .coordinator
                .get()
                .is_some_and(|coordinator| !coordinator.is_active(asset_id))
            {
                self.unregistered.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn no_progress_once_paused() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(MockTransport::new());
        transport.serve(OLD, vec![0u8; 200], None);
        transport.set_latency(Duration::from_millis(1));
        let observer = Arc::new(RegistryCheckingObserver::default());
        let coordinator = DownloadCoordinator::with_parts(
            config().with_chunk_size(1).with_max_concurrent_segments(4),
            dir.path(),
            transport,
            Arc::new(TokioFileSystem::new()),
            observer.clone(),
            Arc::new(NoBackgroundWork),
        )
        .unwrap();
        let _ = observer.coordinator.set(coordinator.clone());

        for _ in 0..5 {
            coordinator.start_download("v1", OLD).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
            coordinator.cancel_download("v1").await;
        }

        assert!(observer.reports.load(Ordering::SeqCst) > 0);
        assert_eq!(observer.unregistered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn restarting_supersedes_previous_run() {
        let mut h = harness_with(config().with_chunk_size(2).with_max_concurrent_segments(1));
        h.transport.serve(OLD, &b"0123456789"[..], None);
        h.transport.set_latency(Duration::from_millis(10));

        h.coordinator.start_download("v1", OLD).await.unwrap();
        h.coordinator.start_download("v1", OLD).await.unwrap();
        let event = next_terminal(&mut h.events).await;
        assert!(matches!(event, DownloadEvent::Completed { .. }), "{event:?}");
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Exactly one terminal event for two starts.
        while let Ok(event) = h.events.try_recv() {
            assert!(!event.is_terminal());
        }
    }

    #[tokio::test]
    async fn background_work_brackets_activity() {
        let mut h = harness();
        h.transport.serve(OLD, &b"0123456789"[..], None);
        h.transport.serve(NEW, &b"abcdefghij"[..], None);

        h.coordinator.start_download("v1", OLD).await.unwrap();
        h.coordinator.start_download("v2", NEW).await.unwrap();
        next_terminal(&mut h.events).await;
        next_terminal(&mut h.events).await;

        let begins = h.background.begins.load(Ordering::SeqCst);
        let ends = h.background.ends.load(Ordering::SeqCst);
        assert!(begins >= 1);
        assert_eq!(begins, ends);
        assert!(h.coordinator.active_assets().is_empty());
    }

    #[test]
    fn switch_heuristic() {
        assert!(prefer_existing_target(500_000, 2_000_000));
        assert!(!prefer_existing_target(2_900_000, 1_000_000));
        assert!(!prefer_existing_target(1_000, 1_000));
    }
}
