//! Per-asset segment scheduling.
//!
//! One scheduler run drives a single asset from its reconciled metadata to
//! "every segment on disk": it keeps up to `max_concurrent_segments` fetches
//! in flight, alternates origins by segment parity, puts failed segments back
//! at the head of the queue after a delay, and gives up on the asset once any
//! segment exhausts its retries.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{Error, FetchError, Result};
use crate::fetch::SegmentFetcher;
use crate::layout::SegmentStore;
use crate::metadata::MetadataStore;
use crate::origin::OriginPair;
use crate::plan::SegmentPlan;
use crate::progress::ProgressReporter;

/// What a task in the pool finished with.
enum TaskOutcome {
    Fetched {
        index: u64,
        result: std::result::Result<u64, FetchError>,
    },
    RetryReady(u64),
}

/// Bookkeeping for one run. Every index in the plan is in exactly one of
/// `pending`, `in_flight`, `waiting`, or already finished.
struct RunState {
    pending: VecDeque<u64>,
    in_flight: BTreeSet<u64>,
    waiting: BTreeSet<u64>,
    retry_counts: HashMap<u64, u32>,
    completed_bytes: u64,
}

impl RunState {
    fn new(plan: &SegmentPlan, finished: &BTreeSet<u64>) -> Self {
        Self {
            pending: (0..plan.segment_count())
                .filter(|i| !finished.contains(i))
                .collect(),
            in_flight: BTreeSet::new(),
            waiting: BTreeSet::new(),
            retry_counts: HashMap::new(),
            completed_bytes: plan.bytes_for(finished),
        }
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty() && self.waiting.is_empty()
    }

    /// Counts a failure and returns the number of attempts made so far.
    fn record_failure(&mut self, index: u64) -> u32 {
        let count = self.retry_counts.entry(index).or_insert(0);
        *count += 1;
        *count
    }
}

/// Runs the segment pool for one asset at a time.
#[derive(Clone)]
pub struct DownloadScheduler {
    config: Arc<EngineConfig>,
    fetcher: SegmentFetcher,
    segments: SegmentStore,
    metadata: Arc<MetadataStore>,
}

impl DownloadScheduler {
    #[must_use]
    pub fn new(
        config: Arc<EngineConfig>,
        fetcher: SegmentFetcher,
        segments: SegmentStore,
        metadata: Arc<MetadataStore>,
    ) -> Self {
        Self {
            config,
            fetcher,
            segments,
            metadata,
        }
    }

    /// Fetches every missing segment of `asset_id`.
    ///
    /// The stored record is first reconciled with the segment files on disk,
    /// so only segments that are not already present are requested. Returns
    /// the plan once all segments are committed.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if `token` fires; in-flight fetches are aborted
    ///   and no further progress is reported.
    /// - [`Error::RetriesExhausted`] if a segment fails more than
    ///   `max_retries_per_segment` times; all sibling fetches are aborted.
    /// - [`Error::InvalidState`] if the asset has no usable record.
    /// - I/O errors from committing segments or updating metadata.
    pub async fn run(
        &self,
        asset_id: &str,
        origins: &OriginPair,
        token: &CancellationToken,
        progress: &ProgressReporter,
    ) -> Result<SegmentPlan> {
        let record = self
            .metadata
            .load(asset_id)
            .ok_or_else(|| Error::InvalidState(format!("no metadata for asset {asset_id}")))?;
        let plan = record.plan(self.config.chunk_size)?;

        self.segments.prepare(asset_id).await?;
        let on_disk = self.segments.scan(asset_id, &plan).await?;
        let segment_count = plan.segment_count();
        let record = self
            .with_metadata(asset_id, move |store, id| {
                store.reconcile_with_disk(id, &on_disk, segment_count)
            })
            .await?;

        let mut state = RunState::new(&plan, &record.finished_segments);
        log::info!(
            "{asset_id}: {} of {} segment(s) already on disk",
            record.finished_segments.len(),
            plan.segment_count()
        );
        progress.report_live(token, asset_id, state.completed_bytes, plan.total_size());

        let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();
        loop {
            self.fill(asset_id, &plan, origins, &mut state, &mut tasks);
            if state.is_done() {
                break;
            }

            let joined = tokio::select! {
                biased;
                () = token.cancelled() => {
                    tasks.abort_all();
                    log::debug!("{asset_id}: scheduler cancelled");
                    return Err(Error::Cancelled);
                }
                joined = tasks.join_next() => joined,
            };
            let outcome = match joined {
                Some(Ok(outcome)) => outcome,
                Some(Err(e)) => {
                    return Err(Error::InvalidState(format!("segment task ended abnormally: {e}")));
                }
                None => {
                    return Err(Error::InvalidState(format!(
                        "{asset_id}: segment pool drained with work outstanding"
                    )));
                }
            };

            match outcome {
                TaskOutcome::Fetched { index, result } => {
                    state.in_flight.remove(&index);
                    if token.is_cancelled() {
                        self.segments.discard_temp(asset_id, index).await;
                        return Err(Error::Cancelled);
                    }
                    match result {
                        Ok(bytes) => {
                            self.segments.commit(asset_id, index).await?;
                            self.with_metadata(asset_id, move |store, id| {
                                store.mark_finished(id, index)
                            })
                            .await?;
                            state.completed_bytes += bytes;
                            log::debug!("{asset_id}: segment {index} done");
                            progress.report_live(
                                token,
                                asset_id,
                                state.completed_bytes,
                                plan.total_size(),
                            );
                        }
                        Err(e) => {
                            self.segments.discard_temp(asset_id, index).await;
                            let attempts = state.record_failure(index);
                            if attempts > self.config.max_retries_per_segment {
                                log::error!(
                                    "{asset_id}: segment {index} failed after {attempts} attempts: {e}"
                                );
                                tasks.abort_all();
                                return Err(Error::RetriesExhausted {
                                    index,
                                    attempts,
                                    source: e,
                                });
                            }
                            log::warn!(
                                "{asset_id}: segment {index} attempt {attempts} failed: {e}, retrying"
                            );
                            state.waiting.insert(index);
                            let delay = self.config.retry_delay();
                            tasks.spawn(async move {
                                tokio::time::sleep(delay).await;
                                TaskOutcome::RetryReady(index)
                            });
                        }
                    }
                }
                TaskOutcome::RetryReady(index) => {
                    state.waiting.remove(&index);
                    state.pending.push_front(index);
                }
            }
        }

        log::info!("{asset_id}: all {} segment(s) on disk", plan.segment_count());
        Ok(plan)
    }

    /// Runs a metadata update on the blocking pool; record writes fsync.
    async fn with_metadata<T, F>(&self, asset_id: &str, update: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&MetadataStore, &str) -> Result<T> + Send + 'static,
    {
        let store = Arc::clone(&self.metadata);
        let id = asset_id.to_string();
        tokio::task::spawn_blocking(move || update(&store, &id))
            .await
            .map_err(|e| Error::InvalidState(format!("metadata update ended abnormally: {e}")))?
    }

    /// Starts fetches until the pool is full or nothing is pending.
    fn fill(
        &self,
        asset_id: &str,
        plan: &SegmentPlan,
        origins: &OriginPair,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskOutcome>,
    ) {
        let limit = self.config.max_concurrent_segments.max(1);
        while state.in_flight.len() < limit
            && let Some(index) = state.pending.pop_front()
        {
            let Some(range) = plan.range(index) else {
                continue;
            };
            let url = origins.for_segment(index).to_string();
            let dest = self.segments.layout().temp_segment_path(asset_id, index);
            let fetcher = self.fetcher.clone();
            state.in_flight.insert(index);
            tasks.spawn(async move {
                let result = fetcher.fetch(&url, range, &dest).await;
                TaskOutcome::Fetched { index, result }
            });
        }
    }
}
