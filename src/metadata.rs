//! Durable per-asset progress records.
//!
//! Each asset has one JSON file under the metadata directory. Writes go to a
//! temp file that is fsynced and renamed over the record, so a crash leaves
//! either the old or the new record, never a torn one. All mutations are
//! serialized by a single mutex around the in-memory index.
//!
//! The store is synchronous and uses `std::fs` directly rather than the
//! [`FileSystem`](crate::fs::FileSystem) seam: a record update must hold the
//! index lock across its write, and the lock is a plain mutex. Async callers
//! on the segment hot path run updates through `spawn_blocking`.

use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::layout::safe_id;
use crate::plan::SegmentPlan;

/// Durable download progress for one asset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadMetadata {
    pub asset_id: String,
    pub origin_url: String,
    /// Zero means the size has not been probed yet.
    pub total_size: u64,
    /// Chunk size the segments were planned with. Zero in records written
    /// before it was stored.
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub finished_segments: BTreeSet<u64>,
    #[serde(default)]
    pub final_extension: String,
    pub updated_at: DateTime<Utc>,
}

impl DownloadMetadata {
    /// Creates a record with no finished segments.
    #[must_use]
    pub fn new(
        asset_id: impl Into<String>,
        origin_url: impl Into<String>,
        total_size: u64,
        final_extension: impl Into<String>,
    ) -> Self {
        Self {
            asset_id: asset_id.into(),
            origin_url: origin_url.into(),
            total_size,
            chunk_size: 0,
            finished_segments: BTreeSet::new(),
            final_extension: final_extension.into(),
            updated_at: Utc::now(),
        }
    }

    /// Records the chunk size the segments are planned with.
    #[must_use]
    pub const fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// The recorded chunk size, or `default` if none was stored.
    #[must_use]
    pub const fn chunk_size_or(&self, default: u64) -> u64 {
        if self.chunk_size == 0 {
            default
        } else {
            self.chunk_size
        }
    }

    /// Segment plan for this record, using the recorded chunk size when there
    /// is one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the size is unknown.
    pub fn plan(&self, default_chunk_size: u64) -> Result<SegmentPlan> {
        SegmentPlan::new(self.total_size, self.chunk_size_or(default_chunk_size))
    }

    /// Estimated bytes still to fetch: `total − finished × chunk`, saturating.
    #[must_use]
    pub fn remaining_bytes(&self, default_chunk_size: u64) -> u64 {
        let chunk = self.chunk_size_or(default_chunk_size);
        let done = (self.finished_segments.len() as u64).saturating_mul(chunk);
        self.total_size.saturating_sub(done)
    }
}

/// Store of [`DownloadMetadata`] records, one JSON file per asset.
#[derive(Debug)]
pub struct MetadataStore {
    dir: PathBuf,
    records: Mutex<HashMap<String, DownloadMetadata>>,
}

impl MetadataStore {
    /// Opens the store, loading every record found in `dir`.
    ///
    /// Records that cannot be parsed are skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or listed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut records = HashMap::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }
            match read_record(&path) {
                Ok(record) => {
                    records.insert(record.asset_id.clone(), record);
                }
                Err(e) => log::warn!("Skipping unreadable metadata {}: {e}", path.display()),
            }
        }
        log::debug!("Loaded {} metadata record(s) from {}", records.len(), dir.display());

        Ok(Self {
            dir,
            records: Mutex::new(records),
        })
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, DownloadMetadata>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record_path(&self, asset_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_id(asset_id)))
    }

    /// Returns the record for an asset.
    #[must_use]
    pub fn load(&self, asset_id: &str) -> Option<DownloadMetadata> {
        self.records().get(asset_id).cloned()
    }

    /// Ids of every asset with a record.
    #[must_use]
    pub fn asset_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.records().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Writes a record, replacing any previous one. Durable on return.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn save(&self, metadata: &DownloadMetadata) -> Result<()> {
        let mut records = self.records();
        let mut record = metadata.clone();
        record.updated_at = Utc::now();
        self.persist(&record)?;
        records.insert(record.asset_id.clone(), record);
        Ok(())
    }

    /// Deletes the record for an asset. Missing records are not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn remove(&self, asset_id: &str) -> Result<()> {
        let mut records = self.records();
        match std::fs::remove_file(self.record_path(asset_id)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        records.remove(asset_id);
        Ok(())
    }

    /// Records one more finished segment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the asset has no record, or an I/O
    /// error if the record cannot be written.
    pub fn mark_finished(&self, asset_id: &str, index: u64) -> Result<DownloadMetadata> {
        self.update(asset_id, |record| {
            record.finished_segments.insert(index);
        })
    }

    /// Replaces the finished set with the segments present on disk.
    ///
    /// Segment files are authoritative: indices on disk but missing from the
    /// record are added, recorded indices without a file are dropped, and
    /// anything at or past `segment_count` is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the asset has no record, or an I/O
    /// error if the record cannot be written.
    pub fn reconcile_with_disk(
        &self,
        asset_id: &str,
        on_disk: &BTreeSet<u64>,
        segment_count: u64,
    ) -> Result<DownloadMetadata> {
        self.update(asset_id, |record| {
            let reconciled: BTreeSet<u64> = on_disk
                .iter()
                .copied()
                .filter(|&i| i < segment_count)
                .collect();
            let added = reconciled.difference(&record.finished_segments).count();
            let dropped = record.finished_segments.difference(&reconciled).count();
            if added > 0 || dropped > 0 {
                log::info!("{asset_id}: reconciled with disk (+{added} found, -{dropped} missing)");
            }
            record.finished_segments = reconciled;
        })
    }

    fn update(
        &self,
        asset_id: &str,
        mutate: impl FnOnce(&mut DownloadMetadata),
    ) -> Result<DownloadMetadata> {
        let mut records = self.records();
        let mut record = records
            .get(asset_id)
            .cloned()
            .ok_or_else(|| Error::InvalidState(format!("no metadata for asset {asset_id}")))?;
        mutate(&mut record);
        record.updated_at = Utc::now();
        self.persist(&record)?;
        records.insert(asset_id.to_string(), record.clone());
        Ok(record)
    }

    /// Writes a record to disk atomically (write tmp + fsync + rename).
    fn persist(&self, record: &DownloadMetadata) -> Result<()> {
        let path = self.record_path(&record.asset_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        let mut file = std::fs::File::create(&tmp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

fn read_record(path: &Path) -> Result<DownloadMetadata> {
    let contents = std::fs::read(path)?;
    Ok(serde_json::from_slice(&contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(finished: &[u64]) -> DownloadMetadata {
        let mut meta = DownloadMetadata::new("v1", "https://cdn.example.com/v1.mp4", 1_500_000, "mp4");
        meta.finished_segments = finished.iter().copied().collect();
        meta
    }

    #[test]
    fn save_load_and_reopen() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.save(&record(&[0, 2])).unwrap();

        let loaded = store.load("v1").unwrap();
        assert_eq!(loaded.finished_segments, BTreeSet::from([0, 2]));

        let reopened = MetadataStore::open(dir.path()).unwrap();
        let loaded = reopened.load("v1").unwrap();
        assert_eq!(loaded.origin_url, "https://cdn.example.com/v1.mp4");
        assert_eq!(loaded.final_extension, "mp4");
        assert_eq!(reopened.asset_ids(), vec!["v1".to_string()]);
    }

    #[test]
    fn remove_deletes_file_and_entry() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.save(&record(&[])).unwrap();
        store.remove("v1").unwrap();
        store.remove("v1").unwrap();

        assert!(store.load("v1").is_none());
        assert!(MetadataStore::open(dir.path()).unwrap().load("v1").is_none());
    }

    #[test]
    fn mark_finished_requires_record() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(matches!(store.mark_finished("v1", 0), Err(Error::InvalidState(_))));

        store.save(&record(&[])).unwrap();
        let updated = store.mark_finished("v1", 1).unwrap();
        assert_eq!(updated.finished_segments, BTreeSet::from([1]));
    }

    #[test]
    fn reconcile_drops_segments_missing_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.save(&record(&[0, 1, 2])).unwrap();

        let reconciled = store
            .reconcile_with_disk("v1", &BTreeSet::from([0, 2]), 3)
            .unwrap();
        assert_eq!(reconciled.finished_segments, BTreeSet::from([0, 2]));

        let reopened = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load("v1").unwrap().finished_segments, BTreeSet::from([0, 2]));
    }

    #[test]
    fn reconcile_adds_segments_found_on_disk() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.save(&record(&[0])).unwrap();

        let reconciled = store
            .reconcile_with_disk("v1", &BTreeSet::from([0, 1, 7]), 3)
            .unwrap();
        assert_eq!(reconciled.finished_segments, BTreeSet::from([0, 1]));
    }

    #[test]
    fn open_skips_corrupt_records() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.json"), b"{not json").unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        assert!(store.asset_ids().is_empty());
    }

    #[test]
    fn remaining_bytes_saturates() {
        let meta = record(&[0, 1]);
        assert_eq!(meta.remaining_bytes(500_000), 500_000);
        assert_eq!(meta.remaining_bytes(1_000_000), 0);
    }

    #[test]
    fn recorded_chunk_size_overrides_default() {
        let meta = record(&[0, 1]).with_chunk_size(100_000);
        assert_eq!(meta.remaining_bytes(500_000), 1_300_000);
        assert_eq!(meta.plan(500_000).unwrap().segment_count(), 15);

        let dir = TempDir::new().unwrap();
        let store = MetadataStore::open(dir.path()).unwrap();
        store.save(&meta).unwrap();
        let reopened = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load("v1").unwrap().chunk_size, 100_000);
    }

    #[test]
    fn records_without_chunk_size_still_load() {
        let dir = TempDir::new().unwrap();
        let json = r#"{
            "asset_id": "v1",
            "origin_url": "https://cdn.example.com/v1.mp4",
            "total_size": 10,
            "finished_segments": [0],
            "final_extension": "mp4",
            "updated_at": "2024-01-01T00:00:00Z"
        }"#;
        std::fs::write(dir.path().join("v1.json"), json).unwrap();

        let store = MetadataStore::open(dir.path()).unwrap();
        let loaded = store.load("v1").unwrap();
        assert_eq!(loaded.chunk_size, 0);
        assert_eq!(loaded.plan(4).unwrap().segment_count(), 3);
    }

    #[test]
    fn concurrent_marks_are_not_lost() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(MetadataStore::open(dir.path()).unwrap());
        store.save(&record(&[])).unwrap();

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.mark_finished("v1", i).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = MetadataStore::open(dir.path()).unwrap();
        assert_eq!(reopened.load("v1").unwrap().finished_segments.len(), 16);
    }
}
