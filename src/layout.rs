//! On-disk layout and the segment-file store.
//!
//! ```text
//! <root>/segments/<id>/<index>.seg       committed segment
//! <root>/segments/<id>/<index>.seg.tmp   segment being written
//! <root>/metadata/<id>.json              durable progress record
//! <root>/files/<id>/<id>.<ext>           assembled output
//! ```
//!
//! `<id>` is the asset id with every byte outside `[A-Za-z0-9._-]`
//! percent-encoded, so distinct ids never share a directory.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use regex::{Captures, Regex};

use crate::fs::FileSystem;
use crate::plan::SegmentPlan;

static UNSAFE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^A-Za-z0-9._-]").expect("valid regex"));

const SEGMENT_EXT: &str = "seg";
const TEMP_SUFFIX: &str = ".seg.tmp";
const PART_SUFFIX: &str = ".part";

/// Maps an asset id to a string usable as a single path component.
///
/// The mapping is injective: `%` is itself escaped, ids made only of dots
/// are escaped whole, and the empty id becomes a lone `%`.
#[must_use]
pub fn safe_id(asset_id: &str) -> String {
    if asset_id.is_empty() {
        return "%".to_string();
    }
    if asset_id.chars().all(|c| c == '.') {
        return asset_id.bytes().map(percent_encode).collect();
    }
    UNSAFE_ID_RE
        .replace_all(asset_id, |caps: &Captures<'_>| {
            caps[0].bytes().map(percent_encode).collect::<String>()
        })
        .into_owned()
}

fn percent_encode(byte: u8) -> String {
    format!("%{byte:02X}")
}

/// Deterministic paths for every file the engine owns.
#[derive(Debug, Clone)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Creates a layout rooted at `root`.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding metadata records.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.root.join("metadata")
    }

    /// Directory holding one asset's segment files.
    #[must_use]
    pub fn segment_dir(&self, asset_id: &str) -> PathBuf {
        self.root.join("segments").join(safe_id(asset_id))
    }

    /// Canonical path of a committed segment.
    #[must_use]
    pub fn segment_path(&self, asset_id: &str, index: u64) -> PathBuf {
        self.segment_dir(asset_id)
            .join(format!("{index}.{SEGMENT_EXT}"))
    }

    /// Path a segment is written to before being committed.
    #[must_use]
    pub fn temp_segment_path(&self, asset_id: &str, index: u64) -> PathBuf {
        self.segment_dir(asset_id).join(format!("{index}{TEMP_SUFFIX}"))
    }

    /// Directory holding one asset's assembled output.
    #[must_use]
    pub fn output_dir(&self, asset_id: &str) -> PathBuf {
        self.root.join("files").join(safe_id(asset_id))
    }

    /// Path of the assembled output for the given extension.
    #[must_use]
    pub fn final_path(&self, asset_id: &str, extension: &str) -> PathBuf {
        let id = safe_id(asset_id);
        let name = if extension.is_empty() {
            id
        } else {
            format!("{id}.{extension}")
        };
        self.output_dir(asset_id).join(name)
    }

    /// Path the output is assembled into before its final rename.
    #[must_use]
    pub fn partial_final_path(&self, asset_id: &str, extension: &str) -> PathBuf {
        let mut path = self.final_path(asset_id, extension).into_os_string();
        path.push(PART_SUFFIX);
        PathBuf::from(path)
    }
}

/// Parses `<index>.seg` into its index.
fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_suffix(".seg")?.parse().ok()
}

/// Segment files of every asset, on top of a [`FileSystem`].
#[derive(Clone)]
pub struct SegmentStore {
    layout: StorageLayout,
    fs: Arc<dyn FileSystem>,
}

impl SegmentStore {
    /// Creates a store.
    #[must_use]
    pub fn new(layout: StorageLayout, fs: Arc<dyn FileSystem>) -> Self {
        Self { layout, fs }
    }

    /// The layout in use.
    #[must_use]
    pub const fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    /// The file system in use.
    #[must_use]
    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    /// Ensures the asset's segment directory exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub async fn prepare(&self, asset_id: &str) -> std::io::Result<()> {
        self.fs.create_dir_all(&self.layout.segment_dir(asset_id)).await
    }

    /// Returns the indices of complete segment files for `plan`.
    ///
    /// Leftover temp files, files past the last segment, and files whose size
    /// does not match their range are deleted along the way.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub async fn scan(&self, asset_id: &str, plan: &SegmentPlan) -> std::io::Result<BTreeSet<u64>> {
        let mut found = BTreeSet::new();
        for path in self.fs.list_dir(&self.layout.segment_dir(asset_id)).await? {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(TEMP_SUFFIX) {
                log::debug!("{asset_id}: removing stale {name}");
                let _ = self.fs.remove_file(&path).await;
                continue;
            }
            let Some(index) = parse_segment_name(name) else {
                continue;
            };
            let expected = plan.range(index).map(|r| r.len());
            let actual = self.fs.file_size(&path).await;
            if expected.is_some() && expected == actual {
                found.insert(index);
            } else {
                log::warn!(
                    "{asset_id}: discarding segment {index} (size {actual:?}, expected {expected:?})"
                );
                let _ = self.fs.remove_file(&path).await;
            }
        }
        Ok(found)
    }

    /// Whether any committed segment file exists for the asset.
    pub async fn has_any(&self, asset_id: &str) -> bool {
        self.fs
            .list_dir(&self.layout.segment_dir(asset_id))
            .await
            .is_ok_and(|paths| {
                paths.iter().any(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .and_then(parse_segment_name)
                        .is_some()
                })
            })
    }

    /// Moves a fetched temp file into the segment's canonical slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the rename fails.
    pub async fn commit(&self, asset_id: &str, index: u64) -> std::io::Result<()> {
        self.fs
            .rename_file(
                &self.layout.temp_segment_path(asset_id, index),
                &self.layout.segment_path(asset_id, index),
            )
            .await
    }

    /// Deletes a segment's temp file, if any.
    pub async fn discard_temp(&self, asset_id: &str, index: u64) {
        let _ = self
            .fs
            .remove_file(&self.layout.temp_segment_path(asset_id, index))
            .await;
    }

    /// Deletes every segment file of the asset.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub async fn remove_all(&self, asset_id: &str) -> std::io::Result<()> {
        ignore_not_found(self.fs.remove_dir_all(&self.layout.segment_dir(asset_id)).await)
    }

    /// Finds the assembled output of an asset, whatever its extension.
    pub async fn find_final(&self, asset_id: &str) -> Option<PathBuf> {
        let paths = self.fs.list_dir(&self.layout.output_dir(asset_id)).await.ok()?;
        paths.into_iter().find(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| !n.ends_with(PART_SUFFIX))
        })
    }

    /// Deletes the asset's output directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory exists but cannot be removed.
    pub async fn remove_output(&self, asset_id: &str) -> std::io::Result<()> {
        ignore_not_found(self.fs.remove_dir_all(&self.layout.output_dir(asset_id)).await)
    }
}

fn ignore_not_found(result: std::io::Result<()>) -> std::io::Result<()> {
    match result {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
