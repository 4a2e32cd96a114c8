//! Final-file assembly.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;

use crate::error::AssembleError;
use crate::layout::SegmentStore;
use crate::metadata::MetadataStore;

/// Concatenates committed segments into the asset's output file.
#[derive(Clone)]
pub struct Assembler {
    segments: SegmentStore,
    metadata: Arc<MetadataStore>,
}

impl Assembler {
    #[must_use]
    pub fn new(segments: SegmentStore, metadata: Arc<MetadataStore>) -> Self {
        Self { segments, metadata }
    }

    /// Writes segments `0..segment_count` in order into the final file.
    ///
    /// The output is built in a `.part` file and renamed into place only once
    /// every segment has been appended. On success the segment files and the
    /// metadata record are deleted.
    ///
    /// # Errors
    ///
    /// Returns [`AssembleError::MissingSegment`] for the first absent segment,
    /// or an I/O error. The partial output is removed in either case.
    pub async fn assemble(
        &self,
        asset_id: &str,
        segment_count: u64,
        extension: &str,
    ) -> Result<PathBuf, AssembleError> {
        let layout = self.segments.layout();
        let fs = self.segments.fs();
        let part = layout.partial_final_path(asset_id, extension);
        let dest = layout.final_path(asset_id, extension);

        fs.create_dir_all(&layout.output_dir(asset_id)).await?;
        let result = self.concatenate(asset_id, segment_count, &part).await;
        if let Err(e) = result {
            let _ = fs.remove_file(&part).await;
            return Err(e);
        }
        fs.rename_file(&part, &dest).await?;

        if let Err(e) = self.segments.remove_all(asset_id).await {
            log::warn!("{asset_id}: could not delete segments: {e}");
        }
        if let Err(e) = self.metadata.remove(asset_id) {
            log::warn!("{asset_id}: could not delete metadata: {e}");
        }

        log::info!("{asset_id}: assembled {} segment(s) into {}", segment_count, dest.display());
        Ok(dest)
    }

    async fn concatenate(
        &self,
        asset_id: &str,
        segment_count: u64,
        part: &std::path::Path,
    ) -> Result<(), AssembleError> {
        let layout = self.segments.layout();
        let fs = self.segments.fs();
        let mut out = fs.create_file(part).await?;

        for index in 0..segment_count {
            let path = layout.segment_path(asset_id, index);
            let mut segment = match fs.open_file(&path).await {
                Ok(file) => file,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(AssembleError::MissingSegment(index));
                }
                Err(e) => return Err(e.into()),
            };
            tokio::io::copy(&mut segment, &mut out).await?;
        }

        out.flush().await?;
        out.sync_all().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::TokioFileSystem;
    use crate::layout::StorageLayout;
    use crate::metadata::DownloadMetadata;
    use tempfile::TempDir;

    fn setup(dir: &TempDir) -> (Assembler, SegmentStore, Arc<MetadataStore>) {
        let layout = StorageLayout::new(dir.path());
        let segments = SegmentStore::new(layout.clone(), Arc::new(TokioFileSystem::new()));
        let metadata = Arc::new(MetadataStore::open(layout.metadata_dir()).unwrap());
        (
            Assembler::new(segments.clone(), Arc::clone(&metadata)),
            segments,
            metadata,
        )
    }

    #[tokio::test]
    async fn assembles_in_index_order_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (assembler, segments, metadata) = setup(&dir);
        metadata
            .save(&DownloadMetadata::new("v1", "http://h/v1", 10, "mp4"))
            .unwrap();
        segments.prepare("v1").await.unwrap();
        // Written out of order on purpose.
        std::fs::write(segments.layout().segment_path("v1", 2), b"89").unwrap();
        std::fs::write(segments.layout().segment_path("v1", 0), b"0123").unwrap();
        std::fs::write(segments.layout().segment_path("v1", 1), b"4567").unwrap();

        let path = assembler.assemble("v1", 3, "mp4").await.unwrap();
        assert_eq!(path, segments.layout().final_path("v1", "mp4"));
        assert_eq!(std::fs::read(&path).unwrap(), b"0123456789");
        assert!(!segments.layout().segment_dir("v1").exists());
        assert!(metadata.load("v1").is_none());
    }

    #[tokio::test]
    async fn missing_segment_aborts_without_output() {
        let dir = TempDir::new().unwrap();
        let (assembler, segments, metadata) = setup(&dir);
        metadata
            .save(&DownloadMetadata::new("v1", "http://h/v1", 10, "mp4"))
            .unwrap();
        segments.prepare("v1").await.unwrap();
        std::fs::write(segments.layout().segment_path("v1", 0), b"0123").unwrap();
        std::fs::write(segments.layout().segment_path("v1", 2), b"89").unwrap();

        let err = assembler.assemble("v1", 3, "mp4").await.unwrap_err();
        assert!(matches!(err, AssembleError::MissingSegment(1)));
        assert!(!segments.layout().final_path("v1", "mp4").exists());
        assert!(!segments.layout().partial_final_path("v1", "mp4").exists());
        assert!(segments.layout().segment_path("v1", 0).exists());
        assert!(metadata.load("v1").is_some());
    }
}
