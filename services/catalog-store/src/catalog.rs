use crate::batch_writer::{BatchWriter, SaveReport};
use crate::config::{ScanConfig, WriterConfig};
use crate::record::VideoRecord;
use crate::retry::RetryPolicy;
use crate::scanner::PaginatedScanner;
use crate::status_updater::{FlagUpdateReport, StatusUpdater};
use crate::store::{ScanFilter, StoreClient, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Video metadata catalog on top of a [`StoreClient`].
///
/// Wires the batch writer, the paginated scanner and the status updater to
/// one store handle built by the caller.
pub struct VideoCatalog {
    store: Arc<dyn StoreClient>,
    writer: BatchWriter,
    fallback_writer: Option<BatchWriter>,
    scanner: PaginatedScanner,
    updater: StatusUpdater,
}

impl VideoCatalog {
    /// Catalog with the standard and fallback retry policies.
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self::with_config(
            store,
            &WriterConfig::default(),
            &ScanConfig::default(),
            CancellationToken::new(),
        )
    }

    pub fn with_config(
        store: Arc<dyn StoreClient>,
        writer: &WriterConfig,
        scan: &ScanConfig,
        cancel: CancellationToken,
    ) -> Self {
        let policy = RetryPolicy::from_config(writer);
        let batch_size = writer.effective_batch_size();

        let fallback_writer = writer.fallback_enabled.then(|| {
            BatchWriter::new(store.clone(), RetryPolicy::fallback_from_config(writer))
                .with_batch_size(batch_size)
                .with_cancellation(cancel.clone())
        });

        Self {
            writer: BatchWriter::new(store.clone(), policy)
                .with_batch_size(batch_size)
                .with_cancellation(cancel.clone()),
            fallback_writer,
            scanner: PaginatedScanner::new(store.clone())
                .with_page_size(scan.page_size)
                .with_policy(policy)
                .with_cancellation(cancel),
            updater: StatusUpdater::new(store.clone()),
            store,
        }
    }

    /// Save a single video with a plain put.
    #[instrument(skip(self, video), fields(video_id = %video.video_id))]
    pub async fn save_video(&self, video: &VideoRecord) -> Result<(), StoreError> {
        let mut video = video.clone();
        video.stamp(Utc::now());
        let item = video.to_item()?;

        self.store.put(item).await?;

        info!(title = %video.title, "Saved video");
        Ok(())
    }

    /// Save many videos in batches.
    ///
    /// When the first pass leaves records unwritten and a fallback policy is
    /// configured, the same input is submitted once more under it. The report
    /// of the last pass is returned.
    ///
    /// Each record replaces the stored item. Saving a freshly collected video
    /// again clears its `transcribed` flag and restamps `created_at`.
    #[instrument(skip(self, videos), fields(videos = videos.len()))]
    pub async fn save_videos(&self, videos: &[VideoRecord]) -> SaveReport {
        let report = self.writer.save_all(videos).await;
        if report.is_complete() || report.cancelled {
            return report;
        }

        let Some(fallback) = &self.fallback_writer else {
            return report;
        };

        warn!(
            failed = report.failed,
            total = report.total,
            "Batch save incomplete, retrying with fallback policy"
        );
        fallback.save_all(videos).await
    }

    /// Look up a video by id.
    pub async fn get_video(&self, video_id: &str) -> Result<Option<VideoRecord>, StoreError> {
        match self.store.get(video_id).await? {
            Some(item) => Ok(Some(VideoRecord::from_item(item)?)),
            None => Ok(None),
        }
    }

    pub async fn set_transcribed(&self, video_id: &str, transcribed: bool) -> Result<(), StoreError> {
        self.updater.set_flag(video_id, transcribed).await
    }

    /// Mark every listed video as transcribed.
    pub async fn mark_transcribed<I, S>(&self, video_ids: I) -> FlagUpdateReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.updater.set_flag_many(video_ids, true).await
    }

    /// All videos that have not been transcribed yet.
    pub async fn untranscribed_videos(&self) -> Result<Vec<VideoRecord>, StoreError> {
        let videos = self.scanner.scan(&ScanFilter::transcribed(false)).await?;
        info!(count = videos.len(), "Found untranscribed videos");
        Ok(videos)
    }

    /// All videos that have been transcribed.
    pub async fn transcribed_videos(&self) -> Result<Vec<VideoRecord>, StoreError> {
        let videos = self.scanner.scan(&ScanFilter::transcribed(true)).await?;
        info!(count = videos.len(), "Found transcribed videos");
        Ok(videos)
    }

    /// Write a probe record and read it back.
    #[instrument(skip(self))]
    pub async fn verify_connection(&self) -> Result<VideoRecord, StoreError> {
        let probe = VideoRecord::new(
            format!("test_{}", Uuid::new_v4().simple()),
            "Test Video",
            "Test Author",
            "00:01:00",
            0,
            "Test description for connection test",
        );

        self.save_video(&probe).await?;
        let stored = self
            .get_video(&probe.video_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(probe.video_id.clone()))?;

        info!(video_id = %stored.video_id, "Connection verified");
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::store::MockStoreClient;

    fn videos(n: usize) -> Vec<VideoRecord> {
        (0..n)
            .map(|i| VideoRecord::new(format!("v{i:02}"), "t", "a", "PT1M", 0, ""))
            .collect()
    }

    #[tokio::test]
    async fn test_catalog_lifecycle() {
        let catalog = VideoCatalog::new(Arc::new(InMemoryStore::new()));

        let report = catalog.save_videos(&videos(30)).await;
        assert_eq!(report.processed, 30);

        catalog.set_transcribed("v03", true).await.unwrap();
        let marked = catalog.mark_transcribed(["v04", "missing"]).await;
        assert_eq!(marked.not_found, vec!["missing".to_string()]);

        assert_eq!(catalog.transcribed_videos().await.unwrap().len(), 2);
        assert_eq!(catalog.untranscribed_videos().await.unwrap().len(), 28);

        let video = catalog.get_video("v03").await.unwrap().unwrap();
        assert!(video.transcribed());
        assert!(catalog.get_video("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeated_video_in_batch_is_saved() {
        let store = Arc::new(InMemoryStore::new());
        let catalog = VideoCatalog::new(store.clone());

        let mut input = videos(25);
        input[24].video_id = "v00".to_string();

        let report = catalog.save_videos(&input).await;
        assert_eq!(report.processed, 25);
        assert_eq!(report.failed, 0);
        assert_eq!(store.len(), 24);
    }

    #[tokio::test]
    async fn test_verify_connection_round_trips_probe() {
        let store = Arc::new(InMemoryStore::new());
        let catalog = VideoCatalog::new(store.clone());

        let probe = catalog.verify_connection().await.unwrap();
        assert!(probe.video_id.starts_with("test_"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_pass_runs_once_after_failure() {
        let mut mock = MockStoreClient::new();
        // 5 standard attempts + 3 fallback attempts, then no more
        mock.expect_batch_write()
            .times(8)
            .returning(|_| Err(StoreError::Validation("malformed payload".to_string())));

        let catalog = VideoCatalog::new(Arc::new(mock));
        let report = catalog.save_videos(&videos(3)).await;

        assert_eq!(report.failed, 3);
        assert!(report.into_result().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_disabled() {
        let mut mock = MockStoreClient::new();
        mock.expect_batch_write()
            .times(5)
            .returning(|_| Err(StoreError::Transport("down".to_string())));

        let writer = WriterConfig {
            fallback_enabled: false,
            ..Default::default()
        };
        let catalog = VideoCatalog::with_config(
            Arc::new(mock),
            &writer,
            &ScanConfig::default(),
            CancellationToken::new(),
        );

        assert_eq!(catalog.save_videos(&videos(2)).await.failed, 2);
    }
}
