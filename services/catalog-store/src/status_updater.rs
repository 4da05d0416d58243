use crate::record::TRANSCRIBED_ATTRIBUTE;
use crate::store::{FieldUpdate, StoreClient, StoreError};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Outcome of applying the flag to several videos
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlagUpdateReport {
    pub updated: Vec<String>,
    pub not_found: Vec<String>,
    /// Ids whose update failed for any other reason, with the error message
    pub failed: Vec<(String, String)>,
}

impl FlagUpdateReport {
    pub fn is_complete(&self) -> bool {
        self.not_found.is_empty() && self.failed.is_empty()
    }
}

/// Flips the transcription flag of a single video in place.
///
/// The flag and `updated_at` are assigned by the store itself; the rest of
/// the item is never read or rewritten.
pub struct StatusUpdater {
    store: Arc<dyn StoreClient>,
}

impl StatusUpdater {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn set_flag(&self, video_id: &str, value: bool) -> Result<(), StoreError> {
        if video_id.trim().is_empty() {
            return Err(StoreError::Validation("video id must not be empty".to_string()));
        }

        let update = FieldUpdate::new(TRANSCRIBED_ATTRIBUTE, value, Utc::now());
        self.store.update(video_id, update).await?;

        metrics::counter!("catalog.status.updates").increment(1);
        info!(video_id, transcribed = value, "Updated transcribe status");
        Ok(())
    }

    /// Apply `value` to each id in turn. Blank ids are ignored.
    pub async fn set_flag_many<I, S>(&self, video_ids: I, value: bool) -> FlagUpdateReport
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut report = FlagUpdateReport::default();

        for id in video_ids {
            let id = id.as_ref().trim();
            if id.is_empty() {
                continue;
            }

            match self.set_flag(id, value).await {
                Ok(()) => report.updated.push(id.to_string()),
                Err(StoreError::NotFound(_)) => {
                    warn!(video_id = id, "Video not found, status not updated");
                    report.not_found.push(id.to_string());
                }
                Err(e) => {
                    warn!(video_id = id, error = %e, "Failed to update transcribe status");
                    report.failed.push((id.to_string(), e.to_string()));
                }
            }
        }

        report
    }
}
