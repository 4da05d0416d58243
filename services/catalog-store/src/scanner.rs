use crate::record::VideoRecord;
use crate::retry::{wait, RetryPolicy};
use crate::store::{Cursor, ScanFilter, ScanPage, StoreClient, StoreError};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Reassembles a complete filtered result set from cursor-linked pages.
///
/// Every call starts from an empty cursor. A page call that fails is retried
/// for the same cursor with the policy's call-error backoff; items that do not
/// decode are logged and skipped.
pub struct PaginatedScanner {
    store: Arc<dyn StoreClient>,
    page_size: Option<u32>,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl PaginatedScanner {
    pub fn new(store: Arc<dyn StoreClient>) -> Self {
        Self {
            store,
            page_size: None,
            policy: RetryPolicy::standard(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_page_size(mut self, page_size: Option<u32>) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Collect every record matching `filter`.
    #[instrument(skip(self, filter), fields(attribute = filter.attribute(), value = %filter.value()))]
    pub async fn scan(&self, filter: &ScanFilter) -> Result<Vec<VideoRecord>, StoreError> {
        let mut records = Vec::new();
        let mut cursor: Option<Cursor> = None;
        let mut pages = 0usize;
        let mut skipped = 0usize;

        loop {
            let page = self.fetch_page(filter, cursor.take()).await?;
            pages += 1;

            for item in page.items {
                match VideoRecord::from_item(item) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        warn!(error = %e, "Failed to unmarshal video record");
                        skipped += 1;
                    }
                }
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        metrics::counter!("catalog.scanner.pages").increment(pages as u64);
        metrics::counter!("catalog.scanner.items_skipped").increment(skipped as u64);

        info!(found = records.len(), pages, skipped, "Scan completed");
        Ok(records)
    }

    async fn fetch_page(
        &self,
        filter: &ScanFilter,
        cursor: Option<Cursor>,
    ) -> Result<ScanPage, StoreError> {
        let mut attempts = 0u32;

        loop {
            let result = self
                .store
                .scan(filter.clone(), self.page_size, cursor.clone())
                .await;

            let error = match result {
                Ok(page) => {
                    debug!(items = page.items.len(), more = page.next_cursor.is_some(), "Fetched scan page");
                    return Ok(page);
                }
                Err(e) => e,
            };

            attempts += 1;
            if !self.policy.allows(attempts) {
                return Err(error);
            }

            let delay = self.policy.on_call_error.delay(attempts);
            warn!(
                attempt = attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Scan page failed, retrying"
            );
            if !wait(delay, &self.cancel).await {
                return Err(error);
            }
        }
    }
}
