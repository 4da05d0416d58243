//! Chunked batch writes with per-chunk retry of unprocessed items.
//!
//! Input records are split into consecutive chunks of at most the store's
//! batch limit. Each chunk is submitted as one batch call; a failed call is
//! retried unchanged, a partial success is retried with only the items the
//! store reported as unprocessed. One chunk running out of attempts never
//! stops the remaining chunks from being written.
//!
//! Records repeating a key inside one chunk are collapsed to the last copy
//! before submission; the store rejects a batch that names a key twice.

use crate::record::{item_key, Item, VideoRecord};
use crate::retry::{wait, RetryPolicy};
use crate::store::{StoreClient, StoreError, MAX_BATCH_ITEMS};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Aggregate outcome of a batch save
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveReport {
    /// Records handed to the writer
    pub total: usize,
    /// Records the store acknowledged
    pub processed: usize,
    /// Records not written: marshalling failures plus exhausted retries
    pub failed: usize,
    /// Keys of the failed records, where known
    pub failed_ids: Vec<String>,
    /// The save was interrupted before all chunks were attempted
    pub cancelled: bool,
}

impl SaveReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0
    }

    /// Turn a report with failures into [`StoreError::IncompleteWrite`].
    pub fn into_result(self) -> Result<Self, StoreError> {
        if self.is_complete() {
            Ok(self)
        } else {
            Err(StoreError::IncompleteWrite {
                failed: self.failed,
                total: self.total,
            })
        }
    }

    fn record_failure(&mut self, id: Option<&str>) {
        self.failed += 1;
        if let Some(id) = id {
            self.failed_ids.push(id.to_string());
        }
    }
}

/// Marshalled chunk with duplicate keys collapsed
struct MarshalledChunk {
    items: Vec<Item>,
    /// Earlier copies replaced by a later record with the same key
    superseded: HashMap<String, usize>,
}

impl MarshalledChunk {
    fn superseded_count(&self, item: &Item) -> usize {
        item_key(item)
            .and_then(|key| self.superseded.get(key))
            .copied()
            .unwrap_or(0)
    }
}

struct ChunkOutcome {
    processed: usize,
    unwritten: Vec<Item>,
    cancelled: bool,
}

/// Writes records in store-sized batches under a [`RetryPolicy`]
///
/// Every record is written as a full-item upsert. Re-saving a record built
/// from catalog data (rather than read back from the store) therefore resets
/// a stored `transcribed` flag to `false` and restamps `created_at`; use
/// [`crate::StatusUpdater`] to change the flag afterwards.
pub struct BatchWriter {
    store: Arc<dyn StoreClient>,
    policy: RetryPolicy,
    batch_size: usize,
    cancel: CancellationToken,
}

impl BatchWriter {
    pub fn new(store: Arc<dyn StoreClient>, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            batch_size: MAX_BATCH_ITEMS,
            cancel: CancellationToken::new(),
        }
    }

    /// Use smaller batches than the store limit.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_ITEMS);
        self
    }

    /// Abort backoff waits when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Upsert every record, reporting how many were and were not written.
    ///
    /// Never fails as a whole: per-chunk failures are folded into the report.
    #[instrument(skip(self, records), fields(records = records.len(), max_attempts = self.policy.max_attempts))]
    pub async fn save_all(&self, records: &[VideoRecord]) -> SaveReport {
        let mut report = SaveReport {
            total: records.len(),
            ..Default::default()
        };

        let mut chunks = records.chunks(self.batch_size).enumerate();
        for (index, chunk) in chunks.by_ref() {
            let mut marshalled = self.marshal_chunk(chunk, &mut report);
            if marshalled.items.is_empty() {
                continue;
            }

            let attempted = marshalled.items.len();
            let superseded: usize = marshalled.superseded.values().sum();
            let outcome = self.write_chunk(std::mem::take(&mut marshalled.items)).await;

            // A superseded copy shares the fate of the copy that replaced it
            let mut superseded_unwritten = 0;
            for item in &outcome.unwritten {
                let copies = 1 + marshalled.superseded_count(item);
                superseded_unwritten += copies - 1;
                for _ in 0..copies {
                    report.record_failure(item_key(item));
                }
            }
            report.processed += outcome.processed + superseded - superseded_unwritten;

            if outcome.unwritten.is_empty() {
                debug!(chunk = index, records = attempted, "Chunk written");
            } else {
                warn!(
                    chunk = index,
                    unwritten = outcome.unwritten.len(),
                    attempts = self.policy.max_attempts,
                    "Items could not be written after retries"
                );
            }

            if outcome.cancelled {
                report.cancelled = true;
                break;
            }
        }

        if report.cancelled {
            for (_, chunk) in chunks {
                for record in chunk {
                    report.record_failure(Some(&record.video_id));
                }
            }
        }

        metrics::counter!("catalog.writer.items_written").increment(report.processed as u64);
        metrics::counter!("catalog.writer.items_failed").increment(report.failed as u64);

        info!(
            processed = report.processed,
            failed = report.failed,
            total = report.total,
            cancelled = report.cancelled,
            "Batch write completed"
        );

        report
    }

    /// Stamp and marshal a chunk, dropping records that cannot be encoded.
    ///
    /// A key seen twice keeps the position of its first copy and the content
    /// of its last.
    fn marshal_chunk(&self, chunk: &[VideoRecord], report: &mut SaveReport) -> MarshalledChunk {
        let now = Utc::now();
        let mut items: Vec<Item> = Vec::with_capacity(chunk.len());
        let mut positions: HashMap<String, usize> = HashMap::new();
        let mut superseded: HashMap<String, usize> = HashMap::new();

        for record in chunk {
            let mut record = record.clone();
            record.stamp(now);
            match record.to_item() {
                Ok(item) => match positions.get(&record.video_id).copied() {
                    Some(position) => {
                        debug!(video_id = %record.video_id, "Duplicate key in chunk, keeping latest copy");
                        items[position] = item;
                        *superseded.entry(record.video_id).or_default() += 1;
                    }
                    None => {
                        positions.insert(record.video_id, items.len());
                        items.push(item);
                    }
                },
                Err(e) => {
                    warn!(video_id = %record.video_id, error = %e, "Failed to marshal video record");
                    let id = Some(record.video_id.as_str()).filter(|id| !id.is_empty());
                    report.record_failure(id);
                }
            }
        }

        MarshalledChunk { items, superseded }
    }

    /// Drive the retry loop for one chunk.
    async fn write_chunk(&self, chunk: Vec<Item>) -> ChunkOutcome {
        let submitted = chunk.len();
        let mut remaining = chunk;
        let mut attempts = 0u32;

        while !remaining.is_empty() && self.policy.allows(attempts) {
            metrics::counter!("catalog.writer.batch_calls").increment(1);

            let delay = match self.store.batch_write(remaining.clone()).await {
                Err(e) => {
                    attempts += 1;
                    warn!(
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "Batch write call failed"
                    );
                    self.policy.on_call_error.delay(attempts)
                }
                Ok(unprocessed) if !unprocessed.is_empty() => {
                    attempts += 1;
                    debug!(
                        unprocessed = unprocessed.len(),
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        "Batch partially written"
                    );
                    remaining = unprocessed;
                    self.policy.on_partial.delay(attempts)
                }
                Ok(_) => {
                    remaining.clear();
                    break;
                }
            };

            if !self.policy.allows(attempts) {
                break;
            }

            metrics::counter!("catalog.writer.retries").increment(1);
            debug!(delay_ms = delay.as_millis() as u64, "Waiting before retry");
            if !wait(delay, &self.cancel).await {
                warn!(unwritten = remaining.len(), "Batch write cancelled during backoff");
                return ChunkOutcome {
                    processed: submitted.saturating_sub(remaining.len()),
                    unwritten: remaining,
                    cancelled: true,
                };
            }
        }

        ChunkOutcome {
            processed: submitted.saturating_sub(remaining.len()),
            unwritten: remaining,
            cancelled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::InMemoryStore;
    use crate::store::MockStoreClient;
    use mockall::Sequence;

    fn records(n: usize) -> Vec<VideoRecord> {
        (0..n)
            .map(|i| VideoRecord::new(format!("vid{i:03}"), "title", "author", "PT1M", i as u64, ""))
            .collect()
    }

    fn writer(mock: MockStoreClient, policy: RetryPolicy) -> BatchWriter {
        BatchWriter::new(Arc::new(mock), policy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_call_per_chunk_when_all_succeed() {
        for n in [0usize, 1, 25, 26, 60] {
            let mut mock = MockStoreClient::new();
            mock.expect_batch_write()
                .times(n.div_ceil(MAX_BATCH_ITEMS))
                .returning(|items| {
                    assert!(items.len() <= MAX_BATCH_ITEMS);
                    Ok(Vec::new())
                });

            let report = writer(mock, RetryPolicy::standard()).save_all(&records(n)).await;
            assert_eq!(report.processed, n);
            assert_eq!(report.failed, 0);
            assert_eq!(report.processed + report.failed, n);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_chunks_preserve_input_order() {
        let mut mock = MockStoreClient::new();
        let mut seq = Sequence::new();
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 25 && item_key(&items[0]) == Some("vid000"))
            .returning(|_| Ok(Vec::new()));
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 5 && item_key(&items[0]) == Some("vid025"))
            .returning(|_| Ok(Vec::new()));

        let report = writer(mock, RetryPolicy::standard()).save_all(&records(30)).await;
        assert_eq!(report.processed, 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_unprocessed_chunk_exhausts_attempts() {
        let mut mock = MockStoreClient::new();
        mock.expect_batch_write().times(5).returning(Ok);

        let report = writer(mock, RetryPolicy::standard()).save_all(&records(25)).await;
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 25);
        assert_eq!(report.failed_ids.len(), 25);
        assert!(report.into_result().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shrinking_unprocessed_subset_converges() {
        let mut mock = MockStoreClient::new();
        let mut seq = Sequence::new();
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(Ok);
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 25)
            .returning(|items| Ok(items[..10].to_vec()));
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 10)
            .returning(|_| Ok(Vec::new()));

        let start = tokio::time::Instant::now();
        let report = writer(mock, RetryPolicy::standard()).save_all(&records(25)).await;
        assert_eq!(report.processed, 25);
        assert_eq!(report.failed, 0);

        // 1 * 500 ms + 2 * 500 ms on the partial schedule
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_millis(1500));
        assert!(elapsed < std::time::Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_error_and_partial_share_attempt_counter() {
        let mut mock = MockStoreClient::new();
        let mut seq = Sequence::new();
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Throttled("slow down".to_string())));
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 10)
            .returning(|items| Ok(items[..4].to_vec()));
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 4)
            .returning(|_| Ok(Vec::new()));

        let start = tokio::time::Instant::now();
        let report = writer(mock, RetryPolicy::standard()).save_all(&records(10)).await;
        assert_eq!(report.processed, 10);

        // 2^1 s after the failed call, then 2 * 500 ms after the partial write
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(3));
        assert!(elapsed < std::time::Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_key_in_chunk_keeps_last_copy() {
        let mut input = records(25);
        input[24].video_id = input[0].video_id.clone();
        input[24].title = "latest".to_string();

        let mut mock = MockStoreClient::new();
        mock.expect_batch_write()
            .times(1)
            .withf(|items| {
                let first = &items[0];
                items.len() == 24
                    && item_key(first) == Some("vid000")
                    && first.get("title") == Some(&serde_json::Value::from("latest"))
            })
            .returning(|_| Ok(Vec::new()));

        let report = writer(mock, RetryPolicy::standard()).save_all(&input).await;
        assert_eq!(report.processed, 25);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwritten_repeated_key_counts_every_copy() {
        let input: Vec<_> = (0..3)
            .map(|_| VideoRecord::new("same", "t", "a", "PT1M", 0, ""))
            .chain(records(2))
            .collect();

        let mut mock = MockStoreClient::new();
        mock.expect_batch_write()
            .times(5)
            .withf(|items| items.len() == 3 || items.len() == 1)
            .returning(|items| Ok(items.into_iter().filter(|i| item_key(i) == Some("same")).collect()));

        let report = writer(mock, RetryPolicy::standard()).save_all(&input).await;
        assert_eq!(report.processed, 2);
        assert_eq!(report.failed, 3);
        assert_eq!(report.failed_ids, vec!["same"; 3]);
        assert_eq!(report.processed + report.failed, report.total);
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_shared_id_is_written_once() {
        let input: Vec<_> = (0..25)
            .map(|i| VideoRecord::new("dup", format!("take {i}"), "a", "PT1M", 0, ""))
            .collect();

        let store = Arc::new(InMemoryStore::new());
        let report = BatchWriter::new(store.clone(), RetryPolicy::standard())
            .save_all(&input)
            .await;

        assert_eq!(report.processed, 25);
        assert_eq!(store.len(), 1);
        let stored = VideoRecord::from_item(store.get("dup").await.unwrap().unwrap()).unwrap();
        assert_eq!(stored.title, "take 24");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_errors_retry_same_set_with_exponential_backoff() {
        let mut mock = MockStoreClient::new();
        let mut seq = Sequence::new();
        mock.expect_batch_write()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(StoreError::Throttled("slow down".to_string())));
        mock.expect_batch_write()
            .times(1)
            .in_sequence(&mut seq)
            .withf(|items| items.len() == 3)
            .returning(|_| Ok(Vec::new()));

        let start = tokio::time::Instant::now();
        let report = writer(mock, RetryPolicy::standard()).save_all(&records(3)).await;

        assert_eq!(report.processed, 3);
        // 2^1 s + 2^2 s
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(6));
        assert!(elapsed < std::time::Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_policy_gives_up_after_three_calls() {
        let mut mock = MockStoreClient::new();
        mock.expect_batch_write()
            .times(3)
            .returning(|_| Err(StoreError::Transport("connection reset".to_string())));

        let start = tokio::time::Instant::now();
        let report = writer(mock, RetryPolicy::fallback()).save_all(&records(4)).await;

        assert_eq!(report.failed, 4);
        // 1 s + 2 s, no wait after the last attempt
        let elapsed = start.elapsed();
        assert!(elapsed >= std::time::Duration::from_secs(3));
        assert!(elapsed < std::time::Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_chunk_does_not_stop_later_chunks() {
        let mut mock = MockStoreClient::new();
        mock.expect_batch_write()
            .times(5)
            .withf(|items| item_key(&items[0]) == Some("vid000"))
            .returning(|_| Err(StoreError::Transport("down".to_string())));
        mock.expect_batch_write()
            .times(1)
            .withf(|items| item_key(&items[0]) == Some("vid025"))
            .returning(|_| Ok(Vec::new()));

        let report = writer(mock, RetryPolicy::standard()).save_all(&records(40)).await;
        assert_eq!(report.processed, 15);
        assert_eq!(report.failed, 25);
        assert_eq!(report.total, 40);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marshal_failure_is_dropped_without_retry() {
        let mut input = records(25);
        input[7].video_id = String::new();

        let mut mock = MockStoreClient::new();
        mock.expect_batch_write()
            .times(1)
            .withf(|items| items.len() == 24)
            .returning(|_| Ok(Vec::new()));

        let report = writer(mock, RetryPolicy::standard()).save_all(&input).await;
        assert_eq!(report.processed, 24);
        assert_eq!(report.failed, 1);
        assert!(report.failed_ids.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_stamps_timestamps() {
        let store = Arc::new(InMemoryStore::new());
        let report = BatchWriter::new(store.clone(), RetryPolicy::standard())
            .save_all(&records(2))
            .await;
        assert!(report.is_complete());

        let item = store.get("vid001").await.unwrap().unwrap();
        let stored = VideoRecord::from_item(item).unwrap();
        assert!(stored.created_at.is_some());
        assert_eq!(stored.created_at, stored.updated_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_limited_capacity_store_is_drained_by_retries() {
        let store = Arc::new(InMemoryStore::new().with_write_capacity(10));
        let report = BatchWriter::new(store.clone(), RetryPolicy::standard())
            .save_all(&records(50))
            .await;

        assert_eq!(report.processed, 50);
        assert_eq!(store.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_counts_so_far() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let mut mock = MockStoreClient::new();
        mock.expect_batch_write().times(1).returning(move |items| {
            trigger.cancel();
            Ok(items[20..].to_vec())
        });

        let report = writer(mock, RetryPolicy::standard())
            .with_cancellation(cancel)
            .save_all(&records(30))
            .await;

        assert!(report.cancelled);
        assert_eq!(report.processed, 20);
        assert_eq!(report.failed, 10);
        assert_eq!(report.processed + report.failed, report.total);
    }
}
