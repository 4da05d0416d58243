use crate::record::{item_key, Item, KEY_ATTRIBUTE, UPDATED_AT_ATTRIBUTE};
use crate::store::{Cursor, FieldUpdate, ScanFilter, ScanPage, StoreClient, StoreError, MAX_BATCH_ITEMS};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

const DEFAULT_PAGE_SIZE: usize = 100;

/// In-process store keyed by `video_id`.
///
/// Scans walk keys in order and examine at most `page_size` keys per call
/// before applying the filter, so a page may come back empty while still
/// carrying a cursor. `write_capacity` caps how many items a single batch
/// call accepts; the rest are returned as unprocessed. A batch naming the
/// same key twice is rejected as a whole.
pub struct InMemoryStore {
    items: RwLock<BTreeMap<String, Item>>,
    write_capacity: Option<usize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(BTreeMap::new()),
            write_capacity: None,
        }
    }

    /// Accept at most `capacity` items per batch call.
    pub fn with_write_capacity(mut self, capacity: usize) -> Self {
        self.write_capacity = Some(capacity);
        self
    }

    pub fn len(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().is_empty()
    }

    fn key_of(item: &Item) -> Result<String, StoreError> {
        match item_key(item) {
            Some(key) if !key.is_empty() => Ok(key.to_string()),
            _ => Err(StoreError::Validation(format!(
                "item is missing the {KEY_ATTRIBUTE} key attribute"
            ))),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for InMemoryStore {
    async fn put(&self, item: Item) -> Result<(), StoreError> {
        let key = Self::key_of(&item)?;
        self.items.write().insert(key, item);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, StoreError> {
        Ok(self.items.read().get(key).cloned())
    }

    async fn batch_write(&self, items: Vec<Item>) -> Result<Vec<Item>, StoreError> {
        if items.is_empty() || items.len() > MAX_BATCH_ITEMS {
            return Err(StoreError::Validation(format!(
                "batch must contain between 1 and {MAX_BATCH_ITEMS} items, got {}",
                items.len()
            )));
        }

        // Validate the whole request before applying any of it
        let keys = items
            .iter()
            .map(Self::key_of)
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::with_capacity(keys.len());
        if let Some(duplicate) = keys.iter().find(|key| !seen.insert(key.as_str())) {
            return Err(StoreError::Validation(format!(
                "batch contains duplicate key {duplicate}"
            )));
        }

        let accepted = self.write_capacity.unwrap_or(items.len()).min(items.len());
        let mut store = self.items.write();
        let mut unprocessed = Vec::new();
        for (index, (key, item)) in keys.into_iter().zip(items).enumerate() {
            if index < accepted {
                store.insert(key, item);
            } else {
                unprocessed.push(item);
            }
        }

        Ok(unprocessed)
    }

    async fn scan(
        &self,
        filter: ScanFilter,
        page_size: Option<u32>,
        cursor: Option<Cursor>,
    ) -> Result<ScanPage, StoreError> {
        let page_size = page_size.map(|n| n as usize).unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 {
            return Err(StoreError::Validation("page size must be positive".to_string()));
        }

        let start = match &cursor {
            Some(cursor) => Bound::Excluded(Self::key_of(cursor.as_item())?),
            None => Bound::Unbounded,
        };

        let store = self.items.read();
        let mut examined = store.range((start, Bound::Unbounded));
        let mut items = Vec::new();
        let mut last_key = None;

        for (key, item) in examined.by_ref().take(page_size) {
            if filter.matches(item) {
                items.push(item.clone());
            }
            last_key = Some(key.clone());
        }

        let next_cursor = match (last_key, examined.next()) {
            (Some(key), Some(_)) => {
                let mut last_evaluated = Item::new();
                last_evaluated.insert(KEY_ATTRIBUTE.to_string(), Value::String(key));
                Some(Cursor::new(last_evaluated))
            }
            _ => None,
        };

        Ok(ScanPage { items, next_cursor })
    }

    async fn update(&self, key: &str, update: FieldUpdate) -> Result<(), StoreError> {
        let updated_at = serde_json::to_value(update.updated_at)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let mut store = self.items.write();
        let item = store
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;

        item.insert(update.field, update.value);
        item.insert(UPDATED_AT_ATTRIBUTE.to_string(), updated_at);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::VideoRecord;
    use chrono::Utc;

    fn item(id: &str) -> Item {
        VideoRecord::new(id, "t", "a", "d", 1, "").to_item().unwrap()
    }

    #[tokio::test]
    async fn test_batch_write_respects_capacity() {
        let store = InMemoryStore::new().with_write_capacity(2);
        let unprocessed = store
            .batch_write(vec![item("a"), item("b"), item("c")])
            .await
            .unwrap();

        assert_eq!(unprocessed.len(), 1);
        assert_eq!(item_key(&unprocessed[0]), Some("c"));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_write_rejects_oversized_batch() {
        let store = InMemoryStore::new();
        let items = (0..MAX_BATCH_ITEMS + 1).map(|i| item(&i.to_string())).collect();

        let result = store.batch_write(items).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_batch_write_rejects_duplicate_keys() {
        let store = InMemoryStore::new();
        let result = store
            .batch_write(vec![item("a"), item("b"), item("a")])
            .await;

        assert!(matches!(result, Err(StoreError::Validation(msg)) if msg.contains("duplicate")));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_scan_pages_carry_cursor_until_exhausted() {
        let store = InMemoryStore::new();
        for id in ["a", "b", "c"] {
            store.put(item(id)).await.unwrap();
        }

        let filter = ScanFilter::transcribed(false);
        let first = store.scan(filter.clone(), Some(2), None).await.unwrap();
        assert_eq!(first.items.len(), 2);
        assert!(first.next_cursor.is_some());

        let second = store
            .scan(filter, Some(2), first.next_cursor)
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_update_missing_key() {
        let store = InMemoryStore::new();
        let result = store
            .update("nope", FieldUpdate::new("transcribed", true, Utc::now()))
            .await;

        assert!(matches!(result, Err(StoreError::NotFound(key)) if key == "nope"));
    }
}
