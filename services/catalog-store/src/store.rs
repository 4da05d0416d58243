//! Contract of the remote keyed store.
//!
//! The store offers five primitives: point get, point put, a bounded batch
//! write that reports the items it could not process, a filtered scan that
//! yields one page plus an opaque continuation cursor, and a conditional
//! single-field update. Everything above this module is client-side
//! orchestration over these calls.

use crate::record::{Item, RecordError, TRANSCRIBED_ATTRIBUTE};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

/// Hard limit on the number of items in one batch write call.
pub const MAX_BATCH_ITEMS: usize = 25;

/// Errors surfaced by the store and the components built on it
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store asked us to slow down
    #[error("request throttled: {0}")]
    Throttled(String),

    /// Connectivity or service failure; nothing is known to have been applied
    #[error("store request failed: {0}")]
    Transport(String),

    /// The request itself was rejected
    #[error("invalid request: {0}")]
    Validation(String),

    /// Point operation on a key that does not exist
    #[error("video not found: {0}")]
    NotFound(String),

    /// The table itself is missing
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error(transparent)]
    Record(#[from] RecordError),

    /// Aggregate signal after a batch save that left records unwritten
    #[error("failed to write {failed} out of {total} items")]
    IncompleteWrite { failed: usize, total: usize },
}

/// Equality predicate on a single attribute, evaluated by the store
#[derive(Debug, Clone, PartialEq)]
pub struct ScanFilter {
    attribute: String,
    value: Value,
}

impl ScanFilter {
    /// Match items whose `attribute` equals `value`.
    pub fn equals(attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Match videos by transcription status.
    pub fn transcribed(value: bool) -> Self {
        Self::equals(TRANSCRIBED_ATTRIBUTE, value)
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Evaluate the predicate against an item. A missing attribute never matches.
    pub fn matches(&self, item: &Item) -> bool {
        item.get(&self.attribute) == Some(&self.value)
    }
}

/// Opaque continuation token returned by a scan page
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor(Item);

impl Cursor {
    pub fn new(last_evaluated_key: Item) -> Self {
        Self(last_evaluated_key)
    }

    pub fn as_item(&self) -> &Item {
        &self.0
    }
}

/// One page of a scan
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// `None` once the scan is exhausted
    pub next_cursor: Option<Cursor>,
}

/// Assignment of one attribute, stamped with the modification time
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub field: String,
    pub value: Value,
    pub updated_at: DateTime<Utc>,
}

impl FieldUpdate {
    pub fn new(field: impl Into<String>, value: impl Into<Value>, updated_at: DateTime<Utc>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            updated_at,
        }
    }
}

/// Remote keyed store holding video items.
///
/// Implementations are responsible for their own call timeouts. Every call
/// is either applied as a whole or not at all, except `batch_write`, which
/// may apply a subset and return the rest.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Unconditional upsert of one item.
    async fn put(&self, item: Item) -> Result<(), StoreError>;

    /// Point lookup by key.
    async fn get(&self, key: &str) -> Result<Option<Item>, StoreError>;

    /// Upsert at most [`MAX_BATCH_ITEMS`] items.
    ///
    /// `Err` means the whole call failed. `Ok` carries the items the store
    /// did not process, empty when everything was written.
    async fn batch_write(&self, items: Vec<Item>) -> Result<Vec<Item>, StoreError>;

    /// Fetch one page of items matching `filter`, starting after `cursor`.
    async fn scan(
        &self,
        filter: ScanFilter,
        page_size: Option<u32>,
        cursor: Option<Cursor>,
    ) -> Result<ScanPage, StoreError>;

    /// Apply `update` to an existing item. Missing keys yield [`StoreError::NotFound`].
    async fn update(&self, key: &str, update: FieldUpdate) -> Result<(), StoreError>;
}
