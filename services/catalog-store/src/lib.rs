//! Catalog Store
//!
//! Persistence layer for video catalog metadata. Records collected from the
//! catalog API are upserted into a remote keyed store (DynamoDB) under the
//! store's batch-size limit, read back through paginated filtered scans, and
//! their transcription status is flipped in place.
//!
//! ## Features
//!
//! - **Batched Writes**: Records are chunked to the 25-item batch limit;
//!   unprocessed items are retried with backoff, failed calls with a separate
//!   exponential schedule, and one chunk's failure never stops the others
//! - **Paginated Scans**: Complete filtered result sets are rebuilt from
//!   cursor-linked pages, skipping items that fail to decode
//! - **In-place Status Updates**: The transcription flag is set with a
//!   conditional single-field update, never by rewriting the whole record
//!
//! ## Architecture
//!
//! ```text
//!  Catalog API records          VideoCatalog                  DynamoDB
//! ┌──────────────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │ VideoRecord[]    │──▶│ BatchWriter  (chunks,    │──▶│ BatchWrite   │
//! └──────────────────┘   │              retries)    │   │              │
//!                        │ PaginatedScanner         │◀─▶│ Scan         │
//!                        │ StatusUpdater            │──▶│ UpdateItem   │
//!                        └──────────────────────────┘   └──────────────┘
//! ```

pub mod batch_writer;
pub mod catalog;
pub mod config;
pub mod dynamo;
pub mod memory_store;
pub mod record;
pub mod retry;
pub mod scanner;
pub mod status_updater;
pub mod store;

pub use batch_writer::{BatchWriter, SaveReport};
pub use catalog::VideoCatalog;
pub use config::Config;
pub use dynamo::{DynamoStoreClient, TableDescription};
pub use memory_store::InMemoryStore;
pub use record::{PlaylistItem, RecordError, VideoRecord};
pub use retry::{Backoff, RetryPolicy};
pub use scanner::PaginatedScanner;
pub use status_updater::{FlagUpdateReport, StatusUpdater};
pub use store::{Cursor, FieldUpdate, ScanFilter, ScanPage, StoreClient, StoreError, MAX_BATCH_ITEMS};
