use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A store item: attribute name to attribute value.
pub type Item = Map<String, Value>;

/// Name of the key attribute of every stored video.
pub const KEY_ATTRIBUTE: &str = "video_id";

/// Name of the transcription flag attribute.
pub const TRANSCRIBED_ATTRIBUTE: &str = "transcribed";

/// Name of the last-modified attribute.
pub const UPDATED_AT_ATTRIBUTE: &str = "updated_at";

/// Largest item the store accepts (400 KiB).
pub const MAX_ITEM_BYTES: usize = 400 * 1024;

const WATCH_URL_PREFIX: &str = "https://www.youtube.com/watch?v=";

/// Record-level failures. These are permanent and never retried.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("record has an empty video_id")]
    MissingKey,

    #[error("record {video_id} is {size} bytes, over the {limit} byte item limit")]
    TooLarge {
        video_id: String,
        size: usize,
        limit: usize,
    },

    #[error("failed to serialize record {video_id}: {message}")]
    Serialize { video_id: String, message: String },

    #[error("malformed item: {0}")]
    Malformed(String),
}

/// A single entry of a playlist as returned by the catalog API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistItem {
    pub title: String,
    pub video_id: String,
}

/// Video metadata persisted in the catalog table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    /// Globally unique video identifier (primary key)
    pub video_id: String,
    pub title: String,
    pub author: String,
    /// Human readable duration, as reported by the catalog
    pub duration: String,
    /// View count
    pub views: u64,
    pub description: String,
    /// Watch URL
    pub url: String,
    /// Transcription status. Only changed through the status updater.
    #[serde(default)]
    transcribed: bool,
    /// Set by the writer at first successful write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Set by the writer on every write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl VideoRecord {
    /// Create a fresh, untranscribed record with no timestamps.
    pub fn new(
        video_id: impl Into<String>,
        title: impl Into<String>,
        author: impl Into<String>,
        duration: impl Into<String>,
        views: u64,
        description: impl Into<String>,
    ) -> Self {
        let video_id = video_id.into();
        let url = watch_url(&video_id);
        Self {
            video_id,
            title: title.into(),
            author: author.into(),
            duration: duration.into(),
            views,
            description: description.into(),
            url,
            transcribed: false,
            created_at: None,
            updated_at: None,
        }
    }

    /// Build a record from a playlist entry and the details fetched for it.
    pub fn from_playlist_item(
        item: &PlaylistItem,
        duration: impl Into<String>,
        views: u64,
        author: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(
            item.video_id.clone(),
            item.title.clone(),
            author,
            duration,
            views,
            description,
        )
    }

    /// Whether the video has been transcribed, as last read from the store.
    pub fn transcribed(&self) -> bool {
        self.transcribed
    }

    /// Stamp write timestamps. `created_at` is only filled in when absent.
    pub fn stamp(&mut self, now: DateTime<Utc>) {
        self.created_at.get_or_insert(now);
        self.updated_at = Some(now);
    }

    /// Marshal into a store item.
    pub fn to_item(&self) -> Result<Item, RecordError> {
        if self.video_id.trim().is_empty() {
            return Err(RecordError::MissingKey);
        }

        let encoded = serde_json::to_vec(self).map_err(|e| RecordError::Serialize {
            video_id: self.video_id.clone(),
            message: e.to_string(),
        })?;
        if encoded.len() > MAX_ITEM_BYTES {
            return Err(RecordError::TooLarge {
                video_id: self.video_id.clone(),
                size: encoded.len(),
                limit: MAX_ITEM_BYTES,
            });
        }

        match serde_json::from_slice::<Value>(&encoded) {
            Ok(Value::Object(item)) => Ok(item),
            Ok(other) => Err(RecordError::Serialize {
                video_id: self.video_id.clone(),
                message: format!("expected an object, got {other}"),
            }),
            Err(e) => Err(RecordError::Serialize {
                video_id: self.video_id.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// Unmarshal a store item.
    pub fn from_item(item: Item) -> Result<Self, RecordError> {
        serde_json::from_value(Value::Object(item)).map_err(|e| RecordError::Malformed(e.to_string()))
    }
}

/// Canonical watch URL for a video id
pub fn watch_url(video_id: &str) -> String {
    format!("{WATCH_URL_PREFIX}{video_id}")
}

/// Key value of an item, if it carries one.
pub fn item_key(item: &Item) -> Option<&str> {
    item.get(KEY_ATTRIBUTE).and_then(Value::as_str)
}
