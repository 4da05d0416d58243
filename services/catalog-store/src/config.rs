use crate::store::MAX_BATCH_ITEMS;
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the catalog store
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// DynamoDB configuration
    pub dynamodb: DynamoConfig,
    /// Batch writer configuration
    #[serde(default)]
    pub writer: WriterConfig,
    /// Scan configuration
    #[serde(default)]
    pub scan: ScanConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// DynamoDB table configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoConfig {
    /// Table holding video records
    #[serde(default = "default_table_name")]
    pub table_name: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for DynamoDB Local, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Create the table on startup when it does not exist
    #[serde(default = "default_true")]
    pub create_table: bool,
    /// How long to wait for a new table to become active
    #[serde(default = "default_table_ready_timeout_secs")]
    pub table_ready_timeout_secs: u64,
}

/// Batch writer and retry configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Records per batch write call (capped at the store limit)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempts per chunk
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Base of the exponential backoff after a failed call
    #[serde(default = "default_call_error_backoff_base_ms")]
    pub call_error_backoff_base_ms: u64,
    /// Step of the linear backoff after a partial write
    #[serde(default = "default_partial_backoff_step_ms")]
    pub partial_backoff_step_ms: u64,
    /// Re-run failed saves once with the fallback policy
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Attempts per chunk for the fallback pass
    #[serde(default = "default_fallback_max_attempts")]
    pub fallback_max_attempts: u32,
    /// Step of the linear backoff for the fallback pass
    #[serde(default = "default_fallback_backoff_step_ms")]
    pub fallback_backoff_step_ms: u64,
}

/// Scan configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScanConfig {
    /// Items examined per page; store default when unset
    pub page_size: Option<u32>,
}

// Default value functions
fn default_service_name() -> String {
    "catalog-store".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_table_name() -> String {
    "youtube_videos".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_true() -> bool {
    true
}

fn default_table_ready_timeout_secs() -> u64 {
    300 // 5 minutes
}

fn default_batch_size() -> usize {
    MAX_BATCH_ITEMS
}

fn default_max_attempts() -> u32 {
    5
}

fn default_call_error_backoff_base_ms() -> u64 {
    1000
}

fn default_partial_backoff_step_ms() -> u64 {
    500
}

fn default_fallback_max_attempts() -> u32 {
    3
}

fn default_fallback_backoff_step_ms() -> u64 {
    1000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "catalog-store")?
            .set_default("service.log_level", "info")?
            .set_default("dynamodb.table_name", "youtube_videos")?
            .add_source(config::File::with_name("config/catalog").required(false))
            .add_source(config::File::with_name("/etc/catalog/catalog").required(false))
            // CATALOG__DYNAMODB__TABLE_NAME -> dynamodb.table_name
            .add_source(
                config::Environment::with_prefix("CATALOG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get table readiness timeout as Duration
    pub fn table_ready_timeout(&self) -> Duration {
        Duration::from_secs(self.dynamodb.table_ready_timeout_secs)
    }
}

impl WriterConfig {
    /// Effective batch size, never above the store limit
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_ITEMS)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            call_error_backoff_base_ms: default_call_error_backoff_base_ms(),
            partial_backoff_step_ms: default_partial_backoff_step_ms(),
            fallback_enabled: true,
            fallback_max_attempts: default_fallback_max_attempts(),
            fallback_backoff_step_ms: default_fallback_backoff_step_ms(),
        }
    }
}
