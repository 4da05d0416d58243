use crate::config::DynamoConfig;
use crate::record::{Item, KEY_ATTRIBUTE, UPDATED_AT_ATTRIBUTE};
use crate::store::{Cursor, FieldUpdate, ScanFilter, ScanPage, StoreClient, StoreError};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::{
    AttributeDefinition, AttributeValue, BillingMode, KeySchemaElement, KeyType, PutRequest,
    ScalarAttributeType, TableStatus, WriteRequest,
};
use aws_sdk_dynamodb::Client as DynamoClient;
use aws_types::SdkConfig;
use serde_json::{Map, Number, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

type AttributeMap = HashMap<String, AttributeValue>;

const TABLE_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Summary of the catalog table
#[derive(Debug, Clone)]
pub struct TableDescription {
    pub name: String,
    pub status: Option<String>,
    pub item_count: Option<i64>,
}

/// [`StoreClient`] backed by a DynamoDB table keyed on `video_id`
pub struct DynamoStoreClient {
    client: DynamoClient,
    table: String,
}

impl DynamoStoreClient {
    /// Create a client from the service configuration
    pub async fn new(config: &DynamoConfig) -> Result<Self, StoreError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Custom endpoint for DynamoDB Local/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            loader = loader.endpoint_url(endpoint_url);
        }

        let sdk_config = loader.load().await;
        let client = Self::from_sdk_config(&sdk_config, config.table_name.clone());

        info!(
            table = %config.table_name,
            region = %config.region,
            "DynamoDB client initialized"
        );

        Ok(client)
    }

    /// Create a client from an already loaded AWS configuration
    pub fn from_sdk_config(sdk_config: &SdkConfig, table: impl Into<String>) -> Self {
        Self {
            client: DynamoClient::new(sdk_config),
            table: table.into(),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Create the table if it does not exist and wait until it is active.
    #[instrument(skip(self), fields(table = %self.table))]
    pub async fn ensure_table(&self, timeout: Duration) -> Result<(), StoreError> {
        match self.client.describe_table().table_name(&self.table).send().await {
            Ok(_) => {
                info!("Table already exists");
                return Ok(());
            }
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_resource_not_found_exception())
                    .unwrap_or(false) => {}
            Err(e) => return Err(classify(e)),
        }

        info!("Creating table");

        let key = KeySchemaElement::builder()
            .attribute_name(KEY_ATTRIBUTE)
            .key_type(KeyType::Hash)
            .build()
            .map_err(|e| StoreError::Validation(e.to_string()))?;
        let definition = AttributeDefinition::builder()
            .attribute_name(KEY_ATTRIBUTE)
            .attribute_type(ScalarAttributeType::S)
            .build()
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        self.client
            .create_table()
            .table_name(&self.table)
            .key_schema(key)
            .attribute_definitions(definition)
            .billing_mode(BillingMode::PayPerRequest)
            .send()
            .await
            .map_err(classify)?;

        let deadline = Instant::now() + timeout;
        loop {
            let description = self.describe().await?;
            if description.status.as_deref() == Some(TableStatus::Active.as_str()) {
                info!("Table created successfully");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(StoreError::Transport(format!(
                    "table {} not active after {:?}",
                    self.table, timeout
                )));
            }
            debug!(status = ?description.status, "Waiting for table to become active");
            tokio::time::sleep(TABLE_POLL_INTERVAL).await;
        }
    }

    /// Describe the table
    pub async fn describe(&self) -> Result<TableDescription, StoreError> {
        let output = self
            .client
            .describe_table()
            .table_name(&self.table)
            .send()
            .await
            .map_err(classify)?;

        let table = output.table();
        Ok(TableDescription {
            name: self.table.clone(),
            status: table
                .and_then(|t| t.table_status())
                .map(|s| s.as_str().to_string()),
            item_count: table.and_then(|t| t.item_count()),
        })
    }
}

#[async_trait]
impl StoreClient for DynamoStoreClient {
    async fn put(&self, item: Item) -> Result<(), StoreError> {
        self.client
            .put_item()
            .table_name(&self.table)
            .set_item(Some(to_attribute_map(&item)))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Item>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .send()
            .await
            .map_err(classify)?;

        Ok(output.item().map(from_attribute_map))
    }

    async fn batch_write(&self, items: Vec<Item>) -> Result<Vec<Item>, StoreError> {
        let requests = items
            .iter()
            .map(|item| {
                PutRequest::builder()
                    .set_item(Some(to_attribute_map(item)))
                    .build()
                    .map(|put| WriteRequest::builder().put_request(put).build())
                    .map_err(|e| StoreError::Validation(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let output = self
            .client
            .batch_write_item()
            .request_items(&self.table, requests)
            .send()
            .await
            .map_err(classify)?;

        let unprocessed = output
            .unprocessed_items()
            .and_then(|tables| tables.get(&self.table))
            .map(|requests| {
                requests
                    .iter()
                    .filter_map(|request| request.put_request())
                    .map(|put| from_attribute_map(put.item()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(unprocessed)
    }

    async fn scan(
        &self,
        filter: ScanFilter,
        page_size: Option<u32>,
        cursor: Option<Cursor>,
    ) -> Result<ScanPage, StoreError> {
        let mut request = self
            .client
            .scan()
            .table_name(&self.table)
            .filter_expression("#attr = :value")
            .expression_attribute_names("#attr", filter.attribute())
            .expression_attribute_values(":value", to_attribute_value(filter.value()));

        if let Some(limit) = page_size {
            request = request.limit(i32::try_from(limit).unwrap_or(i32::MAX));
        }
        if let Some(cursor) = cursor {
            request = request.set_exclusive_start_key(Some(to_attribute_map(cursor.as_item())));
        }

        let output = request.send().await.map_err(classify)?;

        Ok(ScanPage {
            items: output.items().iter().map(from_attribute_map).collect(),
            next_cursor: output
                .last_evaluated_key()
                .filter(|key| !key.is_empty())
                .map(|key| Cursor::new(from_attribute_map(key))),
        })
    }

    async fn update(&self, key: &str, update: FieldUpdate) -> Result<(), StoreError> {
        let updated_at = serde_json::to_value(update.updated_at)
            .map_err(|e| StoreError::Validation(e.to_string()))?;

        let result = self
            .client
            .update_item()
            .table_name(&self.table)
            .key(KEY_ATTRIBUTE, AttributeValue::S(key.to_string()))
            .update_expression("SET #field = :value, #updated_at = :updated_at")
            .condition_expression("attribute_exists(#key)")
            .expression_attribute_names("#field", update.field)
            .expression_attribute_names("#updated_at", UPDATED_AT_ATTRIBUTE)
            .expression_attribute_names("#key", KEY_ATTRIBUTE)
            .expression_attribute_values(":value", to_attribute_value(&update.value))
            .expression_attribute_values(":updated_at", to_attribute_value(&updated_at))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_conditional_check_failed_exception())
                    .unwrap_or(false) =>
            {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(classify(e)),
        }
    }
}

/// Map an SDK error onto the store error taxonomy
fn classify<E, R>(err: SdkError<E, R>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    classify_code(err.code(), message)
}

fn classify_code(code: Option<&str>, message: String) -> StoreError {
    match code {
        Some(
            "ProvisionedThroughputExceededException"
            | "ThrottlingException"
            | "RequestLimitExceeded",
        ) => StoreError::Throttled(message),
        Some("ValidationException") => StoreError::Validation(message),
        // Raised for a missing table or index, never for a missing item
        Some("ResourceNotFoundException") => StoreError::TableNotFound(message),
        _ => StoreError::Transport(message),
    }
}

fn to_attribute_map(item: &Item) -> AttributeMap {
    item.iter()
        .map(|(name, value)| (name.clone(), to_attribute_value(value)))
        .collect()
}

fn to_attribute_value(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(to_attribute_value).collect()),
        Value::Object(map) => AttributeValue::M(to_attribute_map(map)),
    }
}

fn from_attribute_map(map: &AttributeMap) -> Item {
    map.iter()
        .map(|(name, value)| (name.clone(), from_attribute_value(value)))
        .collect::<Map<String, Value>>()
}

fn from_attribute_value(value: &AttributeValue) -> Value {
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => parse_number(n),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::L(values) => Value::Array(values.iter().map(from_attribute_value).collect()),
        AttributeValue::M(map) => Value::Object(from_attribute_map(map)),
        AttributeValue::Ss(values) => Value::Array(values.iter().cloned().map(Value::String).collect()),
        AttributeValue::Ns(values) => Value::Array(values.iter().map(|n| parse_number(n)).collect()),
        // Binary and unknown variants have no JSON counterpart
        _ => Value::Null,
    }
}

fn parse_number(n: &str) -> Value {
    if let Ok(u) = n.parse::<u64>() {
        return Value::Number(u.into());
    }
    if let Ok(i) = n.parse::<i64>() {
        return Value::Number(i.into());
    }
    n.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(n.to_string()))
}
