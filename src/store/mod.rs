use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

pub mod memory;
pub mod rest;

/// Field bag for one record, keyed by attribute name.
pub type FieldMap = serde_json::Map<String, Value>;

/// Entity holding one audit-trail row per inbound event.
pub const WEBHOOK_LOG_ENTITY: &str = "webhook_log";
/// Entity for human-readable trace notes and attachment fallbacks.
pub const NOTE_ENTITY: &str = "note";
/// Entity storing expected validation-token values, keyed by schema name.
pub const VALIDATION_TOKEN_ENTITY: &str = "validation_token";

/// Lifecycle fields mutated when a status pair is applied to a record.
pub const STATE_FIELD: &str = "state_code";
pub const STATUS_FIELD: &str = "status_code";

/// Address of one record in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub entity: String,
    pub id: String,
}

impl RecordRef {
    pub fn new(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            id: id.into(),
        }
    }
}

/// Convert a `json!` object literal into a [`FieldMap`].
pub fn fields(value: Value) -> FieldMap {
    match value {
        Value::Object(map) => map,
        _ => FieldMap::new(),
    }
}

/// Capability contract of the remote record store.
///
/// This is the closed set of operations the pipeline is allowed to perform;
/// dispatch is always through these typed methods, never through string-keyed
/// request bags. Timeout and retry behavior belongs to the implementation —
/// callers never wrap these in retry loops.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create a record, returning the store-assigned id.
    async fn create(&self, entity: &str, fields: FieldMap) -> Result<String>;

    async fn update(&self, entity: &str, id: &str, fields: FieldMap) -> Result<()>;

    async fn retrieve(&self, entity: &str, id: &str, columns: &[&str]) -> Result<FieldMap>;

    /// Equality query on a single field. Result order is the store's.
    async fn query(
        &self,
        entity: &str,
        field: &str,
        value: &str,
        columns: &[&str],
    ) -> Result<Vec<FieldMap>>;

    /// Open a chunked upload session for a file attribute, returning an
    /// opaque continuation token.
    async fn init_upload(&self, target: &RecordRef, attribute: &str, filename: &str)
    -> Result<String>;

    async fn upload_block(&self, token: &str, block_id: &str, bytes: &[u8]) -> Result<()>;

    /// Seal an upload session. `block_ids` fixes the byte order of the
    /// committed file.
    async fn commit_upload(
        &self,
        token: &str,
        block_ids: &[String],
        filename: &str,
        mime_type: &str,
    ) -> Result<()>;

    async fn init_download(&self, target: &RecordRef, attribute: &str) -> Result<String>;

    async fn download_range(&self, token: &str, offset: u64, length: u64) -> Result<Vec<u8>>;
}
