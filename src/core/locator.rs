use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::store::{RecordRef, RecordStore};

/// Maps an envelope id to the target business record via an equality query
/// on the configured business-key field. When more than one record matches,
/// the first query result is used — no error is raised on ambiguity.
pub struct RecordLocator {
    store: Arc<dyn RecordStore>,
    entity: String,
    key_field: String,
}

impl RecordLocator {
    pub fn new(store: Arc<dyn RecordStore>, entity: String, key_field: String) -> Self {
        Self {
            store,
            entity,
            key_field,
        }
    }

    pub async fn find_by_envelope_id(&self, envelope_id: &str) -> Result<Option<RecordRef>> {
        let rows = self
            .store
            .query(&self.entity, &self.key_field, envelope_id, &["id"])
            .await?;
        Ok(rows
            .first()
            .and_then(|row| row.get("id"))
            .and_then(Value::as_str)
            .map(|id| RecordRef::new(&self.entity, id)))
    }
}
