use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use crate::store::{RecordStore, VALIDATION_TOKEN_ENTITY};

/// Decides whether an inbound event is authorized to mutate records.
///
/// The policy is deliberately permissive ("allow unless proven otherwise"):
/// no configured schema means always valid, and a configured schema with no
/// stored expected value also means always valid. Only a stored expected
/// value turns the check into a strict comparison. Operational risk of the
/// permissive tiers is accepted and documented, not something to tighten
/// here.
pub struct TokenValidator {
    store: Arc<dyn RecordStore>,
    schema: Option<String>,
}

impl TokenValidator {
    pub fn new(store: Arc<dyn RecordStore>, schema: Option<String>) -> Self {
        Self { store, schema }
    }

    pub async fn is_valid(&self, incoming: Option<&str>) -> Result<bool> {
        let Some(schema) = self.schema.as_deref() else {
            return Ok(true);
        };

        let rows = self
            .store
            .query(VALIDATION_TOKEN_ENTITY, "name", schema, &["value"])
            .await?;
        let Some(expected) = rows
            .first()
            .and_then(|row| row.get("value"))
            .and_then(Value::as_str)
        else {
            return Ok(true);
        };

        let incoming = incoming.unwrap_or_default().trim();
        Ok(!incoming.is_empty() && incoming == expected.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{fields, memory::InMemoryStore};
    use serde_json::json;

    async fn validator_with(expected: Option<&str>, schema: Option<&str>) -> TokenValidator {
        let store = InMemoryStore::new();
        if let Some(value) = expected {
            store
                .seed(
                    VALIDATION_TOKEN_ENTITY,
                    fields(json!({"name": "schema-x", "value": value})),
                )
                .await;
        }
        TokenValidator::new(Arc::new(store), schema.map(str::to_string))
    }

    #[tokio::test]
    async fn no_schema_configured_is_always_valid() {
        let v = validator_with(None, None).await;
        assert!(v.is_valid(Some("anything")).await.unwrap());
        assert!(v.is_valid(None).await.unwrap());
    }

    #[tokio::test]
    async fn schema_without_stored_value_is_always_valid() {
        let v = validator_with(None, Some("schema-x")).await;
        assert!(v.is_valid(Some("t")).await.unwrap());
        assert!(v.is_valid(None).await.unwrap());
    }

    #[tokio::test]
    async fn stored_value_requires_exact_match() {
        let v = validator_with(Some("right"), Some("schema-x")).await;
        assert!(v.is_valid(Some("right")).await.unwrap());
        assert!(!v.is_valid(Some("wrong")).await.unwrap());
        assert!(!v.is_valid(Some("RIGHT")).await.unwrap());
    }

    #[tokio::test]
    async fn comparison_trims_whitespace_on_both_sides() {
        let v = validator_with(Some("  right "), Some("schema-x")).await;
        assert!(v.is_valid(Some(" right\n")).await.unwrap());
    }

    #[tokio::test]
    async fn empty_or_missing_incoming_token_is_rejected() {
        let v = validator_with(Some("right"), Some("schema-x")).await;
        assert!(!v.is_valid(None).await.unwrap());
        assert!(!v.is_valid(Some("   ")).await.unwrap());
    }
}
