use std::sync::Arc;

use serde_json::{Value, json};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::audit::{AuditWriter, describe_event};
use crate::core::config::{AppConfig, StatusPair};
use crate::core::event::{EventCategory, InboundEvent};
use crate::core::locator::RecordLocator;
use crate::core::token::TokenValidator;
use crate::core::upload::ChunkedUploader;
use crate::store::{
    RecordRef, RecordStore, STATE_FIELD, STATUS_FIELD, WEBHOOK_LOG_ENTITY, fields,
};

/// Closed failure taxonomy of one pipeline run.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid token")]
    InvalidToken,

    #[error("target not found")]
    TargetNotFound,

    #[error("{0:#}")]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Malformed or incomplete inbound envelope; no store contact happened.
    Input,
    Auth,
    NotFound,
    Store,
}

/// The single terminal outcome of one run.
#[derive(Debug, Clone)]
pub struct TerminalResult {
    pub ok: bool,
    pub handled: Option<&'static str>,
    pub envelope_id: Option<String>,
    pub error: Option<String>,
    pub failure: Option<FailureKind>,
}

impl TerminalResult {
    pub fn handled(category: EventCategory, envelope_id: &str) -> Self {
        Self {
            ok: true,
            handled: Some(category.as_str()),
            envelope_id: Some(envelope_id.to_string()),
            error: None,
            failure: None,
        }
    }

    pub fn failure(kind: FailureKind, envelope_id: Option<&str>, error: String) -> Self {
        Self {
            ok: false,
            handled: None,
            envelope_id: envelope_id.map(str::to_string),
            error: Some(error),
            failure: Some(kind),
        }
    }

    /// 0 handled, 1 malformed input (no store contact), 2 handled-but-failed.
    pub fn exit_code(&self) -> i32 {
        match (self.ok, self.failure) {
            (true, _) => 0,
            (false, Some(FailureKind::Input)) => 1,
            (false, _) => 2,
        }
    }

    /// The one JSON object written to the success channel.
    pub fn to_json(&self) -> Value {
        let mut map = serde_json::Map::new();
        map.insert("ok".to_string(), json!(self.ok));
        map.insert("source".to_string(), json!("crm"));
        map.insert("where".to_string(), json!("webhook"));
        if let Some(handled) = self.handled {
            map.insert("handled".to_string(), json!(handled));
        }
        if let Some(envelope_id) = &self.envelope_id {
            map.insert("envelopeId".to_string(), json!(envelope_id));
        }
        if let Some(error) = &self.error {
            map.insert("error".to_string(), json!(error));
        }
        Value::Object(map)
    }
}

/// Orchestrates one run: Received → Validating → Locating → (Uploading) →
/// Finalizing → {Processed, Failed}. Guarantees exactly one terminal
/// transition of the webhook log per run that reaches the store.
pub struct WebhookProcessor {
    store: Arc<dyn RecordStore>,
    validator: TokenValidator,
    locator: RecordLocator,
    audit: AuditWriter,
    uploader: ChunkedUploader,
    config: AppConfig,
}

impl WebhookProcessor {
    pub fn new(store: Arc<dyn RecordStore>, config: AppConfig) -> Self {
        let validator =
            TokenValidator::new(store.clone(), config.validation.token_schema.clone());
        let locator = RecordLocator::new(
            store.clone(),
            config.target.entity.clone(),
            config.target.key_field.clone(),
        );
        let audit = AuditWriter::new(store.clone());
        let uploader = ChunkedUploader::new(
            store.clone(),
            config.upload.block_size,
            config.shadow_field(),
        );
        Self {
            store,
            validator,
            locator,
            audit,
            uploader,
            config,
        }
    }

    pub async fn process(&self, event: &InboundEvent) -> TerminalResult {
        // Pre-flight: both required fields, checked before any store access.
        let Some(event_name) = event.event.as_deref().map(str::trim).filter(|s| !s.is_empty())
        else {
            return TerminalResult::failure(
                FailureKind::Input,
                event.envelope_id.as_deref(),
                PipelineError::MissingField("event").to_string(),
            );
        };
        let Some(envelope_id) = event
            .envelope_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
        else {
            return TerminalResult::failure(
                FailureKind::Input,
                None,
                PipelineError::MissingField("envelopeId").to_string(),
            );
        };

        let correlation_id = Uuid::new_v4();
        info!(%correlation_id, event = event_name, envelope = envelope_id, "processing event");

        // First store mutation of the run. If this fails, nothing else is
        // attempted — there is no log record to transition.
        let log_id = match self.create_log(correlation_id, event, event_name, envelope_id).await {
            Ok(id) => id,
            Err(e) => {
                return TerminalResult::failure(
                    FailureKind::Store,
                    Some(envelope_id),
                    format!("could not create webhook log: {e:#}"),
                );
            }
        };

        match self.run(event, event_name, envelope_id).await {
            Ok(category) => match self.finalize_log(&log_id, "processed", None).await {
                Ok(()) => {
                    info!(%correlation_id, handled = category.as_str(), "event processed");
                    TerminalResult::handled(category, envelope_id)
                }
                Err(e) => {
                    let reason = format!("could not finalize webhook log: {e:#}");
                    self.mark_failed_best_effort(&log_id, &reason).await;
                    TerminalResult::failure(FailureKind::Store, Some(envelope_id), reason)
                }
            },
            Err(err) => {
                let reason = err.to_string();
                self.mark_failed_best_effort(&log_id, &reason).await;
                let kind = match err {
                    PipelineError::InvalidToken => FailureKind::Auth,
                    PipelineError::TargetNotFound => FailureKind::NotFound,
                    PipelineError::MissingField(_) => FailureKind::Input,
                    PipelineError::Store(_) => FailureKind::Store,
                };
                TerminalResult::failure(kind, Some(envelope_id), reason)
            }
        }
    }

    /// Validating → Locating → (Uploading) → category handling. Store errors
    /// bubble out as `PipelineError::Store` and are mapped to the terminal
    /// failure by `process`.
    async fn run(
        &self,
        event: &InboundEvent,
        event_name: &str,
        envelope_id: &str,
    ) -> Result<EventCategory, PipelineError> {
        if !self
            .validator
            .is_valid(event.validation_token.as_deref())
            .await?
        {
            return Err(PipelineError::InvalidToken);
        }

        let target = self
            .locator
            .find_by_envelope_id(envelope_id)
            .await?
            .ok_or(PipelineError::TargetNotFound)?;

        // Best-effort trace note; a failure here never affects the outcome.
        let (subject, body) = describe_event(event, event_name);
        if let Err(e) = self.audit.append_note(&target, &subject, &body).await {
            warn!("audit note discarded: {e:#}");
        }

        let category = EventCategory::classify(event_name);
        if category == EventCategory::Completed {
            self.store_document(event, &target).await;
        }
        self.apply_status_pair(&target, self.pair_for(category)).await?;

        Ok(category)
    }

    /// Uploading state: first document payload goes through the tiered
    /// engine. The engine cannot fail; a missing or undecodable payload is
    /// logged and skipped.
    async fn store_document(&self, event: &InboundEvent, target: &RecordRef) {
        let Some(document) = event.documents.first() else {
            return;
        };
        if event.documents.len() > 1 {
            warn!(
                skipped = event.documents.len() - 1,
                "file attribute holds a single artifact, extra documents skipped"
            );
        }
        let bytes = match document.decode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("document payload is not valid base64, skipped: {e}");
                return;
            }
        };
        let filename = document.filename();
        let mime_type = mime_guess::from_path(&filename).first_or_octet_stream();
        let result = self
            .uploader
            .upload(
                target,
                &self.config.target.file_attribute,
                &filename,
                mime_type.essence_str(),
                &bytes,
            )
            .await;
        info!(
            tier = result.tier.as_str(),
            verified = result.verified,
            bytes = result.bytes_written,
            "signed artifact stored"
        );
    }

    fn pair_for(&self, category: EventCategory) -> Option<StatusPair> {
        match category {
            EventCategory::Completed => self.config.status.completed,
            EventCategory::FinishLater => self.config.status.finish_later,
            EventCategory::Declined => self.config.status.declined,
            EventCategory::Unhandled => None,
        }
    }

    async fn apply_status_pair(
        &self,
        target: &RecordRef,
        pair: Option<StatusPair>,
    ) -> Result<(), PipelineError> {
        let Some(pair) = pair else {
            return Ok(());
        };
        self.store
            .update(
                &target.entity,
                &target.id,
                fields(json!({
                    STATE_FIELD: pair.state,
                    STATUS_FIELD: pair.status,
                })),
            )
            .await?;
        Ok(())
    }

    async fn create_log(
        &self,
        correlation_id: Uuid,
        event: &InboundEvent,
        event_name: &str,
        envelope_id: &str,
    ) -> anyhow::Result<String> {
        let mut log = fields(json!({
            "correlation_id": correlation_id.to_string(),
            "event_name": event_name,
            "envelope_id": envelope_id,
            "payload": event.summary().to_string(),
            "state": "received",
        }));
        if let Some(raw) = &event.raw_body {
            log.insert("raw_body".to_string(), json!(raw));
        }
        if let Some(pair) = self.config.status.received {
            log.insert(STATE_FIELD.to_string(), json!(pair.state));
            log.insert(STATUS_FIELD.to_string(), json!(pair.status));
        }
        self.store.create(WEBHOOK_LOG_ENTITY, log).await
    }

    /// The single terminal transition: Received → Processed or Failed.
    async fn finalize_log(
        &self,
        log_id: &str,
        state: &str,
        failure_reason: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut update = fields(json!({ "state": state }));
        if let Some(reason) = failure_reason {
            update.insert("failure_reason".to_string(), json!(reason));
        }
        let pair = match state {
            "failed" => self.config.status.failed,
            _ => self.config.status.processed,
        };
        if let Some(pair) = pair {
            update.insert(STATE_FIELD.to_string(), json!(pair.state));
            update.insert(STATUS_FIELD.to_string(), json!(pair.status));
        }
        self.store.update(WEBHOOK_LOG_ENTITY, log_id, update).await
    }

    async fn mark_failed_best_effort(&self, log_id: &str, reason: &str) {
        if let Err(e) = self.finalize_log(log_id, "failed", Some(reason)).await {
            warn!("could not mark webhook log failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StatusPairs;
    use crate::store::NOTE_ENTITY;
    use crate::store::memory::{Faults, InMemoryStore};
    use base64::Engine;

    const SIGNED: StatusPair = StatusPair { state: 1, status: 2 };
    const DECLINED: StatusPair = StatusPair { state: 2, status: 6 };

    fn config() -> AppConfig {
        AppConfig {
            status: StatusPairs {
                completed: Some(SIGNED),
                declined: Some(DECLINED),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn processor(store: Arc<InMemoryStore>, config: AppConfig) -> WebhookProcessor {
        WebhookProcessor::new(store, config)
    }

    async fn seed_target(store: &InMemoryStore, envelope_id: &str) -> String {
        store
            .seed("envelope", fields(json!({"envelope_id": envelope_id})))
            .await
    }

    fn completed_event(envelope_id: &str) -> InboundEvent {
        let body = base64::engine::general_purpose::STANDARD.encode(b"%PDF-1.7 signed");
        serde_json::from_value(json!({
            "event": "envelope-completed",
            "envelopeId": envelope_id,
            "summaryStatus": "completed",
            "documents": [{"name": "contract", "PDFBytes": body}],
        }))
        .unwrap()
    }

    fn log_rows_touching_state(updates: &[crate::store::memory::UpdateOp]) -> usize {
        updates
            .iter()
            .filter(|op| op.entity == WEBHOOK_LOG_ENTITY && op.fields.contains_key("state"))
            .count()
    }

    #[tokio::test]
    async fn completed_scenario_stores_artifact_and_finalizes_processed() {
        let store = Arc::new(InMemoryStore::new());
        let target_id = seed_target(&store, "E1").await;
        let result = processor(store.clone(), config())
            .process(&completed_event("E1"))
            .await;

        assert!(result.ok);
        assert_eq!(result.handled, Some("completed"));
        assert_eq!(result.envelope_id.as_deref(), Some("E1"));
        assert_eq!(result.exit_code(), 0);

        // Target got the signed pair and the artifact.
        let target = RecordRef::new("envelope", target_id);
        let row = &store.rows("envelope").await[0];
        assert_eq!(row.get(STATE_FIELD), Some(&json!(1)));
        assert_eq!(row.get(STATUS_FIELD), Some(&json!(2)));
        assert_eq!(
            store.file_bytes(&target, "document").await.unwrap(),
            b"%PDF-1.7 signed"
        );

        // Exactly one log row, one terminal transition, state processed.
        let logs = store.rows(WEBHOOK_LOG_ENTITY).await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].get("state"), Some(&json!("processed")));
        assert_eq!(log_rows_touching_state(&store.updates().await), 1);
    }

    #[tokio::test]
    async fn missing_envelope_id_fails_without_store_contact() {
        let store = Arc::new(InMemoryStore::new());
        let event: InboundEvent =
            serde_json::from_value(json!({"event": "envelope-completed"})).unwrap();
        let result = processor(store.clone(), config()).process(&event).await;

        assert!(!result.ok);
        assert_eq!(result.failure, Some(FailureKind::Input));
        assert_eq!(result.exit_code(), 1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn missing_event_name_fails_without_store_contact() {
        let store = Arc::new(InMemoryStore::new());
        let event: InboundEvent = serde_json::from_value(json!({"envelopeId": "E1"})).unwrap();
        let result = processor(store.clone(), config()).process(&event).await;

        assert_eq!(result.failure, Some(FailureKind::Input));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn invalid_token_marks_log_failed() {
        let store = Arc::new(InMemoryStore::new());
        seed_target(&store, "E1").await;
        store
            .seed(
                crate::store::VALIDATION_TOKEN_ENTITY,
                fields(json!({"name": "schema-x", "value": "right"})),
            )
            .await;

        let mut config = config();
        config.validation.token_schema = Some("schema-x".to_string());

        let mut event = completed_event("E1");
        event.validation_token = Some("wrong".to_string());

        let result = processor(store.clone(), config).process(&event).await;
        assert!(!result.ok);
        assert_eq!(result.failure, Some(FailureKind::Auth));
        assert_eq!(result.error.as_deref(), Some("invalid token"));
        assert_eq!(result.exit_code(), 2);

        let logs = store.rows(WEBHOOK_LOG_ENTITY).await;
        assert_eq!(logs[0].get("state"), Some(&json!("failed")));
        assert_eq!(logs[0].get("failure_reason"), Some(&json!("invalid token")));
        // Target untouched.
        let row = &store.rows("envelope").await[0];
        assert!(row.get(STATE_FIELD).is_none());
    }

    #[tokio::test]
    async fn unknown_envelope_marks_log_failed_with_target_not_found() {
        let store = Arc::new(InMemoryStore::new());
        let result = processor(store.clone(), config())
            .process(&completed_event("E-missing"))
            .await;

        assert!(!result.ok);
        assert_eq!(result.failure, Some(FailureKind::NotFound));
        assert_eq!(result.error.as_deref(), Some("target not found"));
        assert_eq!(result.exit_code(), 2);
        let logs = store.rows(WEBHOOK_LOG_ENTITY).await;
        assert_eq!(logs[0].get("state"), Some(&json!("failed")));
    }

    #[tokio::test]
    async fn unhandled_event_is_processed_without_target_mutation() {
        let store = Arc::new(InMemoryStore::new());
        seed_target(&store, "E1").await;
        let event: InboundEvent =
            serde_json::from_value(json!({"event": "envelope-sent", "envelopeId": "E1"})).unwrap();

        let result = processor(store.clone(), config()).process(&event).await;
        assert!(result.ok);
        assert_eq!(result.handled, Some("unhandled"));
        assert_eq!(result.exit_code(), 0);

        let row = &store.rows("envelope").await[0];
        assert!(row.get(STATE_FIELD).is_none());
        let logs = store.rows(WEBHOOK_LOG_ENTITY).await;
        assert_eq!(logs[0].get("state"), Some(&json!("processed")));
    }

    #[tokio::test]
    async fn declined_event_applies_its_configured_pair() {
        let store = Arc::new(InMemoryStore::new());
        seed_target(&store, "E1").await;
        let event: InboundEvent = serde_json::from_value(
            json!({"event": "recipient-declined", "envelopeId": "E1"}),
        )
        .unwrap();

        let result = processor(store.clone(), config()).process(&event).await;
        assert_eq!(result.handled, Some("declined"));
        let row = &store.rows("envelope").await[0];
        assert_eq!(row.get(STATE_FIELD), Some(&json!(2)));
        assert_eq!(row.get(STATUS_FIELD), Some(&json!(6)));
    }

    #[tokio::test]
    async fn audit_note_failure_never_affects_the_outcome() {
        let store = Arc::new(InMemoryStore::new());
        seed_target(&store, "E1").await;
        store
            .set_faults(Faults {
                fail_note_create: true,
                ..Default::default()
            })
            .await;
        let event: InboundEvent = serde_json::from_value(
            json!({"event": "recipient-declined", "envelopeId": "E1"}),
        )
        .unwrap();

        let result = processor(store.clone(), config()).process(&event).await;
        assert!(result.ok);
        assert!(store.rows(NOTE_ENTITY).await.is_empty());
        let logs = store.rows(WEBHOOK_LOG_ENTITY).await;
        assert_eq!(logs[0].get("state"), Some(&json!("processed")));
    }

    #[tokio::test]
    async fn ambiguous_envelope_ids_proceed_with_the_first_match() {
        let store = Arc::new(InMemoryStore::new());
        let first = seed_target(&store, "E1").await;
        seed_target(&store, "E1").await;
        let event: InboundEvent = serde_json::from_value(
            json!({"event": "recipient-declined", "envelopeId": "E1"}),
        )
        .unwrap();

        let result = processor(store.clone(), config()).process(&event).await;
        assert!(result.ok);
        let rows = store.rows("envelope").await;
        let updated = rows
            .iter()
            .find(|r| r.get(STATE_FIELD).is_some())
            .and_then(|r| r.get("id"))
            .and_then(Value::as_str)
            .unwrap();
        assert_eq!(updated, first);
    }

    #[tokio::test]
    async fn redelivery_is_a_fresh_independent_run() {
        let store = Arc::new(InMemoryStore::new());
        seed_target(&store, "E1").await;
        let p = processor(store.clone(), config());
        let event = completed_event("E1");

        assert!(p.process(&event).await.ok);
        assert!(p.process(&event).await.ok);

        // No dedup: two log rows, two trace notes. Accepted gap.
        assert_eq!(store.rows(WEBHOOK_LOG_ENTITY).await.len(), 2);
        let notes = store.rows(NOTE_ENTITY).await;
        assert_eq!(
            notes
                .iter()
                .filter(|n| n.get("body").is_some())
                .count(),
            2
        );
    }

    #[tokio::test]
    async fn upload_faults_do_not_fail_the_run() {
        let store = Arc::new(InMemoryStore::new());
        seed_target(&store, "E1").await;
        store
            .set_faults(Faults {
                fail_init_upload: true,
                fail_update_field: Some("document".to_string()),
                ..Default::default()
            })
            .await;

        // Both upload tiers are broken; the note fallback still lets the
        // run finalize as processed.
        let result = processor(store.clone(), config())
            .process(&completed_event("E1"))
            .await;
        assert!(result.ok);
        assert_eq!(result.handled, Some("completed"));
        let logs = store.rows(WEBHOOK_LOG_ENTITY).await;
        assert_eq!(logs[0].get("state"), Some(&json!("processed")));
    }

    #[test]
    fn terminal_json_shape() {
        let ok = TerminalResult::handled(EventCategory::Completed, "E1");
        let obj = ok.to_json();
        assert_eq!(obj["ok"], json!(true));
        assert_eq!(obj["source"], json!("crm"));
        assert_eq!(obj["where"], json!("webhook"));
        assert_eq!(obj["handled"], json!("completed"));
        assert_eq!(obj["envelopeId"], json!("E1"));
        assert!(obj.get("error").is_none());

        let failed = TerminalResult::failure(
            FailureKind::NotFound,
            Some("E2"),
            "target not found".to_string(),
        );
        let obj = failed.to_json();
        assert_eq!(obj["ok"], json!(false));
        assert_eq!(obj["error"], json!("target not found"));
        assert!(obj.get("handled").is_none());
    }
}
