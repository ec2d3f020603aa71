use std::sync::Arc;

use anyhow::Result;
use serde_json::json;

use crate::core::event::InboundEvent;
use crate::store::{NOTE_ENTITY, RecordRef, RecordStore, fields};

/// Appends human-readable trace notes to a record. Best-effort by contract:
/// callers discard the error (with a warn) and never let it affect the
/// run's outcome. Distinct from the webhook log's durable transitions.
pub struct AuditWriter {
    store: Arc<dyn RecordStore>,
}

impl AuditWriter {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub async fn append_note(&self, target: &RecordRef, subject: &str, body: &str) -> Result<()> {
        self.store
            .create(
                NOTE_ENTITY,
                fields(json!({
                    "subject": subject,
                    "body": body,
                    "regarding_entity": target.entity,
                    "regarding_id": target.id,
                })),
            )
            .await?;
        Ok(())
    }
}

/// Subject and body of the trace note summarizing one inbound event.
pub fn describe_event(event: &InboundEvent, event_name: &str) -> (String, String) {
    let subject = format!("Envelope event: {}", event_name);
    let mut lines = Vec::new();
    if let Some(id) = &event.envelope_id {
        lines.push(format!("Envelope: {}", id));
    }
    if let Some(status) = &event.summary_status {
        lines.push(format!("Status: {}", status));
    }
    if let Some(subject) = &event.email_subject {
        lines.push(format!("Subject: {}", subject));
    }
    if let Some(sender) = &event.sender {
        lines.push(format!(
            "Sender: {} <{}>",
            sender.user_name.as_deref().unwrap_or("unknown"),
            sender.email.as_deref().unwrap_or("unknown")
        ));
    }
    lines.push(format!("Documents: {}", event.documents.len()));
    (subject, lines.join("\n"))
}
