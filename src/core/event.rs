use base64::Engine;
use serde::Deserialize;
use serde_json::{Value, json};

/// One normalized lifecycle event from the signing service, as delivered by
/// the transport collaborator. Only `event` and `envelopeId` are required;
/// their absence is a pre-flight failure before any store access.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEvent {
    #[serde(default)]
    pub event: Option<String>,

    #[serde(default)]
    pub envelope_id: Option<String>,

    #[serde(default)]
    pub summary_status: Option<String>,

    #[serde(default)]
    pub email_subject: Option<String>,

    #[serde(default)]
    pub sender: Option<EventSender>,

    #[serde(default)]
    pub validation_token: Option<String>,

    #[serde(default)]
    pub documents: Vec<DocumentPayload>,

    /// Original payload, preserved verbatim for the audit trail.
    #[serde(default)]
    pub raw_body: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSender {
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DocumentPayload {
    pub name: String,

    /// Base64-encoded artifact bytes.
    #[serde(rename = "PDFBytes")]
    pub pdf_bytes: String,
}

impl DocumentPayload {
    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(self.pdf_bytes.trim())
    }

    /// Document name as a filename; the signing service omits the extension.
    pub fn filename(&self) -> String {
        let name = self.name.trim();
        if name.rsplit_once('.').is_some_and(|(stem, ext)| {
            !stem.is_empty() && !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric())
        }) {
            name.to_string()
        } else {
            format!("{}.pdf", name)
        }
    }
}

impl InboundEvent {
    /// Compact projection recorded on the webhook log.
    pub fn summary(&self) -> Value {
        json!({
            "event": self.event,
            "envelopeId": self.envelope_id,
            "summaryStatus": self.summary_status,
            "emailSubject": self.email_subject,
            "sender": self.sender.as_ref().map(|s| json!({
                "userName": s.user_name,
                "email": s.email,
            })),
            "documents": self.documents.len(),
        })
    }
}

/// The four handling categories. Unrecognized event names are Unhandled,
/// never an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Completed,
    FinishLater,
    Declined,
    Unhandled,
}

impl EventCategory {
    pub fn classify(event_name: &str) -> Self {
        let name = event_name.trim().to_ascii_lowercase();
        match name.as_str() {
            "envelope-completed" => Self::Completed,
            _ if name.ends_with("finish-later") => Self::FinishLater,
            _ if name.ends_with("declined") => Self::Declined,
            _ => Self::Unhandled,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::FinishLater => "finish_later",
            Self::Declined => "declined",
            Self::Unhandled => "unhandled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_normalized_wire_shape() {
        let line = r#"{
            "event": "envelope-completed",
            "envelopeId": "E1",
            "summaryStatus": "completed",
            "emailSubject": "Please sign",
            "sender": {"userName": "Dana", "email": "dana@example.com"},
            "validationToken": "tok",
            "documents": [{"name": "contract", "PDFBytes": "aGVsbG8="}],
            "rawBody": "{...}"
        }"#;
        let event: InboundEvent = serde_json::from_str(line).unwrap();
        assert_eq!(event.event.as_deref(), Some("envelope-completed"));
        assert_eq!(event.envelope_id.as_deref(), Some("E1"));
        assert_eq!(event.sender.unwrap().user_name.as_deref(), Some("Dana"));
        assert_eq!(event.documents.len(), 1);
        assert_eq!(event.documents[0].decode().unwrap(), b"hello");
    }

    #[test]
    fn minimal_event_parses_with_everything_absent() {
        let event: InboundEvent = serde_json::from_str("{}").unwrap();
        assert!(event.event.is_none());
        assert!(event.envelope_id.is_none());
        assert!(event.documents.is_empty());
    }

    #[test]
    fn classification_table() {
        use EventCategory::*;
        for (name, expected) in [
            ("envelope-completed", Completed),
            (" Envelope-Completed ", Completed),
            ("recipient-finish-later", FinishLater),
            ("envelope-declined", Declined),
            ("recipient-declined", Declined),
            ("envelope-sent", Unhandled),
            ("envelope-voided", Unhandled),
            ("", Unhandled),
        ] {
            assert_eq!(EventCategory::classify(name), expected, "event {name:?}");
        }
    }

    #[test]
    fn filename_gets_a_pdf_extension_when_missing() {
        let doc = DocumentPayload {
            name: "Signed contract".to_string(),
            pdf_bytes: String::new(),
        };
        assert_eq!(doc.filename(), "Signed contract.pdf");

        let doc = DocumentPayload {
            name: "summary.pdf".to_string(),
            pdf_bytes: String::new(),
        };
        assert_eq!(doc.filename(), "summary.pdf");
    }

    #[test]
    fn summary_is_a_compact_projection() {
        let event: InboundEvent = serde_json::from_str(
            r#"{"event": "envelope-completed", "envelopeId": "E1",
                "documents": [{"name": "a", "PDFBytes": ""},
                              {"name": "b", "PDFBytes": ""}]}"#,
        )
        .unwrap();
        let summary = event.summary();
        assert_eq!(summary["envelopeId"], "E1");
        assert_eq!(summary["documents"], 2);
        // The document bytes themselves never land in the projection.
        assert!(summary.to_string().len() < 200);
    }

    #[test]
    fn bad_base64_is_a_decode_error() {
        let doc = DocumentPayload {
            name: "x".to_string(),
            pdf_bytes: "!!not-base64!!".to_string(),
        };
        assert!(doc.decode().is_err());
    }
}
