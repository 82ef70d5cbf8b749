use time::OffsetDateTime;

use crate::services::observability::ReportContext;
use crate::services::stripe::StripeEvent;

/// The verified, parsed notification: stable event id, type tag, provider
/// timestamp, and the nested `data.object` payload. Never mutated.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    pub id: String,
    pub event_type: String,
    pub created_at: OffsetDateTime,
    pub object: serde_json::Value,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("event payload missing {0}")]
    MissingField(&'static str),
    #[error("event created timestamp out of range: {0}")]
    InvalidTimestamp(i64),
}

impl EventEnvelope {
    pub fn from_stripe_event(event: &StripeEvent) -> Result<Self, EnvelopeError> {
        let created = event
            .payload
            .get("created")
            .and_then(|v| v.as_i64())
            .ok_or(EnvelopeError::MissingField("created"))?;
        let created_at = OffsetDateTime::from_unix_timestamp(created)
            .map_err(|_| EnvelopeError::InvalidTimestamp(created))?;
        let object = event
            .payload
            .get("data")
            .and_then(|d| d.get("object"))
            .cloned()
            .ok_or(EnvelopeError::MissingField("data.object"))?;
        Ok(Self {
            id: event.id.clone(),
            event_type: event.r#type.clone(),
            created_at,
            object,
        })
    }

    /// Id of the nested object, kept on the ProcessingRecord for audit.
    pub fn object_id(&self) -> Option<&str> {
        self.object.get("id").and_then(|v| v.as_str())
    }

    pub fn report_context(&self) -> ReportContext {
        let ctx = ReportContext::event(&self.id, &self.event_type);
        match self.object_id() {
            Some(object_id) => ctx.with_object_id(object_id),
            None => ctx,
        }
    }
}

/// Normalizes an "expanded reference": a foreign-key field may arrive
/// either as a bare id string or as an expanded object carrying an `id`.
pub fn resolve_reference_id(value: &serde_json::Value) -> Option<&str> {
    match value {
        serde_json::Value::String(s) => Some(s.as_str()),
        serde_json::Value::Object(map) => map.get("id").and_then(|v| v.as_str()),
        _ => None,
    }
}

/// `resolve_reference_id` applied to a field of an event object.
pub fn resolve_reference_field<'a>(
    object: &'a serde_json::Value,
    field: &str,
) -> Option<&'a str> {
    object.get(field).and_then(resolve_reference_id)
}
