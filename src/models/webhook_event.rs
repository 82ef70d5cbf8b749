use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// A committed row in `webhook_event_log`. Its existence is the sole
/// idempotency signal for the event id; `processed_at` distinguishes
/// "seen and actioned" from "seen and intentionally skipped".
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct ProcessingRecord {
    pub external_event_id: String,
    pub object_id: Option<String>,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewProcessingRecord {
    pub external_event_id: String,
    pub object_id: Option<String>,
    pub received_at: OffsetDateTime,
}

impl NewProcessingRecord {
    pub fn new(
        external_event_id: impl Into<String>,
        object_id: Option<String>,
        received_at: OffsetDateTime,
    ) -> Self {
        Self {
            external_event_id: external_event_id.into(),
            object_id,
            received_at,
        }
    }
}
