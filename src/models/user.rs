use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A Plumage creator account. Billing columns are only ever mutated by the
/// webhook reconciliation handlers, inside the coordinator's transaction.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct User {
    pub id: uuid::Uuid,
    pub email: String,
    /// Public creator handle; read-side profile caches are keyed by it.
    pub handle: String,
    /// Gates paid features ("pro" status).
    pub is_entitled: bool,
    pub plan_tier: Option<String>,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    /// Incremented on every committed billing change.
    pub billing_version: i64,
    pub last_billing_event_at: Option<time::OffsetDateTime>,
    pub created_at: time::OffsetDateTime,
}
