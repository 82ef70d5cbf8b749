use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::plan::PlanTier;
use crate::models::webhook_event::NewProcessingRecord;

/// Result of attempting to insert a ProcessingRecord. The unique constraint
/// on `external_event_id` is the idempotency authority: a conflict means a
/// concurrent or earlier delivery of the same event already holds the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Result of applying a billing update to a user row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied,
    /// The user exists but already carries billing state from a newer event;
    /// the write was rejected to keep late deliveries from clobbering it.
    Stale,
    UserMissing,
}

/// The billing-state change a reconciliation handler wants persisted.
/// `None` reference fields leave the stored value untouched.
#[derive(Debug, Clone)]
pub struct BillingUpdate {
    pub user_id: Uuid,
    pub is_entitled: bool,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
    pub plan_tier: Option<PlanTier>,
    /// Provider timestamp of the event being applied; drives the
    /// stale-event guard and becomes `last_billing_event_at`.
    pub event_created_at: OffsetDateTime,
}

/// Hands out transactions. One transaction spans one inbound delivery:
/// dedup insert, handler effects, and the processed stamp commit together
/// or not at all.
#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn BillingTx>, sqlx::Error>;
}

/// A single open transaction. Handlers receive `&mut dyn BillingTx` and so
/// cannot commit or roll back; only the coordinator holds the box.
#[async_trait]
pub trait BillingTx: Send {
    async fn insert_processing_record(
        &mut self,
        record: &NewProcessingRecord,
    ) -> Result<InsertOutcome, sqlx::Error>;

    async fn mark_processed(
        &mut self,
        external_event_id: &str,
        processed_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    async fn find_user_id_by_customer(
        &mut self,
        customer_id: &str,
    ) -> Result<Option<Uuid>, sqlx::Error>;

    async fn apply_billing_update(
        &mut self,
        update: &BillingUpdate,
    ) -> Result<UpdateOutcome, sqlx::Error>;

    async fn commit(self: Box<Self>) -> Result<(), sqlx::Error>;

    async fn rollback(self: Box<Self>) -> Result<(), sqlx::Error>;
}
