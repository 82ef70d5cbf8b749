use tracing::{info, warn};
use uuid::Uuid;

use crate::db::billing_store::BillingTx;

pub mod payment;
pub mod subscription;

pub use payment::PaymentHandler;
pub use subscription::SubscriptionHandler;

/// Subscription statuses that grant entitlement.
pub(crate) fn entitles(status: &str) -> bool {
    matches!(status, "active" | "trialing")
}

/// Statuses meaning the provider has given up (or is past) collecting
/// payment. Anything else is still inside the provider's own retry window.
pub(crate) fn failure_status(status: &str) -> bool {
    matches!(
        status,
        "past_due" | "unpaid" | "incomplete" | "incomplete_expired"
    )
}

/// Two-tier user resolution: prefer the user id we stamped into the
/// subscription's metadata at checkout; fall back to the stored Stripe
/// customer mapping. The fallback is logged so we can see how often the
/// metadata path is missing in the field.
pub(crate) async fn resolve_user_id(
    tx: &mut dyn BillingTx,
    metadata_user_id: Option<&str>,
    customer_id: Option<&str>,
) -> Result<Option<Uuid>, sqlx::Error> {
    if let Some(raw) = metadata_user_id {
        match Uuid::parse_str(raw) {
            Ok(user_id) => return Ok(Some(user_id)),
            Err(_) => warn!(raw, "subscription metadata user_id is not a valid uuid"),
        }
    }
    if let Some(customer_id) = customer_id {
        if let Some(user_id) = tx.find_user_id_by_customer(customer_id).await? {
            info!(customer_id, %user_id, "resolved user via stripe customer id fallback");
            return Ok(Some(user_id));
        }
    }
    Ok(None)
}

/// `metadata.user_id` out of an event object or subscription metadata map.
pub(crate) fn metadata_user_id(object: &serde_json::Value) -> Option<&str> {
    object
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
}
