use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::db::billing_store::{BillingUpdate, UpdateOutcome};
use crate::models::plan::PlanTier;
use crate::webhooks::dispatcher::{HandlerContext, WebhookHandler};
use crate::webhooks::envelope::{resolve_reference_field, resolve_reference_id};
use crate::webhooks::handlers::{entitles, metadata_user_id, resolve_user_id};
use crate::webhooks::outcome::{HandlerOutcome, SkipReason, WebhookError};

/// Reconciles subscription-status-change events into the user's
/// entitlement flag. `active`/`trialing` entitle; every other status
/// downgrades.
pub struct SubscriptionHandler {
    /// Price ids of the paid catalog; used only to sanity-check the tier
    /// resolution, entitlement never depends on it.
    pro_price_ids: Vec<String>,
}

impl SubscriptionHandler {
    pub fn new(pro_price_ids: Vec<String>) -> Self {
        Self { pro_price_ids }
    }

    /// Auxiliary display tier, resolved from the subscription's price
    /// reference. Not part of the idempotency contract.
    fn resolve_plan_tier(&self, price_id: Option<&str>, entitled: bool) -> PlanTier {
        if !entitled {
            return PlanTier::Free;
        }
        if let Some(price) = price_id {
            if !self.pro_price_ids.iter().any(|p| p == price) {
                debug!(price, "subscription price id not in configured pro catalog");
            }
        }
        PlanTier::Pro
    }
}

#[async_trait]
impl WebhookHandler for SubscriptionHandler {
    fn event_types(&self) -> &'static [&'static str] {
        &[
            "customer.subscription.created",
            "customer.subscription.updated",
            "customer.subscription.deleted",
        ]
    }

    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<HandlerOutcome, WebhookError> {
        let subscription = &ctx.envelope.object;
        let subscription_id = subscription
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MalformedObject("subscription.id"))?;
        let status = subscription
            .get("status")
            .and_then(|v| v.as_str())
            .ok_or(WebhookError::MalformedObject("subscription.status"))?;
        let customer_id = resolve_reference_field(subscription, "customer");

        let user_id = match resolve_user_id(
            ctx.tx,
            metadata_user_id(subscription),
            customer_id,
        )
        .await?
        {
            Some(user_id) => user_id,
            None => {
                warn!(
                    event_id = %ctx.envelope.id,
                    subscription_id,
                    "unable to resolve user for subscription event"
                );
                return Ok(HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser));
            }
        };

        let entitled = entitles(status);
        let price_id = subscription
            .get("items")
            .and_then(|items| items.get("data"))
            .and_then(|data| data.get(0))
            .and_then(|item| item.get("price"))
            .and_then(resolve_reference_id);
        let plan = self.resolve_plan_tier(price_id, entitled);

        let update = BillingUpdate {
            user_id,
            is_entitled: entitled,
            stripe_customer_id: customer_id.map(String::from),
            stripe_subscription_id: Some(subscription_id.to_string()),
            plan_tier: Some(plan),
            event_created_at: ctx.envelope.created_at,
        };
        match ctx.tx.apply_billing_update(&update).await? {
            UpdateOutcome::Applied => {
                info!(
                    %user_id,
                    subscription_id,
                    status,
                    change = if entitled { "subscription_updated" } else { "subscription_downgraded" },
                    "subscription reconciled"
                );
                Ok(HandlerOutcome::Processed { user_id })
            }
            UpdateOutcome::Stale => {
                info!(%user_id, subscription_id, "ignoring stale subscription event");
                Ok(HandlerOutcome::Skipped(SkipReason::StaleEvent))
            }
            UpdateOutcome::UserMissing => {
                warn!(%user_id, subscription_id, "resolved user no longer exists");
                Ok(HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::billing_store::BillingStore;
    use crate::db::mock_billing_store::MockBillingStore;
    use crate::webhooks::envelope::EventEnvelope;
    use serde_json::json;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn subscription_event(
        id: &str,
        created: i64,
        object: serde_json::Value,
    ) -> EventEnvelope {
        EventEnvelope {
            id: id.into(),
            event_type: "customer.subscription.updated".into(),
            created_at: OffsetDateTime::from_unix_timestamp(created).unwrap(),
            object,
        }
    }

    async fn run(
        store: &MockBillingStore,
        handler: &SubscriptionHandler,
        envelope: &EventEnvelope,
    ) -> Result<HandlerOutcome, WebhookError> {
        let mut tx = store.begin().await.unwrap();
        let outcome = handler
            .handle(HandlerContext {
                envelope,
                tx: tx.as_mut(),
            })
            .await;
        tx.commit().await.unwrap();
        outcome
    }

    fn sub_object(user_id: Uuid, status: &str) -> serde_json::Value {
        json!({
            "id": "sub_1",
            "status": status,
            "customer": "cus_1",
            "metadata": { "user_id": user_id.to_string() },
            "items": { "data": [ { "price": { "id": "price_pro" } } ] }
        })
    }

    #[tokio::test]
    async fn active_status_entitles_user() {
        let store = MockBillingStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user(user_id, None);
        let handler = SubscriptionHandler::new(vec!["price_pro".into()]);

        let envelope = subscription_event("evt_1", 1_700_000_000, sub_object(user_id, "active"));
        let outcome = run(&store, &handler, &envelope).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Processed { user_id });
        let user = store.user(user_id).unwrap();
        assert!(user.is_entitled);
        assert_eq!(user.plan_tier.as_deref(), Some("pro"));
        assert_eq!(user.stripe_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(user.stripe_subscription_id.as_deref(), Some("sub_1"));
        assert_eq!(user.billing_version, 1);
        assert_eq!(
            user.last_billing_event_at.unwrap().unix_timestamp(),
            1_700_000_000
        );
    }

    #[tokio::test]
    async fn trialing_entitles_and_past_due_downgrades() {
        let store = MockBillingStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user(user_id, None);
        let handler = SubscriptionHandler::new(vec![]);

        let envelope =
            subscription_event("evt_1", 1_700_000_000, sub_object(user_id, "trialing"));
        run(&store, &handler, &envelope).await.unwrap();
        assert!(store.user(user_id).unwrap().is_entitled);

        let envelope =
            subscription_event("evt_2", 1_700_000_100, sub_object(user_id, "past_due"));
        run(&store, &handler, &envelope).await.unwrap();
        let user = store.user(user_id).unwrap();
        assert!(!user.is_entitled);
        assert_eq!(user.plan_tier.as_deref(), Some("free"));
        assert_eq!(user.billing_version, 2);
    }

    #[tokio::test]
    async fn incomplete_expired_and_canceled_downgrade() {
        let store = MockBillingStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user(user_id, None);
        let handler = SubscriptionHandler::new(vec![]);

        for (i, status) in ["incomplete_expired", "canceled"].into_iter().enumerate() {
            let envelope = subscription_event(
                &format!("evt_{}", i),
                1_700_000_000 + i as i64,
                sub_object(user_id, status),
            );
            run(&store, &handler, &envelope).await.unwrap();
            assert!(!store.user(user_id).unwrap().is_entitled);
        }
    }

    #[tokio::test]
    async fn resolves_user_by_customer_id_when_metadata_missing() {
        let store = MockBillingStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user(user_id, Some("cus_fallback"));
        let handler = SubscriptionHandler::new(vec![]);

        let object = json!({
            "id": "sub_1",
            "status": "active",
            "customer": { "id": "cus_fallback" },
            "metadata": {}
        });
        let envelope = subscription_event("evt_1", 1_700_000_000, object);
        let outcome = run(&store, &handler, &envelope).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Processed { user_id });
        assert!(store.user(user_id).unwrap().is_entitled);
    }

    #[tokio::test]
    async fn unresolvable_user_is_skipped_not_failed() {
        let store = MockBillingStore::new();
        let handler = SubscriptionHandler::new(vec![]);

        let object = json!({
            "id": "sub_1",
            "status": "active",
            "customer": "cus_unknown",
            "metadata": {}
        });
        let envelope = subscription_event("evt_1", 1_700_000_000, object);
        let outcome = run(&store, &handler, &envelope).await.unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser)
        );
    }

    #[tokio::test]
    async fn metadata_user_unknown_to_store_is_skipped() {
        let store = MockBillingStore::new();
        let handler = SubscriptionHandler::new(vec![]);

        // Valid uuid in metadata, but no such user row.
        let envelope = subscription_event(
            "evt_1",
            1_700_000_000,
            sub_object(Uuid::new_v4(), "active"),
        );
        let outcome = run(&store, &handler, &envelope).await.unwrap();

        assert_eq!(
            outcome,
            HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser)
        );
    }

    #[tokio::test]
    async fn stale_event_does_not_overwrite_newer_state() {
        let store = MockBillingStore::new();
        let user_id = Uuid::new_v4();
        store.seed_user(user_id, None);
        let handler = SubscriptionHandler::new(vec![]);

        let newer = subscription_event("evt_new", 1_700_000_200, sub_object(user_id, "active"));
        run(&store, &handler, &newer).await.unwrap();

        let stale =
            subscription_event("evt_old", 1_700_000_100, sub_object(user_id, "canceled"));
        let outcome = run(&store, &handler, &stale).await.unwrap();

        assert_eq!(outcome, HandlerOutcome::Skipped(SkipReason::StaleEvent));
        let user = store.user(user_id).unwrap();
        assert!(user.is_entitled);
        assert_eq!(user.billing_version, 1);
    }

    #[tokio::test]
    async fn missing_status_is_a_malformed_object_error() {
        let store = MockBillingStore::new();
        let handler = SubscriptionHandler::new(vec![]);
        let envelope =
            subscription_event("evt_1", 1_700_000_000, json!({ "id": "sub_1" }));
        let result = run(&store, &handler, &envelope).await;
        assert!(matches!(
            result,
            Err(WebhookError::MalformedObject("subscription.status"))
        ));
    }
}
