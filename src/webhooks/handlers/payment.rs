use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::db::billing_store::{BillingUpdate, UpdateOutcome};
use crate::services::observability::ObservabilitySink;
use crate::services::stripe::StripeService;
use crate::webhooks::dispatcher::{HandlerContext, WebhookHandler};
use crate::webhooks::envelope::resolve_reference_field;
use crate::webhooks::handlers::{entitles, failure_status, resolve_user_id};
use crate::webhooks::outcome::{HandlerOutcome, SkipReason, WebhookError};

/// Reconciles invoice payment events. Acts on the subscription's *current*
/// status (retrieved from the provider), not the snapshot inside the
/// invoice: a failed charge on a still-`active` subscription is inside the
/// provider's own retry window and must not downgrade yet.
pub struct PaymentHandler {
    stripe: Arc<dyn StripeService>,
    observability: Arc<dyn ObservabilitySink>,
}

impl PaymentHandler {
    pub fn new(stripe: Arc<dyn StripeService>, observability: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            stripe,
            observability,
        }
    }

    async fn payment_succeeded(
        &self,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<HandlerOutcome, WebhookError> {
        match self.apply_payment_success(ctx).await {
            Ok(outcome) => Ok(outcome),
            // A billing-state write failure is a real, retry-worthy fault.
            Err(err @ WebhookError::Persistence(_)) => Err(err),
            // A missed upgrade is low-severity; do not make the provider
            // redeliver forever over it.
            Err(err) => {
                self.observability.report_error(
                    "error processing payment success",
                    &err,
                    ctx.envelope.report_context(),
                );
                Ok(HandlerOutcome::Skipped(
                    SkipReason::ErrorProcessingPaymentSuccess,
                ))
            }
        }
    }

    async fn apply_payment_success(
        &self,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<HandlerOutcome, WebhookError> {
        let invoice = &ctx.envelope.object;
        let subscription_id = match resolve_reference_field(invoice, "subscription") {
            Some(id) => id.to_string(),
            // One-time payment; nothing to reconcile.
            None => {
                return Ok(HandlerOutcome::Skipped(
                    SkipReason::InvoiceHasNoSubscription,
                ))
            }
        };

        let sub = self.stripe.retrieve_subscription(&subscription_id).await?;
        let user_id = match resolve_user_id(
            &mut *ctx.tx,
            sub.metadata.get("user_id").map(String::as_str),
            sub.customer_id.as_deref(),
        )
        .await?
        {
            Some(user_id) => user_id,
            None => {
                warn!(
                    event_id = %ctx.envelope.id,
                    subscription_id = %sub.id,
                    "unable to resolve user for paid invoice"
                );
                return Ok(HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser));
            }
        };

        if !entitles(&sub.status) {
            info!(
                %user_id,
                subscription_id = %sub.id,
                status = %sub.status,
                "payment succeeded but subscription status does not entitle"
            );
            return Ok(HandlerOutcome::Skipped(SkipReason::NonActionableStatus));
        }

        let update = BillingUpdate {
            user_id,
            is_entitled: true,
            stripe_customer_id: sub.customer_id.clone(),
            stripe_subscription_id: Some(sub.id.clone()),
            plan_tier: None,
            event_created_at: ctx.envelope.created_at,
        };
        match ctx.tx.apply_billing_update(&update).await? {
            UpdateOutcome::Applied => {
                info!(%user_id, subscription_id = %sub.id, "entitlement confirmed after payment");
                Ok(HandlerOutcome::Processed { user_id })
            }
            UpdateOutcome::Stale => Ok(HandlerOutcome::Skipped(SkipReason::StaleEvent)),
            UpdateOutcome::UserMissing => {
                Ok(HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser))
            }
        }
    }

    async fn payment_failed(
        &self,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<HandlerOutcome, WebhookError> {
        let invoice = &ctx.envelope.object;

        // Operationally significant regardless of the outcome below.
        self.observability.report_audit(
            "invoice payment failed",
            ctx.envelope.report_context().with_detail(json!({
                "invoice_id": ctx.envelope.object_id(),
                "amount_due": invoice.get("amount_due").and_then(|v| v.as_i64()),
                "attempt_count": invoice.get("attempt_count").and_then(|v| v.as_i64()),
            })),
        );

        let subscription_id = match resolve_reference_field(invoice, "subscription") {
            Some(id) => id.to_string(),
            None => {
                return Ok(HandlerOutcome::Skipped(
                    SkipReason::InvoiceHasNoSubscription,
                ))
            }
        };

        let sub = self.stripe.retrieve_subscription(&subscription_id).await?;
        if !failure_status(&sub.status) {
            info!(
                subscription_id = %sub.id,
                status = %sub.status,
                "payment failed but provider is still retrying; no downgrade"
            );
            return Ok(HandlerOutcome::Skipped(
                SkipReason::SubscriptionNotInFailureStatus,
            ));
        }

        let user_id = match resolve_user_id(
            &mut *ctx.tx,
            sub.metadata.get("user_id").map(String::as_str),
            sub.customer_id.as_deref(),
        )
        .await?
        {
            Some(user_id) => user_id,
            None => {
                warn!(
                    event_id = %ctx.envelope.id,
                    subscription_id = %sub.id,
                    "unable to resolve user for failed invoice"
                );
                return Ok(HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser));
            }
        };

        let update = BillingUpdate {
            user_id,
            is_entitled: false,
            stripe_customer_id: sub.customer_id.clone(),
            stripe_subscription_id: Some(sub.id.clone()),
            plan_tier: None,
            event_created_at: ctx.envelope.created_at,
        };
        match ctx.tx.apply_billing_update(&update).await? {
            UpdateOutcome::Applied => {
                info!(
                    %user_id,
                    subscription_id = %sub.id,
                    status = %sub.status,
                    "entitlement revoked after payment failure"
                );
                Ok(HandlerOutcome::Processed { user_id })
            }
            UpdateOutcome::Stale => Ok(HandlerOutcome::Skipped(SkipReason::StaleEvent)),
            UpdateOutcome::UserMissing => {
                Ok(HandlerOutcome::Skipped(SkipReason::CannotIdentifyUser))
            }
        }
    }
}

#[async_trait]
impl WebhookHandler for PaymentHandler {
    fn event_types(&self) -> &'static [&'static str] {
        &["invoice.payment_succeeded", "invoice.payment_failed"]
    }

    async fn handle(&self, mut ctx: HandlerContext<'_>) -> Result<HandlerOutcome, WebhookError> {
        match ctx.envelope.event_type.as_str() {
            "invoice.payment_succeeded" => self.payment_succeeded(&mut ctx).await,
            "invoice.payment_failed" => self.payment_failed(&mut ctx).await,
            _ => Ok(HandlerOutcome::Skipped(SkipReason::UnhandledEventType)),
        }
    }
}
