use core::fmt;

use uuid::Uuid;

use crate::services::stripe::StripeServiceError;

/// Why an event was acknowledged without applying any effect. Skips are
/// successful no-ops from the provider's point of view; the reason string
/// is what operators see in logs and audit entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    UnhandledEventType,
    CannotIdentifyUser,
    InvoiceHasNoSubscription,
    SubscriptionNotInFailureStatus,
    NonActionableStatus,
    ErrorProcessingPaymentSuccess,
    StaleEvent,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::UnhandledEventType => "unhandled_event_type",
            SkipReason::CannotIdentifyUser => "cannot_identify_user",
            SkipReason::InvoiceHasNoSubscription => "invoice_has_no_subscription",
            SkipReason::SubscriptionNotInFailureStatus => "subscription_not_in_failure_status",
            SkipReason::NonActionableStatus => "non_actionable_status",
            SkipReason::ErrorProcessingPaymentSuccess => "error_processing_payment_success",
            SkipReason::StaleEvent => "stale_event",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a handler reports back to the coordinator. The failure leg of the
/// taxonomy is the `Err(WebhookError)` arm of the handler's `Result`:
/// failures roll the whole transaction back and ask the provider to retry.
#[derive(Debug, PartialEq, Eq)]
pub enum HandlerOutcome {
    Processed { user_id: Uuid },
    Skipped(SkipReason),
}

/// Retry-worthy faults. Everything here causes a rollback and a 500.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("billing state write failed: {0}")]
    Persistence(#[from] sqlx::Error),
    #[error("provider call failed: {0}")]
    Provider(#[from] StripeServiceError),
    #[error("malformed event object: missing {0}")]
    MalformedObject(&'static str),
}

/// Final verdict of the coordinator for one delivery, consumed by the
/// response composer. All three variants map to 200 `{"received": true}`.
#[derive(Debug, PartialEq, Eq)]
pub enum ProcessOutcome {
    Processed { user_id: Uuid },
    Duplicate,
    Skipped(SkipReason),
}
