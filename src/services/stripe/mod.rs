// NOTE: async-stripe is compiled with a minimal feature set (runtime-tokio-hyper,
// checkout, webhook-events, and connect to satisfy webhook payload types). Touching
// APIs outside those features will require updating Cargo.toml explicitly so we keep
// compile times and binary size in check.
use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum StripeServiceError {
    #[error("stripe api error: {0}")]
    Api(String),
    #[error("webhook verification failed: {0}")]
    Webhook(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("other error: {0}")]
    Other(String),
}

impl From<stripe::StripeError> for StripeServiceError {
    fn from(err: stripe::StripeError) -> Self {
        StripeServiceError::Api(err.to_string())
    }
}

impl From<stripe::WebhookError> for StripeServiceError {
    fn from(err: stripe::WebhookError) -> Self {
        StripeServiceError::Webhook(err.to_string())
    }
}

/// A verified webhook notification, as delivered by Stripe. `payload` is the
/// full event body; the envelope parser extracts the pieces the engine uses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    pub r#type: String,
    pub payload: serde_json::Value,
}

/// The subset of a Stripe subscription the reconciliation handlers consume.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: String,
    pub status: String,
    pub customer_id: Option<String>,
    /// Price id of the first subscription item, when present.
    pub price_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[async_trait]
pub trait StripeService: Send + Sync {
    /// Verifies the raw webhook body against the signature header and the
    /// configured signing secret. Must be called before any other processing.
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError>;

    /// Fetches the current state of a subscription. Used by the payment
    /// handler, which must act on the subscription's present status rather
    /// than the snapshot embedded in the invoice event.
    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError>;
}

mod live;
mod mock;

pub use live::LiveStripeService;
pub use mock::MockStripeService;
