use super::{StripeEvent, StripeService, StripeServiceError, SubscriptionInfo};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Test double: accepts any signature (unless told otherwise) and serves
/// subscriptions seeded by the test.
#[derive(Clone, Default)]
pub struct MockStripeService {
    pub events: Arc<Mutex<Vec<StripeEvent>>>,
    subscriptions: Arc<Mutex<HashMap<String, SubscriptionInfo>>>,
    reject_signatures: Arc<Mutex<bool>>,
    fail_retrieve: Arc<Mutex<bool>>,
}

impl MockStripeService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rejected_signatures(self) -> Self {
        *self.reject_signatures.lock().unwrap() = true;
        self
    }

    pub fn with_failing_retrieve(self) -> Self {
        *self.fail_retrieve.lock().unwrap() = true;
        self
    }

    pub fn seed_subscription(&self, sub: SubscriptionInfo) {
        self.subscriptions.lock().unwrap().insert(sub.id.clone(), sub);
    }
}

#[async_trait]
impl StripeService for MockStripeService {
    fn verify_webhook(
        &self,
        payload: &[u8],
        _signature_header: &str,
    ) -> Result<StripeEvent, StripeServiceError> {
        if *self.reject_signatures.lock().unwrap() {
            return Err(StripeServiceError::Webhook(
                "signature rejected by mock".into(),
            ));
        }
        let val: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|e| StripeServiceError::Serde(e.to_string()))?;
        let id = val
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("evt_mock")
            .to_string();
        let ty = val
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let evt = StripeEvent {
            id,
            r#type: ty,
            payload: val,
        };
        self.events.lock().unwrap().push(evt.clone());
        Ok(evt)
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> Result<SubscriptionInfo, StripeServiceError> {
        if *self.fail_retrieve.lock().unwrap() {
            return Err(StripeServiceError::Api("simulated outage".into()));
        }
        self.subscriptions
            .lock()
            .unwrap()
            .get(subscription_id)
            .cloned()
            .ok_or_else(|| {
                StripeServiceError::NotFound(format!("subscription {} not found", subscription_id))
            })
    }
}
