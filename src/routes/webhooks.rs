use axum::Json;
use axum::{extract::State, http::HeaderMap, response::IntoResponse};
use axum::{http::StatusCode, response::Response};
use tracing::{error, warn};

use crate::state::AppState;
use crate::webhooks::envelope::EventEnvelope;

fn received() -> Response {
    Json(serde_json::json!({ "received": true })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// POST /api/billing/webhook
///
/// The 400/500 split is load-bearing: the provider treats 5xx as "please
/// redeliver" and 4xx as "will not succeed, do not retry".
pub async fn webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let sig = match headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
    {
        Some(s) => s,
        None => {
            return error_response(StatusCode::BAD_REQUEST, "Missing Stripe-Signature header")
        }
    };

    // Nothing is examined, logged, or written before this check passes.
    let event = match app_state.stripe.verify_webhook(&body, sig) {
        Ok(event) => event,
        Err(err) => {
            warn!(?err, "stripe webhook verification failed");
            return error_response(StatusCode::BAD_REQUEST, "invalid webhook");
        }
    };

    let envelope = match EventEnvelope::from_stripe_event(&event) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(?err, event_id = %event.id, "verified webhook payload is malformed");
            return error_response(StatusCode::BAD_REQUEST, "invalid webhook");
        }
    };

    match app_state.processor.process(&envelope).await {
        Ok(_) => received(),
        Err(err) => {
            error!(?err, event_id = %envelope.id, "webhook processing failed");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Webhook processing failed",
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, StripeSettings};
    use crate::db::billing_store::BillingStore;
    use crate::db::mock_billing_store::MockBillingStore;
    use crate::services::cache::MockCacheInvalidator;
    use crate::services::observability::MockObservability;
    use crate::services::stripe::MockStripeService;
    use crate::webhooks::dispatcher::HandlerRegistry;
    use crate::webhooks::handlers::{PaymentHandler, SubscriptionHandler};
    use crate::webhooks::processor::WebhookProcessor;
    use axum::extract::State as AxumState;
    use axum::http::{HeaderMap, HeaderValue};
    use std::sync::Arc;
    use uuid::Uuid;

    fn test_config() -> Arc<Config> {
        Arc::new(Config {
            database_url: String::new(),
            frontend_origin: "https://app.example.com".into(),
            stripe: StripeSettings {
                secret_key: "sk_test_stub".into(),
                webhook_secret: "whsec_stub".into(),
                pro_price_ids: vec!["price_pro".into()],
            },
            sentry_dsn: None,
            cache_invalidation_url: None,
        })
    }

    struct TestApp {
        state: AppState,
        store: MockBillingStore,
        cache: MockCacheInvalidator,
        stripe: Arc<MockStripeService>,
    }

    fn test_app() -> TestApp {
        test_app_with_stripe(MockStripeService::new())
    }

    fn test_app_with_stripe(stripe: MockStripeService) -> TestApp {
        let stripe = Arc::new(stripe);
        let store = MockBillingStore::new();
        let observability = Arc::new(MockObservability::new());
        let cache = MockCacheInvalidator::new();

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(SubscriptionHandler::new(vec!["price_pro".into()])));
        registry.register(Arc::new(PaymentHandler::new(
            stripe.clone(),
            observability.clone(),
        )));

        let processor = Arc::new(WebhookProcessor::new(
            Arc::new(store.clone()),
            registry,
            observability,
            Arc::new(cache.clone()),
        ));

        TestApp {
            state: AppState {
                stripe: stripe.clone(),
                processor,
                config: test_config(),
            },
            store,
            cache,
            stripe,
        }
    }

    fn signed_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("Stripe-Signature", HeaderValue::from_static("t=1,v1=stub"));
        headers
    }

    fn subscription_body(event_id: &str, user_id: Uuid, status: &str) -> axum::body::Bytes {
        let body = serde_json::json!({
            "id": event_id,
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_1",
                "status": status,
                "customer": "cus_1",
                "metadata": { "user_id": user_id.to_string() },
                "items": { "data": [ { "price": { "id": "price_pro" } } ] }
            } }
        });
        axum::body::Bytes::from(serde_json::to_vec(&body).unwrap())
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn missing_signature_header_is_rejected_before_any_processing() {
        let app = test_app();
        let resp = webhook(
            AxumState(app.state),
            HeaderMap::new(),
            subscription_body("evt_1", Uuid::new_v4(), "active"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.record_count(), 0);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "Missing Stripe-Signature header");
    }

    #[tokio::test]
    async fn invalid_signature_is_rejected_before_any_processing() {
        let app = test_app_with_stripe(MockStripeService::new().with_rejected_signatures());
        let resp = webhook(
            AxumState(app.state),
            signed_headers(),
            subscription_body("evt_1", Uuid::new_v4(), "active"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.record_count(), 0);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "invalid webhook");
    }

    #[tokio::test]
    async fn active_subscription_event_entitles_user_and_acks() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.store.seed_user(user_id, None);

        let resp = webhook(
            AxumState(app.state.clone()),
            signed_headers(),
            subscription_body("evt_1", user_id, "active"),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["received"], true);

        let user = app.store.user(user_id).unwrap();
        assert!(user.is_entitled);
        assert_eq!(user.billing_version, 1);
        assert_eq!(app.cache.invalidations(), vec![user_id]);
    }

    #[tokio::test]
    async fn redelivery_of_same_event_makes_no_second_write() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.store.seed_user(user_id, None);

        for _ in 0..2 {
            let resp = webhook(
                AxumState(app.state.clone()),
                signed_headers(),
                subscription_body("evt_1", user_id, "active"),
            )
            .await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(body_json(resp).await["received"], true);
        }

        let user = app.store.user(user_id).unwrap();
        assert!(user.is_entitled);
        assert_eq!(user.billing_version, 1);
        assert_eq!(app.store.record_count(), 1);
        assert_eq!(app.cache.invalidations().len(), 1);
    }

    #[tokio::test]
    async fn unknown_event_type_is_acknowledged() {
        let app = test_app();
        let body = serde_json::json!({
            "id": "evt_other",
            "type": "customer.created",
            "created": 1_700_000_000,
            "data": { "object": { "id": "cus_1" } }
        });

        let resp = webhook(
            AxumState(app.state),
            signed_headers(),
            axum::body::Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::OK);
        assert!(app.store.record("evt_other").is_some());
    }

    #[tokio::test]
    async fn handler_failure_returns_500_with_generic_body() {
        let app = test_app();
        let user_id = Uuid::new_v4();
        app.store.seed_user(user_id, Some("cus_1"));
        app.stripe.seed_subscription(crate::services::stripe::SubscriptionInfo {
            id: "sub_1".into(),
            status: "past_due".into(),
            customer_id: Some("cus_1".into()),
            price_id: None,
            metadata: Default::default(),
        });
        app.store.fail_next_apply();

        let body = serde_json::json!({
            "id": "evt_fail",
            "type": "invoice.payment_failed",
            "created": 1_700_000_000,
            "data": { "object": { "id": "in_1", "subscription": "sub_1" } }
        });
        let resp = webhook(
            AxumState(app.state.clone()),
            signed_headers(),
            axum::body::Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(resp).await;
        assert_eq!(json["error"], "Webhook processing failed");
        // Rolled back: a redelivery will be treated as new.
        assert!(app.store.record("evt_fail").is_none());
    }

    #[tokio::test]
    async fn malformed_envelope_after_verification_is_rejected() {
        let app = test_app();
        let body = serde_json::json!({
            "id": "evt_bad",
            "type": "customer.subscription.updated"
            // no created / data.object
        });
        let resp = webhook(
            AxumState(app.state),
            signed_headers(),
            axum::body::Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(app.store.record_count(), 0);
    }
}
