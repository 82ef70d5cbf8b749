use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

/// Invalidates read-side caches that mirror a user's billing status
/// (profile pages, dashboard entitlement flags). Strictly best-effort and
/// called only after the coordinator's transaction has committed: a
/// failure here must never fail the request or trigger a redelivery.
#[async_trait]
pub trait CacheInvalidator: Send + Sync {
    async fn invalidate(&self, user_id: Uuid);
}

/// Calls the internal invalidation endpoint of the read-path service.
pub struct HttpCacheInvalidator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpCacheInvalidator {
    pub fn new(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CacheInvalidator for HttpCacheInvalidator {
    async fn invalidate(&self, user_id: Uuid) {
        let result = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({ "user_id": user_id }))
            .send()
            .await
            .and_then(|resp| resp.error_for_status());
        match result {
            Ok(_) => debug!(%user_id, "invalidated billing cache"),
            Err(err) => warn!(?err, %user_id, "cache invalidation failed (ignored)"),
        }
    }
}

/// Used when no invalidation endpoint is configured.
pub struct NoopCacheInvalidator;

#[async_trait]
impl CacheInvalidator for NoopCacheInvalidator {
    async fn invalidate(&self, _user_id: Uuid) {}
}

/// Test double recording which users were invalidated.
#[derive(Clone, Default)]
pub struct MockCacheInvalidator {
    pub invalidated: Arc<Mutex<Vec<Uuid>>>,
}

impl MockCacheInvalidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidations(&self) -> Vec<Uuid> {
        self.invalidated.lock().unwrap().clone()
    }
}

#[async_trait]
impl CacheInvalidator for MockCacheInvalidator {
    async fn invalidate(&self, user_id: Uuid) {
        self.invalidated.lock().unwrap().push(user_id);
    }
}
