use std::sync::Arc;

use crate::config::Config;
use crate::services::stripe::StripeService;
use crate::webhooks::processor::WebhookProcessor;

#[derive(Clone)]
pub struct AppState {
    pub stripe: Arc<dyn StripeService>,
    pub processor: Arc<WebhookProcessor>,
    pub config: Arc<Config>,
}
