use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::db::billing_store::BillingTx;
use crate::webhooks::envelope::EventEnvelope;
use crate::webhooks::outcome::{HandlerOutcome, SkipReason, WebhookError};

/// Everything a handler gets: the verified envelope and the coordinator's
/// open transaction. Handlers cannot commit; the coordinator owns that.
pub struct HandlerContext<'a> {
    pub envelope: &'a EventEnvelope,
    pub tx: &'a mut dyn BillingTx,
}

#[async_trait]
pub trait WebhookHandler: Send + Sync {
    /// Event type tags this handler accepts.
    fn event_types(&self) -> &'static [&'static str];

    async fn handle(&self, ctx: HandlerContext<'_>) -> Result<HandlerOutcome, WebhookError>;
}

/// Explicit, constructed registry: handlers are registered at startup and
/// the set is immutable afterwards, so tests can build one from fakes.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: Vec<Arc<dyn WebhookHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn WebhookHandler>) {
        self.handlers.push(handler);
    }

    pub fn get(&self, event_type: &str) -> Option<&Arc<dyn WebhookHandler>> {
        self.handlers
            .iter()
            .find(|h| h.event_types().contains(&event_type))
    }

    /// Routes the event to its handler. The provider sends many event types
    /// this system does not care about; all of them must still be
    /// acknowledged, so "no handler" is a skip, never an error.
    pub async fn dispatch(
        &self,
        ctx: HandlerContext<'_>,
    ) -> Result<HandlerOutcome, WebhookError> {
        match self.get(&ctx.envelope.event_type) {
            Some(handler) => handler.handle(ctx).await,
            None => {
                debug!(
                    event_type = %ctx.envelope.event_type,
                    event_id = %ctx.envelope.id,
                    "no handler registered for event type"
                );
                Ok(HandlerOutcome::Skipped(SkipReason::UnhandledEventType))
            }
        }
    }
}
