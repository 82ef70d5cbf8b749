use std::sync::Arc;

use time::OffsetDateTime;
use tracing::{info, warn};

use crate::db::billing_store::{BillingStore, BillingTx, InsertOutcome};
use crate::models::webhook_event::NewProcessingRecord;
use crate::services::cache::CacheInvalidator;
use crate::services::observability::ObservabilitySink;
use crate::webhooks::dispatcher::{HandlerContext, HandlerRegistry};
use crate::webhooks::envelope::EventEnvelope;
use crate::webhooks::outcome::{HandlerOutcome, ProcessOutcome, WebhookError};

/// The idempotency/transaction coordinator. One transaction spans the
/// dedup insert, the handler's effects, and the processed stamp; a side
/// effect is durably recorded as applied if and only if the
/// ProcessingRecord for that event id is committed.
pub struct WebhookProcessor {
    store: Arc<dyn BillingStore>,
    registry: HandlerRegistry,
    observability: Arc<dyn ObservabilitySink>,
    cache: Arc<dyn CacheInvalidator>,
}

impl WebhookProcessor {
    pub fn new(
        store: Arc<dyn BillingStore>,
        registry: HandlerRegistry,
        observability: Arc<dyn ObservabilitySink>,
        cache: Arc<dyn CacheInvalidator>,
    ) -> Self {
        Self {
            store,
            registry,
            observability,
            cache,
        }
    }

    pub async fn process(
        &self,
        envelope: &EventEnvelope,
    ) -> Result<ProcessOutcome, WebhookError> {
        let mut tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(err) => return Err(self.report_failure(envelope, err.into())),
        };

        let record = NewProcessingRecord::new(
            &envelope.id,
            envelope.object_id().map(String::from),
            OffsetDateTime::now_utc(),
        );
        match tx.insert_processing_record(&record).await {
            Ok(InsertOutcome::Inserted) => {}
            Ok(InsertOutcome::Duplicate) => {
                // Nothing staged; the earlier delivery owns the record.
                rollback_quietly(tx, envelope).await;
                info!(event_id = %envelope.id, "duplicate delivery acknowledged");
                return Ok(ProcessOutcome::Duplicate);
            }
            Err(err) => {
                rollback_quietly(tx, envelope).await;
                return Err(self.report_failure(envelope, err.into()));
            }
        }

        let dispatched = self
            .registry
            .dispatch(HandlerContext {
                envelope,
                tx: &mut *tx,
            })
            .await;
        let outcome = match dispatched {
            Ok(outcome) => outcome,
            Err(err) => {
                rollback_quietly(tx, envelope).await;
                return Err(self.report_failure(envelope, err));
            }
        };

        if let HandlerOutcome::Processed { .. } = outcome {
            if let Err(err) = tx
                .mark_processed(&envelope.id, OffsetDateTime::now_utc())
                .await
            {
                rollback_quietly(tx, envelope).await;
                return Err(self.report_failure(envelope, err.into()));
            }
        }

        if let Err(err) = tx.commit().await {
            return Err(self.report_failure(envelope, err.into()));
        }

        match outcome {
            HandlerOutcome::Processed { user_id } => {
                info!(event_id = %envelope.id, %user_id, "webhook event processed");
                // Best-effort, deliberately outside the transaction.
                self.cache.invalidate(user_id).await;
                Ok(ProcessOutcome::Processed { user_id })
            }
            HandlerOutcome::Skipped(reason) => {
                info!(
                    event_id = %envelope.id,
                    reason = reason.as_str(),
                    "webhook event acknowledged without effect"
                );
                Ok(ProcessOutcome::Skipped(reason))
            }
        }
    }

    fn report_failure(&self, envelope: &EventEnvelope, err: WebhookError) -> WebhookError {
        self.observability.report_error(
            "webhook processing failed",
            &err,
            envelope.report_context(),
        );
        err
    }
}

async fn rollback_quietly(tx: Box<dyn BillingTx>, envelope: &EventEnvelope) {
    if let Err(err) = tx.rollback().await {
        warn!(?err, event_id = %envelope.id, "transaction rollback failed");
    }
}
