use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::{error, warn};

/// Structured context attached to every report. `detail` carries
/// channel-specific fields (e.g. invoice amounts on payment-failure audits).
#[derive(Debug, Clone, Default)]
pub struct ReportContext {
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub object_id: Option<String>,
    pub detail: Option<serde_json::Value>,
}

impl ReportContext {
    pub fn event(event_id: impl Into<String>, event_type: impl Into<String>) -> Self {
        Self {
            event_id: Some(event_id.into()),
            event_type: Some(event_type.into()),
            ..Default::default()
        }
    }

    pub fn with_object_id(mut self, object_id: impl Into<String>) -> Self {
        self.object_id = Some(object_id.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// Two distinct channels: `report_error` is for genuine faults (paged on),
/// `report_audit` is for operationally significant but expected business
/// events. Dashboards must be able to tell them apart.
pub trait ObservabilitySink: Send + Sync {
    fn report_error(&self, message: &str, error: &dyn fmt::Display, ctx: ReportContext);
    fn report_audit(&self, message: &str, ctx: ReportContext);
}

/// Production sink: mirrors errors to Sentry and tracing, audits to tracing
/// (with a Sentry breadcrumb so incidents carry recent billing context).
#[derive(Default)]
pub struct SentryObservability;

impl SentryObservability {
    pub fn new() -> Self {
        Self
    }
}

impl ObservabilitySink for SentryObservability {
    fn report_error(&self, message: &str, err: &dyn fmt::Display, ctx: ReportContext) {
        error!(
            event_id = ctx.event_id.as_deref().unwrap_or("-"),
            event_type = ctx.event_type.as_deref().unwrap_or("-"),
            object_id = ctx.object_id.as_deref().unwrap_or("-"),
            %err,
            "{}",
            message
        );
        sentry::with_scope(
            |scope| {
                if let Some(event_type) = &ctx.event_type {
                    scope.set_tag("stripe.event_type", event_type);
                }
                if let Some(event_id) = &ctx.event_id {
                    scope.set_extra("stripe.event_id", event_id.clone().into());
                }
                if let Some(object_id) = &ctx.object_id {
                    scope.set_extra("stripe.object_id", object_id.clone().into());
                }
            },
            || sentry::capture_message(&format!("{}: {}", message, err), sentry::Level::Error),
        );
    }

    fn report_audit(&self, message: &str, ctx: ReportContext) {
        warn!(
            audit = true,
            event_id = ctx.event_id.as_deref().unwrap_or("-"),
            event_type = ctx.event_type.as_deref().unwrap_or("-"),
            object_id = ctx.object_id.as_deref().unwrap_or("-"),
            detail = %ctx.detail.clone().unwrap_or(serde_json::Value::Null),
            "{}",
            message
        );
        sentry::add_breadcrumb(sentry::Breadcrumb {
            category: Some("billing.audit".into()),
            message: Some(message.to_string()),
            level: sentry::Level::Warning,
            ..Default::default()
        });
    }
}

/// Test double capturing reports for assertion.
#[derive(Clone, Default)]
pub struct MockObservability {
    pub errors: Arc<Mutex<Vec<(String, String, ReportContext)>>>,
    pub audits: Arc<Mutex<Vec<(String, ReportContext)>>>,
}

impl MockObservability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub fn audit_count(&self) -> usize {
        self.audits.lock().unwrap().len()
    }
}

impl ObservabilitySink for MockObservability {
    fn report_error(&self, message: &str, err: &dyn fmt::Display, ctx: ReportContext) {
        self.errors
            .lock()
            .unwrap()
            .push((message.to_string(), err.to_string(), ctx));
    }

    fn report_audit(&self, message: &str, ctx: ReportContext) {
        self.audits.lock().unwrap().push((message.to_string(), ctx));
    }
}
