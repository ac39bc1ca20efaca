//! Where enriched analytics events are delivered.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};

use crate::error::DispatchError;

/// Receives fully enriched analytics events.
pub trait AnalyticsDispatcher: Send + Sync {
    fn dispatch(&self, event: &str, payload: &Value) -> Result<(), DispatchError>;
}

/// Adapts a plain closure into a dispatcher.
pub struct FnDispatcher<F>(pub F);

impl<F> AnalyticsDispatcher for FnDispatcher<F>
where
    F: Fn(&str, &Value) + Send + Sync,
{
    fn dispatch(&self, event: &str, payload: &Value) -> Result<(), DispatchError> {
        (self.0)(event, payload);
        Ok(())
    }
}

/// Writes every event to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDispatcher;

impl AnalyticsDispatcher for TracingDispatcher {
    fn dispatch(&self, event: &str, payload: &Value) -> Result<(), DispatchError> {
        info!(event = %event, payload = %payload, "Analytics event");
        Ok(())
    }
}

/// Forwards each event to several named backends. Every backend is tried
/// even when an earlier one fails.
#[derive(Default, Clone)]
pub struct FanOutDispatcher {
    backends: Vec<(String, Arc<dyn AnalyticsDispatcher>)>,
}

impl FanOutDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, name: &str, backend: Arc<dyn AnalyticsDispatcher>) -> Self {
        self.backends.push((name.to_string(), backend));
        self
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl AnalyticsDispatcher for FanOutDispatcher {
    fn dispatch(&self, event: &str, payload: &Value) -> Result<(), DispatchError> {
        let mut failed = Vec::new();
        for (name, backend) in &self.backends {
            if let Err(e) = guarded_dispatch(backend.as_ref(), event, payload) {
                warn!(backend = %name, event = %event, "Analytics backend failed: {}", e);
                failed.push(name.as_str());
            }
        }
        if failed.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::Backend {
                backend: failed.join(","),
                reason: format!("{} of {} backends failed", failed.len(), self.backends.len()),
            })
        }
    }
}

/// Call a dispatcher, converting a panic into `DispatchError::Panicked`.
pub(crate) fn guarded_dispatch(
    dispatcher: &dyn AnalyticsDispatcher,
    event: &str,
    payload: &Value,
) -> Result<(), DispatchError> {
    catch_unwind(AssertUnwindSafe(|| dispatcher.dispatch(event, payload)))
        .unwrap_or(Err(DispatchError::Panicked))
}
