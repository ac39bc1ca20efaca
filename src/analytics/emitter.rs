//! Analytics emitter — enriches events with session context and hands them
//! to the registered dispatcher.
//!
//! Exactly one dispatcher is registered at a time. Missing dispatchers,
//! dispatcher errors, and dispatcher panics are all swallowed so analytics
//! can never interrupt the booking flow.

use std::sync::{Arc, RwLock};

use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::DispatchError;

use super::dispatcher::{AnalyticsDispatcher, guarded_dispatch};
use super::events::DOMAIN;

/// Reusable base fields merged into every event sent through a
/// `ContextEmitter`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyticsContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// Build a context from its parts.
pub fn create_context(
    service: Option<&str>,
    variant: Option<&str>,
    source: Option<&str>,
    viewport: Option<&str>,
    referrer: Option<&str>,
) -> AnalyticsContext {
    AnalyticsContext {
        service: service.map(String::from),
        variant: variant.map(String::from),
        source: source.map(String::from),
        viewport: viewport.map(String::from),
        referrer: referrer.map(String::from),
    }
}

impl AnalyticsContext {
    fn fields(&self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        }
    }
}

/// Session-scoped event emitter.
pub struct AnalyticsEmitter {
    dispatcher: RwLock<Option<Arc<dyn AnalyticsDispatcher>>>,
    session_id: RwLock<String>,
    clock: Arc<dyn Clock>,
}

impl AnalyticsEmitter {
    pub fn new(clock: Arc<dyn Clock>, session_id: &str) -> Self {
        Self {
            dispatcher: RwLock::new(None),
            session_id: RwLock::new(session_id.to_string()),
            clock,
        }
    }

    /// Register the dispatcher, replacing any previous one.
    pub fn set_dispatcher(&self, dispatcher: Arc<dyn AnalyticsDispatcher>) {
        *self.dispatcher.write().unwrap_or_else(|e| e.into_inner()) = Some(dispatcher);
    }

    /// Unregister the dispatcher. Subsequent events are dropped.
    pub fn clear_dispatcher(&self) {
        *self.dispatcher.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn has_dispatcher(&self) -> bool {
        self.dispatcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    pub fn set_session_id(&self, session_id: &str) {
        *self.session_id.write().unwrap_or_else(|e| e.into_inner()) = session_id.to_string();
    }

    pub fn session_id(&self) -> String {
        self.session_id
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Bind a base context for subsequent events.
    pub fn with_context(&self, context: AnalyticsContext) -> ContextEmitter<'_> {
        ContextEmitter {
            emitter: self,
            context,
        }
    }

    /// Enrich and dispatch. Returns whether the dispatcher accepted the event.
    pub fn emit(&self, event: &str, payload: Value) -> bool {
        self.emit_merged(event, Map::new(), payload)
    }

    /// Build the payload that would be dispatched for `event`.
    pub fn enrich(&self, base: Map<String, Value>, payload: Value) -> Value {
        let mut merged = base;
        match payload {
            Value::Object(fields) => merged.extend(fields),
            Value::Null => {}
            other => {
                merged.insert("value".to_string(), other);
            }
        }
        merged.insert(
            "timestamp".to_string(),
            Value::String(self.clock.now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        merged.insert("sessionId".to_string(), Value::String(self.session_id()));
        merged.insert("domain".to_string(), Value::String(DOMAIN.to_string()));
        Value::Object(merged)
    }

    fn emit_merged(&self, event: &str, base: Map<String, Value>, payload: Value) -> bool {
        let dispatcher = self
            .dispatcher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let result = match dispatcher {
            Some(d) => {
                let enriched = self.enrich(base, payload);
                guarded_dispatch(d.as_ref(), event, &enriched)
            }
            None => Err(DispatchError::NoDispatcher),
        };

        match result {
            Ok(()) => true,
            Err(DispatchError::NoDispatcher) => {
                debug!(event = %event, "No analytics dispatcher registered, dropping event");
                false
            }
            Err(e) => {
                warn!(event = %event, "Analytics dispatch failed: {}", e);
                false
            }
        }
    }
}

/// An emitter with a bound base context.
pub struct ContextEmitter<'a> {
    emitter: &'a AnalyticsEmitter,
    context: AnalyticsContext,
}

impl ContextEmitter<'_> {
    pub fn context(&self) -> &AnalyticsContext {
        &self.context
    }

    pub fn emit(&self, event: &str, payload: Value) -> bool {
        self.emitter
            .emit_merged(event, self.context.fields(), payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::{TimeZone, Utc};
    use serde_json::json;

    use crate::analytics::dispatcher::FnDispatcher;
    use crate::clock::ManualClock;

    type Recorded = Arc<Mutex<Vec<(String, Value)>>>;

    fn emitter_with_recorder() -> (AnalyticsEmitter, Recorded) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let emitter = AnalyticsEmitter::new(clock, "booking_abc");
        let recorded: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = recorded.clone();
        emitter.set_dispatcher(Arc::new(FnDispatcher(move |event: &str, payload: &Value| {
            sink.lock().unwrap().push((event.to_string(), payload.clone()));
        })));
        (emitter, recorded)
    }

    #[test]
    fn enriches_with_session_and_domain() {
        let (emitter, recorded) = emitter_with_recorder();
        assert!(emitter.emit("booking_step_progress", json!({"step": 2, "stepName": "contact-info"})));

        let events = recorded.lock().unwrap();
        let (name, payload) = &events[0];
        assert_eq!(name, "booking_step_progress");
        assert_eq!(payload["step"], 2);
        assert_eq!(payload["sessionId"], "booking_abc");
        assert_eq!(payload["domain"], "booking");
        assert_eq!(payload["timestamp"], "2025-06-01T12:00:00.000Z");
    }

    #[test]
    fn enrichment_fields_cannot_be_overridden() {
        let (emitter, recorded) = emitter_with_recorder();
        emitter.emit("x", json!({"domain": "other", "sessionId": "spoofed"}));
        let events = recorded.lock().unwrap();
        assert_eq!(events[0].1["domain"], "booking");
        assert_eq!(events[0].1["sessionId"], "booking_abc");
    }

    #[test]
    fn no_dispatcher_drops_silently() {
        let emitter = AnalyticsEmitter::new(Arc::new(ManualClock::default()), "s");
        assert!(!emitter.has_dispatcher());
        assert!(!emitter.emit("booking_success", json!({})));
    }

    #[test]
    fn panicking_dispatcher_is_isolated() {
        let emitter = AnalyticsEmitter::new(Arc::new(ManualClock::default()), "s");
        emitter.set_dispatcher(Arc::new(FnDispatcher(|_: &str, _: &Value| {
            panic!("analytics backend down");
        })));
        assert!(!emitter.emit("booking_success", json!({})));
        // Still usable afterwards
        assert!(!emitter.emit("booking_error", json!({})));
    }

    #[test]
    fn only_latest_dispatcher_receives_events() {
        let (emitter, first) = emitter_with_recorder();
        let second: Recorded = Arc::new(Mutex::new(Vec::new()));
        let sink = second.clone();
        emitter.set_dispatcher(Arc::new(FnDispatcher(move |event: &str, payload: &Value| {
            sink.lock().unwrap().push((event.to_string(), payload.clone()));
        })));
        emitter.emit("e", json!({}));
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(second.lock().unwrap().len(), 1);

        emitter.clear_dispatcher();
        assert!(!emitter.emit("e", json!({})));
        assert_eq!(second.lock().unwrap().len(), 1);
    }

    #[test]
    fn context_fields_are_merged_under_payload() {
        let (emitter, recorded) = emitter_with_recorder();
        let ctx = create_context(Some("seo-audit"), Some("b"), Some("hero-cta"), None, None);
        let scoped = emitter.with_context(ctx);
        scoped.emit("booking_flow_started", json!({"variant": "override"}));
        scoped.emit("booking_step_progress", json!({}));

        let events = recorded.lock().unwrap();
        assert_eq!(events[0].1["service"], "seo-audit");
        assert_eq!(events[0].1["variant"], "override");
        assert_eq!(events[0].1["source"], "hero-cta");
        assert!(events[0].1.get("viewport").is_none());
        assert_eq!(events[1].1["variant"], "b");
    }

    #[test]
    fn session_id_updates_apply() {
        let (emitter, recorded) = emitter_with_recorder();
        emitter.set_session_id("booking_new");
        emitter.emit("booking_restarted", Value::Null);
        assert_eq!(recorded.lock().unwrap()[0].1["sessionId"], "booking_new");
    }
}
