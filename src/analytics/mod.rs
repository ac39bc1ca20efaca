//! Analytics — pluggable, failure-isolated event dispatch.
//!
//! Every event is `(name, payload)` where the payload always carries
//! `timestamp` (ISO-8601), `sessionId`, and `domain: "booking"`.

pub mod dispatcher;
pub mod emitter;
pub mod events;

pub use dispatcher::{AnalyticsDispatcher, FanOutDispatcher, FnDispatcher, TracingDispatcher};
pub use emitter::{AnalyticsContext, AnalyticsEmitter, ContextEmitter, create_context};
