//! Booking Flow: orchestration engine for multi-step booking sessions.

pub mod abandonment;
pub mod analytics;
pub mod clock;
pub mod config;
pub mod controller;
pub mod error;
pub mod flow;
pub mod mode;
pub mod store;
pub mod submission;

pub use controller::{FlowController, FlowControllerDeps, FlowEvent, FlowHooks};
pub use error::{Error, Result};
