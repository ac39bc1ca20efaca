//! Flow model — steps, archetypes, rules, navigation, and session phase.
//!
//! Everything in this module is pure: no timers, storage, or I/O. The
//! controller composes these pieces into a running session.

pub mod archetype;
pub mod navigation;
pub mod phase;
pub mod progress;
pub mod rules;
pub mod state;
pub mod step;

pub use archetype::{FlowArchetype, FlowConfiguration, resolve_flow, resolve_flow_by_name};
pub use navigation::{NavigationDecision, NavigationGuard};
pub use phase::BookingPhase;
pub use progress::{completion_percentage, time_remaining};
pub use rules::{
    Condition, ConditionOperator, ConditionalRule, ConditionalStepEvaluator, apply_rules,
};
pub use state::{Direction, FlowState};
pub use step::{FormData, Step, StepDefinition, StepStatus};
