//! Flow archetypes — named templates of step sequences.
//!
//! `resolve_flow` is pure and deterministic: the same archetype and service
//! always produce the same configuration.

use std::collections::{BTreeSet, HashSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ConfigError;

use super::progress;
use super::rules::ConditionalRule;
use super::step::StepDefinition;

/// A named step-sequence template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowArchetype {
    Simple,
    Detailed,
    Consultation,
    Quote,
    Custom,
    /// Minimal fallback used when an archetype name is not recognized.
    Generic,
}

impl FlowArchetype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Detailed => "detailed",
            Self::Consultation => "consultation",
            Self::Quote => "quote",
            Self::Custom => "custom",
            Self::Generic => "generic",
        }
    }
}

impl std::fmt::Display for FlowArchetype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowArchetype {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "detailed" => Ok(Self::Detailed),
            "consultation" => Ok(Self::Consultation),
            "quote" => Ok(Self::Quote),
            "custom" => Ok(Self::Custom),
            "generic" => Ok(Self::Generic),
            other => Err(ConfigError::UnknownArchetype(other.to_string())),
        }
    }
}

/// Resolved step list and requirements for one archetype.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowConfiguration {
    pub archetype: FlowArchetype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub steps: Vec<StepDefinition>,
    pub estimated_total_time_seconds: u32,
    pub required_step_ids: BTreeSet<String>,
    pub optional_step_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditional_rules: Vec<ConditionalRule>,
}

impl FlowConfiguration {
    /// Build a configuration, deriving the required/optional partition and
    /// total estimate from the step definitions.
    pub fn from_steps(archetype: FlowArchetype, steps: Vec<StepDefinition>) -> Self {
        let required_step_ids = steps
            .iter()
            .filter(|s| !s.optional)
            .map(|s| s.id.clone())
            .collect();
        let optional_step_ids = steps
            .iter()
            .filter(|s| s.optional)
            .map(|s| s.id.clone())
            .collect();
        let estimated_total_time_seconds =
            progress::total_seconds(steps.iter().map(|s| s.estimated_time_seconds));
        Self {
            archetype,
            service: None,
            steps,
            estimated_total_time_seconds,
            required_step_ids,
            optional_step_ids,
            conditional_rules: Vec::new(),
        }
    }

    pub fn with_rules(mut self, rules: Vec<ConditionalRule>) -> Self {
        self.conditional_rules = rules;
        self
    }

    /// Check the structural invariants: unique ids, every required/optional id
    /// present, and no id in both sets.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.steps.is_empty() {
            return Err(ConfigError::EmptyFlow);
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(ConfigError::DuplicateStepId(step.id.clone()));
            }
        }

        for id in &self.required_step_ids {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::UnknownStepReference {
                    id: id.clone(),
                    set: "required",
                });
            }
        }
        for id in &self.optional_step_ids {
            if !seen.contains(id.as_str()) {
                return Err(ConfigError::UnknownStepReference {
                    id: id.clone(),
                    set: "optional",
                });
            }
            if self.required_step_ids.contains(id) {
                return Err(ConfigError::OverlappingStep(id.clone()));
            }
        }

        Ok(())
    }
}

fn service_selection(service: Option<&str>) -> StepDefinition {
    let step = StepDefinition::new("service-selection", "Select Service").with_estimate(30);
    match service {
        Some(s) => step.with_description(&format!("Selected: {s}")),
        None => step.with_description("Choose the service you need"),
    }
}

fn time_selection() -> StepDefinition {
    StepDefinition::new("time-selection", "Pick a Time")
        .with_description("Choose a date and time that works for you")
        .with_estimate(90)
}

fn contact_info() -> StepDefinition {
    StepDefinition::new("contact-info", "Your Details")
        .with_description("How can we reach you?")
        .with_estimate(120)
        .with_required_fields(&["name", "email"])
}

fn confirmation() -> StepDefinition {
    StepDefinition::new("confirmation", "Confirm").with_estimate(30)
}

/// Resolve the configuration for an archetype and optional service.
pub fn resolve_flow(archetype: FlowArchetype, service: Option<&str>) -> FlowConfiguration {
    let steps = match archetype {
        FlowArchetype::Simple => vec![
            service_selection(service),
            time_selection(),
            contact_info(),
            confirmation(),
        ],
        FlowArchetype::Detailed => vec![
            service_selection(service),
            StepDefinition::new("requirements", "Requirements")
                .with_description("Tell us about your needs")
                .with_estimate(180),
            time_selection(),
            contact_info(),
            StepDefinition::new("payment", "Payment")
                .with_description("Pay a deposit now or later")
                .with_estimate(120)
                .optional(),
            confirmation(),
        ],
        FlowArchetype::Consultation => vec![
            service_selection(service),
            StepDefinition::new("consultation-details", "Consultation Details")
                .with_description("What would you like to discuss?")
                .with_estimate(150),
            time_selection(),
            contact_info(),
            confirmation(),
        ],
        FlowArchetype::Quote => vec![
            service_selection(service),
            StepDefinition::new("project-details", "Project Details").with_estimate(240),
            StepDefinition::new("budget-timeline", "Budget & Timeline").with_estimate(90),
            contact_info(),
            confirmation(),
        ],
        FlowArchetype::Custom => vec![
            service_selection(service),
            StepDefinition::new("custom-requirements", "Your Requirements").with_estimate(240),
            time_selection(),
            contact_info(),
            StepDefinition::new("review", "Review").with_estimate(60),
            confirmation(),
        ],
        FlowArchetype::Generic => vec![service_selection(service), contact_info(), confirmation()],
    };

    let mut config = FlowConfiguration::from_steps(archetype, steps);
    config.service = service.map(String::from);
    config
}

/// Resolve by archetype name. Unrecognized names fall back to the generic
/// three-step flow instead of failing.
pub fn resolve_flow_by_name(name: &str, service: Option<&str>) -> FlowConfiguration {
    match name.parse::<FlowArchetype>() {
        Ok(archetype) => resolve_flow(archetype, service),
        Err(_) => {
            warn!(archetype = %name, "Unknown flow archetype, falling back to generic flow");
            resolve_flow(FlowArchetype::Generic, service)
        }
    }
}
