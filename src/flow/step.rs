//! One addressable stage in the booking sequence.

use serde::{Deserialize, Serialize};

/// Estimate applied to any step without an explicit duration.
pub const DEFAULT_STEP_SECONDS: u32 = 60;

fn default_step_seconds() -> u32 {
    DEFAULT_STEP_SECONDS
}

fn default_clickable() -> bool {
    true
}

/// Lifecycle status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Current,
    Completed,
    Error,
    Skipped,
}

impl Default for StepStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Current => "current",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// A step as declared by a flow configuration or conditional rule (no status).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_step_seconds")]
    pub estimated_time_seconds: u32,
    #[serde(default = "default_clickable")]
    pub clickable: bool,
    /// Form fields that must be filled before this step can be completed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

impl StepDefinition {
    pub fn new(id: &str, label: &str) -> Self {
        Self {
            id: id.to_string(),
            label: label.to_string(),
            description: None,
            optional: false,
            estimated_time_seconds: DEFAULT_STEP_SECONDS,
            clickable: true,
            required_fields: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = Some(description.to_string());
        self
    }

    pub fn with_estimate(mut self, seconds: u32) -> Self {
        self.estimated_time_seconds = seconds;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_required_fields(mut self, fields: &[&str]) -> Self {
        self.required_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }
}

/// A step inside a running flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Step {
    pub id: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_step_seconds")]
    pub estimated_time_seconds: u32,
    #[serde(default = "default_clickable")]
    pub clickable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_fields: Vec<String>,
}

impl Step {
    /// Instantiate a definition as a pending step.
    pub fn from_definition(def: &StepDefinition) -> Self {
        Self {
            id: def.id.clone(),
            label: def.label.clone(),
            description: def.description.clone(),
            status: StepStatus::Pending,
            optional: def.optional,
            estimated_time_seconds: def.estimated_time_seconds,
            clickable: def.clickable,
            error_message: None,
            required_fields: def.required_fields.clone(),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

impl From<&StepDefinition> for Step {
    fn from(def: &StepDefinition) -> Self {
        Self::from_definition(def)
    }
}

/// Arbitrary key-value data collected from the user.
pub type FormData = serde_json::Map<String, serde_json::Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn definition_defaults() {
        let def = StepDefinition::new("contact-info", "Contact");
        assert!(!def.optional);
        assert!(def.clickable);
        assert_eq!(def.estimated_time_seconds, DEFAULT_STEP_SECONDS);

        let step = Step::from(&def);
        assert_eq!(step.status, StepStatus::Pending);
        assert!(step.error_message.is_none());
    }

    #[test]
    fn missing_estimate_defaults_on_deserialize() {
        let json = r#"{"id":"a","label":"A","status":"completed"}"#;
        let step: Step = serde_json::from_str(json).unwrap();
        assert_eq!(step.estimated_time_seconds, 60);
        assert!(step.clickable);
        assert!(step.is_completed());
    }

    #[test]
    fn serializes_camel_case() {
        let step = Step::from(&StepDefinition::new("a", "A").with_estimate(90));
        let value = serde_json::to_value(&step).unwrap();
        assert_eq!(value["estimatedTimeSeconds"], 90);
        assert_eq!(value["status"], "pending");
        assert!(value.get("errorMessage").is_none());
    }

    #[test]
    fn display_matches_serde() {
        for status in [
            StepStatus::Pending,
            StepStatus::Current,
            StepStatus::Completed,
            StepStatus::Error,
            StepStatus::Skipped,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(format!("\"{status}\""), json);
        }
    }
}
