//! Conditional step rules — data-driven insertion and removal of steps.
//!
//! Each rule targets one step id. When its condition holds against the
//! collected form data the rule's step definition is put into the list
//! (replacing a step with the same id, or inserted if absent). When the
//! condition fails, any step with that id is removed. Rules run in order,
//! so a later rule overrides an earlier one for the same id.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::step::{FormData, Step, StepDefinition};

/// Comparison applied between a form field and a rule value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    Exists,
}

/// A predicate over one field of the form data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Value) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
        }
    }

    /// Evaluate against a data bag. A missing field is treated as undefined.
    pub fn matches(&self, data: &FormData) -> bool {
        let actual = data.get(&self.field);
        match self.operator {
            ConditionOperator::Equals => actual.is_some_and(|v| strict_equals(v, &self.value)),
            ConditionOperator::NotEquals => !actual.is_some_and(|v| strict_equals(v, &self.value)),
            ConditionOperator::Contains => match actual {
                Some(Value::Array(items)) => items.iter().any(|v| strict_equals(v, &self.value)),
                Some(v) => coerce_string(v).contains(&coerce_string(&self.value)),
                None => false,
            },
            ConditionOperator::GreaterThan => compare(actual, &self.value, |a, b| a > b),
            ConditionOperator::LessThan => compare(actual, &self.value, |a, b| a < b),
            ConditionOperator::Exists => actual.is_some_and(|v| !v.is_null()),
        }
    }
}

/// Insert/replace/remove instruction keyed on a target step id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConditionalRule {
    pub target_step_id: String,
    pub condition: Condition,
    pub step_definition: StepDefinition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insert_after_id: Option<String>,
}

impl ConditionalRule {
    pub fn new(condition: Condition, step_definition: StepDefinition) -> Self {
        Self {
            target_step_id: step_definition.id.clone(),
            condition,
            step_definition,
            insert_after_id: None,
        }
    }

    pub fn insert_after(mut self, step_id: &str) -> Self {
        self.insert_after_id = Some(step_id.to_string());
        self
    }
}

/// Applies an ordered rule list to a base step sequence.
#[derive(Debug, Clone, Default)]
pub struct ConditionalStepEvaluator {
    rules: Vec<ConditionalRule>,
}

impl ConditionalStepEvaluator {
    pub fn new(rules: Vec<ConditionalRule>) -> Self {
        Self { rules }
    }

    /// An evaluator with no rules (returns the base list unchanged).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: ConditionalRule) {
        self.rules.push(rule);
    }

    pub fn rules(&self) -> &[ConditionalRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Produce a new step list. Neither `base` nor the rules are modified.
    pub fn apply(&self, base: &[Step], data: &FormData) -> Vec<Step> {
        apply_rules(base, &self.rules, data)
    }
}

/// Apply `rules` in order to a copy of `base`.
pub fn apply_rules(base: &[Step], rules: &[ConditionalRule], data: &FormData) -> Vec<Step> {
    let mut steps = base.to_vec();

    for rule in rules {
        let existing = steps.iter().position(|s| s.id == rule.target_step_id);

        if rule.condition.matches(data) {
            let mut step = Step::from_definition(&rule.step_definition);
            step.id = rule.target_step_id.clone();

            match existing {
                Some(idx) => steps[idx] = step,
                None => {
                    let anchor = rule
                        .insert_after_id
                        .as_deref()
                        .and_then(|after| steps.iter().position(|s| s.id == after));
                    match anchor {
                        Some(idx) => steps.insert(idx + 1, step),
                        None => steps.push(step),
                    }
                }
            }
            debug!(step = %rule.target_step_id, field = %rule.condition.field, "Conditional step included");
        } else if let Some(idx) = existing {
            steps.remove(idx);
            debug!(step = %rule.target_step_id, field = %rule.condition.field, "Conditional step removed");
        }
    }

    steps
}

fn strict_equals(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn coerce_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::Array(items) => items.iter().map(coerce_string).collect::<Vec<_>>().join(","),
        Value::Object(_) => "[object Object]".to_string(),
    }
}

fn coerce_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                Some(0.0)
            } else {
                trimmed.parse().ok()
            }
        }
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Null => Some(0.0),
        Value::Array(_) | Value::Object(_) => None,
    }
}

fn compare(actual: Option<&Value>, expected: &Value, op: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(coerce_number), coerce_number(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}
