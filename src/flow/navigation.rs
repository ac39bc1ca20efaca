//! Decides whether a step transition is legal.
//!
//! Retreating is always allowed. Advancing requires every required step in
//! between to be completed; pending optional steps are passed over and
//! reported so the caller can mark them skipped.

use serde::Serialize;

use super::step::{Step, StepStatus};

/// Outcome of a proposed transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationDecision {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped_optional_indices: Vec<usize>,
}

impl NavigationDecision {
    fn allow(skipped_optional_indices: Vec<usize>) -> Self {
        Self {
            allowed: true,
            reason: None,
            skipped_optional_indices,
        }
    }

    fn block(reason: String) -> Self {
        Self {
            allowed: false,
            reason: Some(reason),
            skipped_optional_indices: Vec::new(),
        }
    }
}

/// Stateless validator for step transitions.
#[derive(Debug, Clone, Copy, Default)]
pub struct NavigationGuard;

impl NavigationGuard {
    pub fn validate(&self, from_index: usize, to_index: usize, steps: &[Step]) -> NavigationDecision {
        validate(from_index, to_index, steps)
    }
}

/// Validate a move from `from_index` to `to_index`.
pub fn validate(from_index: usize, to_index: usize, steps: &[Step]) -> NavigationDecision {
    if to_index >= steps.len() {
        return NavigationDecision::block(format!(
            "Step {to_index} is out of bounds (flow has {} steps)",
            steps.len()
        ));
    }

    if to_index <= from_index {
        return NavigationDecision::allow(Vec::new());
    }

    let mut skipped = Vec::new();
    for (idx, step) in steps
        .iter()
        .enumerate()
        .take(to_index)
        .skip(from_index + 1)
    {
        if step.optional {
            if step.status == StepStatus::Pending {
                skipped.push(idx);
            }
            continue;
        }
        if step.status != StepStatus::Completed {
            return NavigationDecision::block(format!("Please complete \"{}\" first", step.label));
        }
    }

    let target = &steps[to_index];
    if !target.clickable {
        return NavigationDecision::block(format!("\"{}\" is not available yet", target.label));
    }
    if target.status == StepStatus::Error {
        return NavigationDecision::block(format!(
            "\"{}\" has an error: {}",
            target.label,
            target.error_message.as_deref().unwrap_or("unavailable")
        ));
    }

    NavigationDecision::allow(skipped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::step::StepDefinition;

    fn make_steps(specs: &[(&str, StepStatus, bool)]) -> Vec<Step> {
        specs
            .iter()
            .map(|(label, status, optional)| {
                let mut def = StepDefinition::new(&label.to_lowercase(), label);
                def.optional = *optional;
                let mut step = Step::from_definition(&def);
                step.status = *status;
                step
            })
            .collect()
    }

    fn four_steps() -> Vec<Step> {
        make_steps(&[
            ("Service", StepStatus::Current, false),
            ("Time", StepStatus::Pending, false),
            ("Contact", StepStatus::Pending, false),
            ("Confirm", StepStatus::Pending, false),
        ])
    }

    #[test]
    fn out_of_bounds_is_rejected() {
        let decision = validate(0, 4, &four_steps());
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("out of bounds"));
    }

    #[test]
    fn backward_and_same_position_always_allowed() {
        let mut steps = four_steps();
        steps[1].status = StepStatus::Error;
        steps[1].clickable = false;
        for from in 0..steps.len() {
            for to in 0..=from {
                assert!(validate(from, to, &steps).allowed, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn incomplete_required_step_blocks_and_names_label() {
        let decision = validate(0, 3, &four_steps());
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("Time"));
    }

    #[test]
    fn first_incomplete_step_is_reported() {
        let mut steps = four_steps();
        steps[1].status = StepStatus::Completed;
        let decision = validate(0, 3, &steps);
        assert!(decision.reason.unwrap().contains("Contact"));
    }

    #[test]
    fn completed_intermediates_allow_jump() {
        let mut steps = four_steps();
        steps[1].status = StepStatus::Completed;
        steps[2].status = StepStatus::Completed;
        let decision = validate(0, 3, &steps);
        assert!(decision.allowed);
        assert!(decision.skipped_optional_indices.is_empty());
    }

    #[test]
    fn next_step_needs_no_intermediates() {
        assert!(validate(0, 1, &four_steps()).allowed);
    }

    #[test]
    fn pending_optional_steps_are_collected() {
        let steps = make_steps(&[
            ("Contact", StepStatus::Current, false),
            ("Payment", StepStatus::Pending, true),
            ("Extras", StepStatus::Skipped, true),
            ("Confirm", StepStatus::Pending, false),
        ]);
        let decision = validate(0, 3, &steps);
        assert!(decision.allowed);
        assert_eq!(decision.skipped_optional_indices, vec![1]);
    }

    #[test]
    fn destination_must_be_clickable() {
        let mut steps = four_steps();
        steps[1].clickable = false;
        let decision = validate(0, 1, &steps);
        assert!(!decision.allowed);
    }

    #[test]
    fn destination_in_error_blocks() {
        let mut steps = four_steps();
        steps[1].status = StepStatus::Error;
        steps[1].error_message = Some("No slots".into());
        let decision = validate(0, 1, &steps);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("No slots"));
    }

    #[test]
    fn any_incomplete_required_intermediate_blocks() {
        let statuses = [
            StepStatus::Pending,
            StepStatus::Current,
            StepStatus::Error,
            StepStatus::Skipped,
        ];
        for status in statuses {
            let mut steps = four_steps();
            steps[2].status = status;
            steps[1].status = StepStatus::Completed;
            assert!(!validate(0, 3, &steps).allowed, "{status} should block");
            assert!(!validate(1, 3, &steps).allowed, "{status} should block");
        }
    }
}
