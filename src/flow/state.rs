//! Flow state — the mutable progress record owned by one controller.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::progress;
use super::step::{FormData, Step, StepStatus};

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").unwrap());

/// Which way a navigation moved the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Backward,
    Stay,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Forward => write!(f, "forward"),
            Self::Backward => write!(f, "backward"),
            Self::Stay => write!(f, "stay"),
        }
    }
}

/// Progress of one booking session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlowState {
    pub current_step_index: usize,
    pub steps: Vec<Step>,
    pub completion_percentage: u8,
    pub started_at: DateTime<Utc>,
    pub current_step_entered_at: DateTime<Utc>,
    pub navigation_history: Vec<usize>,
    pub session_id: String,
    pub form_data: FormData,
    /// Steps completed at some point; a revisited step returns to
    /// `completed` when the cursor leaves it.
    #[serde(default)]
    pub completed_step_ids: BTreeSet<String>,
}

/// Generate a fresh session identifier.
pub fn new_session_id() -> String {
    format!("booking_{}", Uuid::new_v4().simple())
}

impl FlowState {
    /// Start a session on the first step.
    pub fn new(steps: Vec<Step>, now: DateTime<Utc>) -> Self {
        Self::resume(steps, 0, now, now)
    }

    /// Rebuild a session positioned at `index` (clamped into range).
    pub fn resume(
        mut steps: Vec<Step>,
        index: usize,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        let index = index.min(steps.len().saturating_sub(1));
        let completed_step_ids = steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        for (i, step) in steps.iter_mut().enumerate() {
            if i == index {
                step.status = StepStatus::Current;
            } else if step.status == StepStatus::Current {
                step.status = StepStatus::Pending;
            }
        }
        let mut state = Self {
            current_step_index: index,
            steps,
            completion_percentage: 0,
            started_at,
            current_step_entered_at: now,
            navigation_history: vec![index],
            session_id: new_session_id(),
            form_data: FormData::new(),
            completed_step_ids,
        };
        state.recompute_completion();
        state
    }

    pub fn current_step(&self) -> Option<&Step> {
        self.steps.get(self.current_step_index)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == id)
    }

    pub fn is_last_step(&self) -> bool {
        self.current_step_index + 1 >= self.steps.len()
    }

    pub fn time_remaining(&self) -> u32 {
        progress::time_remaining(&self.steps, self.current_step_index)
    }

    pub fn recompute_completion(&mut self) {
        self.completion_percentage = progress::completion_percentage(&self.steps);
    }

    /// Move the cursor to `to`. The caller must already have validated the
    /// move; `skipped` are optional steps passed over on the way.
    pub fn move_to(&mut self, to: usize, skipped: &[usize], now: DateTime<Utc>) -> Direction {
        let from = self.current_step_index;
        let direction = match to.cmp(&from) {
            std::cmp::Ordering::Greater => Direction::Forward,
            std::cmp::Ordering::Less => Direction::Backward,
            std::cmp::Ordering::Equal => Direction::Stay,
        };
        if direction == Direction::Stay {
            return direction;
        }

        if let Some(step) = self.steps.get_mut(from) {
            if step.status == StepStatus::Current {
                step.status = resting_status(&self.completed_step_ids, &step.id);
            }
        }
        for &idx in skipped {
            if let Some(step) = self.steps.get_mut(idx) {
                step.status = StepStatus::Skipped;
            }
        }
        if let Some(step) = self.steps.get_mut(to) {
            step.status = StepStatus::Current;
        }

        self.current_step_index = to;
        self.current_step_entered_at = now;
        self.navigation_history.push(to);
        self.recompute_completion();
        direction
    }

    /// Mark the current step completed without moving the cursor.
    pub fn complete_current(&mut self) {
        if let Some(step) = self.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::Completed;
            step.error_message = None;
            self.completed_step_ids.insert(step.id.clone());
        }
        self.recompute_completion();
    }

    /// Mark the current step skipped without moving the cursor.
    pub fn skip_current(&mut self) {
        if let Some(step) = self.steps.get_mut(self.current_step_index) {
            step.status = StepStatus::Skipped;
            self.completed_step_ids.remove(&step.id);
        }
        self.recompute_completion();
    }

    /// Swap in a re-evaluated step list. Steps that survive keep their
    /// status and error; the cursor follows the current step's id, or the
    /// nearest index if that step was removed.
    pub fn replace_steps(&mut self, mut steps: Vec<Step>) {
        let current_id = self.current_step().map(|s| s.id.clone());

        for step in steps.iter_mut() {
            if let Some(old) = self.steps.iter().find(|s| s.id == step.id) {
                step.status = old.status;
                step.error_message = old.error_message.clone();
            }
        }

        let index = current_id
            .and_then(|id| steps.iter().position(|s| s.id == id))
            .unwrap_or_else(|| self.current_step_index.min(steps.len().saturating_sub(1)));

        self.completed_step_ids
            .retain(|id| steps.iter().any(|s| &s.id == id));
        for (i, step) in steps.iter_mut().enumerate() {
            if i == index {
                step.status = StepStatus::Current;
            } else if step.status == StepStatus::Current {
                step.status = resting_status(&self.completed_step_ids, &step.id);
            }
        }

        self.steps = steps;
        self.current_step_index = index;
        self.recompute_completion();
    }

    /// Check the current step's required fields against the form data.
    /// Returns a human-readable problem description on failure.
    pub fn validate_current_fields(&self) -> Result<(), String> {
        let Some(step) = self.current_step() else {
            return Ok(());
        };

        let missing: Vec<&str> = step
            .required_fields
            .iter()
            .filter(|field| is_blank(self.form_data.get(field.as_str())))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(format!("missing {}", missing.join(", ")));
        }

        if step.required_fields.iter().any(|f| f == "email") {
            let email = self.form_data.get("email").and_then(Value::as_str).unwrap_or("");
            if !EMAIL_PATTERN.is_match(email.trim()) {
                return Err(format!("invalid email address: {email}"));
            }
        }

        Ok(())
    }

    pub fn set_step_error(&mut self, index: usize, message: Option<String>) {
        if let Some(step) = self.steps.get_mut(index) {
            step.error_message = message;
        }
    }

    /// Put a step into the error state. The current step only records the
    /// message so exactly one step stays current.
    pub fn mark_step_error(&mut self, index: usize, message: String) {
        let current = self.current_step_index;
        if let Some(step) = self.steps.get_mut(index) {
            if index != current {
                step.status = StepStatus::Error;
            }
            step.error_message = Some(message);
        }
        self.recompute_completion();
    }

    /// Clear a step's error. An errored step goes back to `completed` if it
    /// was finished before, `pending` otherwise.
    pub fn clear_step_error(&mut self, index: usize) {
        if let Some(step) = self.steps.get_mut(index) {
            if step.status == StepStatus::Error {
                step.status = resting_status(&self.completed_step_ids, &step.id);
            }
            step.error_message = None;
        }
        self.recompute_completion();
    }
}

/// Status of a step the cursor has just left.
fn resting_status(completed: &BTreeSet<String>, id: &str) -> StepStatus {
    if completed.contains(id) {
        StepStatus::Completed
    } else {
        StepStatus::Pending
    }
}

fn is_blank(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use crate::flow::step::StepDefinition;

    fn steps() -> Vec<Step> {
        vec![
            Step::from_definition(&StepDefinition::new("service-selection", "Service")),
            Step::from_definition(&StepDefinition::new("payment", "Payment").optional()),
            Step::from_definition(
                &StepDefinition::new("contact-info", "Contact")
                    .with_required_fields(&["name", "email"]),
            ),
            Step::from_definition(&StepDefinition::new("confirmation", "Confirm")),
        ]
    }

    fn current_count(state: &FlowState) -> usize {
        state
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Current)
            .count()
    }

    #[test]
    fn new_state_starts_on_first_step() {
        let state = FlowState::new(steps(), Utc::now());
        assert_eq!(state.current_step_index, 0);
        assert_eq!(state.steps[0].status, StepStatus::Current);
        assert_eq!(current_count(&state), 1);
        assert_eq!(state.navigation_history, vec![0]);
        assert!(state.session_id.starts_with("booking_"));
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(new_session_id(), new_session_id());
    }

    #[test]
    fn move_forward_marks_skipped_and_current() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.complete_current();
        let dir = state.move_to(2, &[1], Utc::now());
        assert_eq!(dir, Direction::Forward);
        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert_eq!(state.steps[1].status, StepStatus::Skipped);
        assert_eq!(state.steps[2].status, StepStatus::Current);
        assert_eq!(state.navigation_history, vec![0, 2]);
        assert_eq!(state.completion_percentage, 25);
        assert_eq!(current_count(&state), 1);
    }

    #[test]
    fn move_backward_keeps_completed_status() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.complete_current();
        state.move_to(1, &[], Utc::now());
        let dir = state.move_to(0, &[], Utc::now());
        assert_eq!(dir, Direction::Backward);
        assert_eq!(state.steps[0].status, StepStatus::Current);
        assert_eq!(state.steps[1].status, StepStatus::Pending);

        // Leaving the revisited step restores its completion
        state.move_to(1, &[], Utc::now());
        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert_eq!(state.completion_percentage, 25);
        assert_eq!(current_count(&state), 1);
    }

    #[test]
    fn resume_clamps_index() {
        let state = FlowState::resume(steps(), 99, Utc::now(), Utc::now());
        assert_eq!(state.current_step_index, 3);
        assert_eq!(current_count(&state), 1);
    }

    #[test]
    fn replace_steps_preserves_progress() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.complete_current();
        state.move_to(2, &[1], Utc::now());

        // Drop the optional payment step
        let mut next = steps();
        next.remove(1);
        state.replace_steps(next);

        assert_eq!(state.steps.len(), 3);
        assert_eq!(state.current_step_index, 1);
        assert_eq!(state.steps[1].id, "contact-info");
        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert_eq!(current_count(&state), 1);
    }

    #[test]
    fn replace_steps_moves_cursor_when_current_removed() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.move_to(1, &[], Utc::now());

        let mut next = steps();
        next.remove(1);
        state.replace_steps(next);

        assert_eq!(state.current_step_index, 1);
        assert_eq!(state.steps[1].id, "contact-info");
        assert_eq!(state.steps[1].status, StepStatus::Current);
        assert_eq!(current_count(&state), 1);
    }

    #[test]
    fn required_fields_are_checked() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.move_to(2, &[], Utc::now());

        let err = state.validate_current_fields().unwrap_err();
        assert!(err.contains("name"));
        assert!(err.contains("email"));

        state.form_data.insert("name".into(), json!("Ada"));
        state.form_data.insert("email".into(), json!("not-an-email"));
        assert!(state.validate_current_fields().unwrap_err().contains("invalid email"));

        state.form_data.insert("email".into(), json!("ada@example.com"));
        assert!(state.validate_current_fields().is_ok());
    }

    #[test]
    fn cleared_error_restores_completed_step() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.complete_current();
        state.move_to(2, &[1], Utc::now());
        assert_eq!(state.completion_percentage, 25);

        state.mark_step_error(0, "calendar unavailable".into());
        assert_eq!(state.steps[0].status, StepStatus::Error);
        assert_eq!(state.completion_percentage, 0);

        state.clear_step_error(0);
        assert_eq!(state.steps[0].status, StepStatus::Completed);
        assert!(state.steps[0].error_message.is_none());
        assert_eq!(state.completion_percentage, 25);
    }

    #[test]
    fn error_on_current_step_keeps_it_current() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.mark_step_error(0, "boom".into());
        assert_eq!(state.steps[0].status, StepStatus::Current);
        assert_eq!(state.steps[0].error_message.as_deref(), Some("boom"));
        assert_eq!(current_count(&state), 1);

        state.mark_step_error(3, "later".into());
        state.clear_step_error(3);
        assert_eq!(state.steps[3].status, StepStatus::Pending);
    }

    #[test]
    fn blank_strings_count_as_missing() {
        let mut state = FlowState::new(steps(), Utc::now());
        state.move_to(2, &[], Utc::now());
        state.form_data.insert("name".into(), json!("   "));
        state.form_data.insert("email".into(), json!("ada@example.com"));
        assert!(state.validate_current_fields().unwrap_err().contains("name"));
    }
}
