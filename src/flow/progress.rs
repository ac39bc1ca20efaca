//! Completion and time-remaining calculations.

use super::step::{Step, StepStatus};

/// Percentage of steps marked completed, rounded to the nearest integer.
/// Returns 0 for an empty list.
pub fn completion_percentage(steps: &[Step]) -> u8 {
    if steps.is_empty() {
        return 0;
    }
    let completed = steps
        .iter()
        .filter(|s| s.status == StepStatus::Completed)
        .count();
    ((completed as f64 * 100.0) / steps.len() as f64).round() as u8
}

/// Sum of estimates for `steps[from_index..]`, in seconds. Saturates at
/// `u32::MAX`.
pub fn time_remaining(steps: &[Step], from_index: usize) -> u32 {
    total_seconds(steps.iter().skip(from_index).map(|s| s.estimated_time_seconds))
}

/// Saturating sum of per-step estimates.
pub fn total_seconds(estimates: impl IntoIterator<Item = u32>) -> u32 {
    estimates.into_iter().fold(0u32, u32::saturating_add)
}
