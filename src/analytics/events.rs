//! Analytics event names.

pub const FLOW_STARTED: &str = "booking_flow_started";
pub const STEP_PROGRESS: &str = "booking_step_progress";
pub const STEP_COMPLETED: &str = "booking_step_completed";
pub const STEP_SKIPPED: &str = "booking_step_skipped";
pub const STEP_ERROR: &str = "booking_step_error";
pub const NAVIGATION_BLOCKED: &str = "booking_navigation_blocked";
pub const VALIDATION_FAILED: &str = "booking_validation_failed";
pub const PHASE_CHANGED: &str = "booking_phase_changed";
pub const SUBMITTED: &str = "booking_submitted";
pub const SUCCESS: &str = "booking_success";
pub const ERROR: &str = "booking_error";
pub const ABANDONED: &str = "booking_abandoned";
pub const RESTARTED: &str = "booking_restarted";
pub const MODE_SELECTED: &str = "booking_mode_selected";

/// Value of the `domain` field on every event.
pub const DOMAIN: &str = "booking";
