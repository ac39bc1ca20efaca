//! Booking session phase: the coarse lifecycle, distinct from the step list.

use serde::{Deserialize, Serialize};

/// Phases of a booking session.
///
/// Progresses linearly: Initial → Selecting → Form → Calendar → Confirming →
/// Submitting → {Success | Error}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPhase {
    Initial,
    Selecting,
    Form,
    Calendar,
    Confirming,
    Submitting,
    Success,
    Error,
}

impl BookingPhase {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: BookingPhase) -> bool {
        use BookingPhase::*;
        matches!(
            (self, target),
            (Initial, Selecting)
                | (Selecting, Form)
                | (Form, Calendar)
                | (Calendar, Confirming)
                // Submission may start from any interactive phase
                | (Selecting | Form | Calendar | Confirming, Submitting)
                | (Submitting, Success)
                | (Submitting, Error)
        )
    }

    /// Whether the session has finished (successfully or not).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    /// Next interactive phase. Submitting and the terminal phases are only
    /// reached through submission, so this stops at Confirming.
    pub fn next(&self) -> Option<BookingPhase> {
        use BookingPhase::*;
        match self {
            Initial => Some(Selecting),
            Selecting => Some(Form),
            Form => Some(Calendar),
            Calendar => Some(Confirming),
            Confirming | Submitting | Success | Error => None,
        }
    }

    /// One phase earlier in the fixed sequence. `Error` steps back to
    /// `Confirming` so the user can resubmit; `Submitting` and `Success`
    /// cannot be left backwards.
    pub fn previous(&self) -> Option<BookingPhase> {
        use BookingPhase::*;
        match self {
            Initial | Submitting | Success => None,
            Selecting => Some(Initial),
            Form => Some(Selecting),
            Calendar => Some(Form),
            Confirming => Some(Calendar),
            Error => Some(Confirming),
        }
    }
}

impl Default for BookingPhase {
    fn default() -> Self {
        Self::Initial
    }
}

impl std::fmt::Display for BookingPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Selecting => "selecting",
            Self::Form => "form",
            Self::Calendar => "calendar",
            Self::Confirming => "confirming",
            Self::Submitting => "submitting",
            Self::Success => "success",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}
