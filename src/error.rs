//! Error types for the booking flow engine.

use crate::flow::phase::BookingPhase;
use crate::submission::{BookingError, BookingErrorCode};

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Flow error: {0}")]
    Flow(#[from] FlowError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Booking error: {0}")]
    Booking(#[from] BookingError),
}

/// Settings and flow-configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Unknown flow archetype: {0}")]
    UnknownArchetype(String),

    #[error("Flow has no steps")]
    EmptyFlow,

    #[error("Duplicate step id: {0}")]
    DuplicateStepId(String),

    #[error("Step id {id} is listed as {set} but does not exist in the flow")]
    UnknownStepReference { id: String, set: &'static str },

    #[error("Step id {0} is listed as both required and optional")]
    OverlappingStep(String),
}

/// Errors raised by controller operations. All are recovered locally:
/// the controller keeps its current phase and step.
#[derive(Debug, thiserror::Error)]
pub enum FlowError {
    #[error("Navigation blocked: {reason}")]
    NavigationBlocked { reason: String },

    #[error("Cannot transition from {from} to {to}")]
    InvalidPhaseTransition { from: BookingPhase, to: BookingPhase },

    #[error("A submission is already in progress")]
    SubmissionInProgress,

    #[error("Session is in terminal phase {phase}")]
    Terminal { phase: BookingPhase },

    #[error("Controller has been disposed")]
    Disposed,

    #[error("Step {id} not found")]
    UnknownStep { id: String },

    #[error("Step {step} failed validation: {message}")]
    FormValidation { step: String, message: String },
}

impl FlowError {
    /// The host-facing error code for this failure.
    ///
    /// Lifecycle misuse (bad phase transition, concurrent submit, terminal or
    /// disposed session) has no dedicated code and reports `InvalidConfig`:
    /// the host called the controller in a state its setup does not allow.
    pub fn code(&self) -> BookingErrorCode {
        match self {
            Self::NavigationBlocked { .. } | Self::UnknownStep { .. } => {
                BookingErrorCode::NavigationBlocked
            }
            Self::FormValidation { .. } => BookingErrorCode::FormValidationError,
            Self::InvalidPhaseTransition { .. }
            | Self::SubmissionInProgress
            | Self::Terminal { .. }
            | Self::Disposed => BookingErrorCode::InvalidConfig,
        }
    }
}

impl ConfigError {
    pub fn code(&self) -> BookingErrorCode {
        BookingErrorCode::InvalidConfig
    }
}

/// Key-value storage failures. These never escape the persistence layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage quota exceeded: {needed} bytes requested, {limit} allowed")]
    QuotaExceeded { needed: usize, limit: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Analytics backend failures. Swallowed by the emitter.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No analytics dispatcher registered")]
    NoDispatcher,

    #[error("Analytics backend {backend} failed: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Analytics dispatcher panicked")]
    Panicked,
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_error_codes() {
        let blocked = FlowError::NavigationBlocked {
            reason: "Please complete Contact".into(),
        };
        assert_eq!(blocked.code(), BookingErrorCode::NavigationBlocked);

        let invalid = FlowError::FormValidation {
            step: "contact-info".into(),
            message: "missing email".into(),
        };
        assert_eq!(invalid.code(), BookingErrorCode::FormValidationError);
    }

    #[test]
    fn lifecycle_misuse_reports_invalid_config() {
        let misuse = [
            FlowError::InvalidPhaseTransition {
                from: BookingPhase::Initial,
                to: BookingPhase::Success,
            },
            FlowError::SubmissionInProgress,
            FlowError::Terminal {
                phase: BookingPhase::Success,
            },
            FlowError::Disposed,
        ];
        for err in misuse {
            assert_eq!(err.code(), BookingErrorCode::InvalidConfig, "{err}");
        }
        assert_eq!(
            FlowError::UnknownStep { id: "x".into() }.code(),
            BookingErrorCode::NavigationBlocked
        );
    }

    #[test]
    fn messages_carry_context() {
        let err = FlowError::InvalidPhaseTransition {
            from: BookingPhase::Initial,
            to: BookingPhase::Success,
        };
        assert_eq!(err.to_string(), "Cannot transition from initial to success");

        let err: Error = ConfigError::DuplicateStepId("payment".into()).into();
        assert!(err.to_string().contains("payment"));
    }
}
