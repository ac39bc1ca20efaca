//! The host-supplied async booking call.
//!
//! The wire protocol to any calendar or booking provider lives behind
//! `BookingSubmitter`; the controller only sees a result or an error.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::flow::{BookingPhase, FormData};

/// Host-facing error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BookingErrorCode {
    NavigationBlocked,
    ProviderLoadFailed,
    ProviderTimeout,
    InvalidService,
    InvalidConfig,
    RateLimited,
    NetworkError,
    FormValidationError,
    CalendarUnavailable,
    BookingConflict,
}

impl BookingErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NavigationBlocked => "navigation-blocked",
            Self::ProviderLoadFailed => "provider-load-failed",
            Self::ProviderTimeout => "provider-timeout",
            Self::InvalidService => "invalid-service",
            Self::InvalidConfig => "invalid-config",
            Self::RateLimited => "rate-limited",
            Self::NetworkError => "network-error",
            Self::FormValidationError => "form-validation-error",
            Self::CalendarUnavailable => "calendar-unavailable",
            Self::BookingConflict => "booking-conflict",
        }
    }
}

impl std::fmt::Display for BookingErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A confirmed booking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResult {
    pub provider: String,
    pub service: String,
    pub event_id: String,
    pub scheduled_at: DateTime<Utc>,
    pub timezone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendee_email: Option<String>,
}

/// A failed booking attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BookingError {
    pub code: BookingErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
}

impl BookingError {
    pub fn new(code: BookingErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            provider: None,
            service: None,
            context: Map::new(),
        }
    }

    pub fn with_provider(mut self, provider: &str) -> Self {
        self.provider = Some(provider.to_string());
        self
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }

    /// Record the phase in which the failure happened.
    pub fn in_phase(self, phase: BookingPhase) -> Self {
        self.with_context("phase", Value::String(phase.to_string()))
    }

    /// The phase recorded by `in_phase`, if any.
    pub fn phase(&self) -> Option<&str> {
        self.context.get("phase").and_then(Value::as_str)
    }
}

/// The host's booking call.
#[async_trait]
pub trait BookingSubmitter: Send + Sync {
    async fn submit(&self, form_data: &FormData) -> Result<BookingResult, BookingError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn codes_serialize_kebab_case() {
        let json = serde_json::to_string(&BookingErrorCode::CalendarUnavailable).unwrap();
        assert_eq!(json, "\"calendar-unavailable\"");
        for code in [
            BookingErrorCode::NavigationBlocked,
            BookingErrorCode::ProviderTimeout,
            BookingErrorCode::FormValidationError,
            BookingErrorCode::BookingConflict,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(format!("\"{code}\""), json);
        }
    }

    #[test]
    fn error_builder_records_phase() {
        let err = BookingError::new(BookingErrorCode::BookingConflict, "Slot taken")
            .with_provider("calcom")
            .with_service("seo-audit")
            .in_phase(BookingPhase::Submitting);
        assert_eq!(err.phase(), Some("submitting"));
        assert_eq!(err.to_string(), "booking-conflict: Slot taken");

        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "booking-conflict");
        assert_eq!(value["provider"], "calcom");
        assert_eq!(value["context"], json!({"phase": "submitting"}));
    }

    #[test]
    fn result_serializes_camel_case() {
        let result = BookingResult {
            provider: "calendly".into(),
            service: "consult".into(),
            event_id: "evt_1".into(),
            scheduled_at: "2025-06-02T15:00:00Z".parse().unwrap(),
            timezone: "Europe/Berlin".into(),
            attendee_email: None,
        };
        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(value["eventId"], "evt_1");
        assert!(value.get("attendeeEmail").is_none());
    }
}
