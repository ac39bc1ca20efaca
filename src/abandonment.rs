//! Abandonment tracking — idle timeout and page exit.
//!
//! The tracker is a plain state machine over `tokio::time::Instant`; the
//! controller owns the timer that polls it. Either trigger reports at most
//! once, after which the tracker stays disarmed for the rest of the session.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

use crate::flow::BookingPhase;

/// Default inactivity window (5 minutes).
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// User-activity signals that reset the idle timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivitySignal {
    Pointer,
    Key,
    Scroll,
    Touch,
}

/// What caused an abandonment report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonmentTrigger {
    IdleTimeout,
    PageExit,
}

impl std::fmt::Display for AbandonmentTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::IdleTimeout => write!(f, "idle_timeout"),
            Self::PageExit => write!(f, "page_exit"),
        }
    }
}

/// Snapshot of where the user stopped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonmentReport {
    pub session_id: String,
    pub trigger: AbandonmentTrigger,
    pub step_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub phase: BookingPhase,
    pub elapsed_seconds: u64,
    pub completion_percentage: u8,
}

/// Result of polling the idle timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdlePoll {
    /// Not expired yet; check again at this instant.
    Pending(Instant),
    /// Expired in a live session: report abandonment now.
    Fire,
    /// Already fired, or the session ended. Stop polling.
    Inactive,
}

/// Per-session abandonment state.
#[derive(Debug, Clone)]
pub struct AbandonmentTracker {
    timeout: Duration,
    last_activity: Instant,
    fired: bool,
    disarmed: bool,
}

impl AbandonmentTracker {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Self {
            timeout,
            last_activity: now,
            fired: false,
            disarmed: false,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn is_armed(&self) -> bool {
        !self.fired && !self.disarmed
    }

    /// Push the deadline out. Ignored once the tracker is disarmed.
    pub fn record_activity(&mut self, signal: ActivitySignal, now: Instant) -> bool {
        if !self.is_armed() {
            return false;
        }
        debug!(signal = ?signal, "Activity recorded, idle timer reset");
        self.last_activity = now;
        true
    }

    /// When the idle timer expires, if it is still armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.is_armed().then(|| self.last_activity + self.timeout)
    }

    /// Check the idle timer at `now`.
    pub fn poll_idle(&mut self, now: Instant, phase: BookingPhase) -> IdlePoll {
        let Some(deadline) = self.deadline() else {
            return IdlePoll::Inactive;
        };
        if phase.is_terminal() {
            self.disarmed = true;
            return IdlePoll::Inactive;
        }
        if now < deadline {
            return IdlePoll::Pending(deadline);
        }
        self.fired = true;
        IdlePoll::Fire
    }

    /// Page is closing. Returns true if an abandonment should be reported.
    pub fn page_exit(&mut self, phase: BookingPhase) -> bool {
        if !self.is_armed() || phase.is_terminal() {
            return false;
        }
        self.fired = true;
        true
    }

    /// Stop tracking without reporting (session finished or disposed).
    pub fn disarm(&mut self) {
        self.disarmed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_once_after_timeout() {
        let start = Instant::now();
        let mut tracker = AbandonmentTracker::new(Duration::from_millis(1), start);

        assert_eq!(tracker.poll_idle(start, BookingPhase::Form), IdlePoll::Pending(start + Duration::from_millis(1)));

        let later = start + Duration::from_millis(2);
        assert_eq!(tracker.poll_idle(later, BookingPhase::Form), IdlePoll::Fire);
        assert!(tracker.has_fired());

        // A second tick of the same timer does nothing
        let much_later = start + Duration::from_secs(60);
        assert_eq!(tracker.poll_idle(much_later, BookingPhase::Form), IdlePoll::Inactive);
        assert!(tracker.deadline().is_none());
    }

    #[test]
    fn activity_resets_deadline() {
        let start = Instant::now();
        let mut tracker = AbandonmentTracker::new(Duration::from_secs(300), start);

        let t1 = start + Duration::from_secs(200);
        assert!(tracker.record_activity(ActivitySignal::Key, t1));
        assert_eq!(tracker.deadline(), Some(t1 + Duration::from_secs(300)));

        let t2 = start + Duration::from_secs(400);
        assert!(matches!(tracker.poll_idle(t2, BookingPhase::Calendar), IdlePoll::Pending(_)));
    }

    #[test]
    fn terminal_phase_disarms_without_firing() {
        let start = Instant::now();
        let mut tracker = AbandonmentTracker::new(Duration::from_millis(1), start);
        let later = start + Duration::from_secs(1);
        assert_eq!(tracker.poll_idle(later, BookingPhase::Success), IdlePoll::Inactive);
        assert!(!tracker.has_fired());
        assert!(!tracker.is_armed());
    }

    #[test]
    fn page_exit_reports_once_and_blocks_idle() {
        let start = Instant::now();
        let mut tracker = AbandonmentTracker::new(Duration::from_millis(1), start);
        assert!(tracker.page_exit(BookingPhase::Selecting));
        assert!(!tracker.page_exit(BookingPhase::Selecting));
        assert_eq!(
            tracker.poll_idle(start + Duration::from_secs(1), BookingPhase::Selecting),
            IdlePoll::Inactive
        );
    }

    #[test]
    fn page_exit_ignored_when_terminal() {
        let mut tracker = AbandonmentTracker::new(DEFAULT_IDLE_TIMEOUT, Instant::now());
        assert!(!tracker.page_exit(BookingPhase::Error));
        assert!(!tracker.has_fired());
    }

    #[test]
    fn activity_after_firing_is_ignored() {
        let start = Instant::now();
        let mut tracker = AbandonmentTracker::new(Duration::from_millis(1), start);
        tracker.poll_idle(start + Duration::from_millis(5), BookingPhase::Form);
        assert!(!tracker.record_activity(ActivitySignal::Pointer, start + Duration::from_millis(6)));
        assert!(tracker.deadline().is_none());
    }

    #[test]
    fn disarm_stops_tracking() {
        let start = Instant::now();
        let mut tracker = AbandonmentTracker::new(Duration::from_millis(1), start);
        tracker.disarm();
        assert_eq!(
            tracker.poll_idle(start + Duration::from_secs(1), BookingPhase::Form),
            IdlePoll::Inactive
        );
        assert!(!tracker.page_exit(BookingPhase::Form));
    }
}
