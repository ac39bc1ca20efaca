//! Snapshot persistence — best-effort save/restore of in-progress sessions.
//!
//! Every storage failure is logged and swallowed: losing a snapshot only
//! costs the user a restart, never a broken flow.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::config::{DEFAULT_STORAGE_KEY, FlowSettings};
use crate::flow::{FlowArchetype, Step};

use super::traits::KeyValueStore;

/// Snapshot format version. Entries with any other version are discarded.
pub const SCHEMA_VERSION: &str = "1.0";

/// Default snapshot lifetime (24 hours).
pub const DEFAULT_SNAPSHOT_TTL: Duration = Duration::from_secs(86_400);

/// Serialized progress of a flow, as written to client storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSnapshot {
    pub archetype: FlowArchetype,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    pub steps: Vec<Step>,
    pub current_step_index: usize,
    /// Epoch milliseconds.
    pub started_at: i64,
    /// Epoch milliseconds, stamped by `PersistenceStore::save`.
    pub saved_at: i64,
    pub schema_version: String,
}

impl PersistedSnapshot {
    pub fn new(
        archetype: FlowArchetype,
        service: Option<String>,
        steps: Vec<Step>,
        current_step_index: usize,
        started_at: i64,
    ) -> Self {
        Self {
            archetype,
            service,
            steps,
            current_step_index,
            started_at,
            saved_at: 0,
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }
}

/// Reads and writes the single session snapshot.
#[derive(Clone)]
pub struct PersistenceStore {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    key: String,
    ttl: Duration,
}

impl PersistenceStore {
    pub fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            key: DEFAULT_STORAGE_KEY.to_string(),
            ttl: DEFAULT_SNAPSHOT_TTL,
        }
    }

    /// Use the key and TTL from `settings`.
    pub fn from_settings(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: &FlowSettings,
    ) -> Self {
        Self::new(store, clock)
            .with_key(&settings.storage_key)
            .with_ttl(settings.snapshot_ttl)
    }

    pub fn with_key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Stamp `savedAt`/`schemaVersion` and overwrite the stored snapshot.
    /// Returns whether the write succeeded.
    pub fn save(&self, mut snapshot: PersistedSnapshot) -> bool {
        snapshot.saved_at = self.clock.now_millis();
        snapshot.schema_version = SCHEMA_VERSION.to_string();

        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(key = %self.key, "Failed to serialize booking snapshot: {}", e);
                return false;
            }
        };

        match self.store.set(&self.key, &json) {
            Ok(()) => {
                debug!(key = %self.key, step = snapshot.current_step_index, "Booking snapshot saved");
                true
            }
            Err(e) => {
                warn!(key = %self.key, "Failed to persist booking snapshot: {}", e);
                false
            }
        }
    }

    /// Read the snapshot if present, parseable, current-version, and younger
    /// than the TTL. Rejected entries are deleted.
    pub fn load(&self) -> Option<PersistedSnapshot> {
        let raw = match self.store.get(&self.key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(key = %self.key, "Failed to read booking snapshot: {}", e);
                return None;
            }
        };

        let snapshot: PersistedSnapshot = match serde_json::from_str(&raw) {
            Ok(s) => s,
            Err(e) => {
                warn!(key = %self.key, "Discarding unparseable booking snapshot: {}", e);
                self.clear();
                return None;
            }
        };

        if snapshot.schema_version != SCHEMA_VERSION {
            warn!(
                key = %self.key,
                version = %snapshot.schema_version,
                "Discarding booking snapshot with unknown schema version"
            );
            self.clear();
            return None;
        }

        let age_ms = self.clock.now_millis() - snapshot.saved_at;
        if age_ms >= self.ttl.as_millis() as i64 {
            debug!(key = %self.key, age_ms, "Discarding expired booking snapshot");
            self.clear();
            return None;
        }

        Some(snapshot)
    }

    /// Remove the stored snapshot.
    pub fn clear(&self) {
        if let Err(e) = self.store.remove(&self.key) {
            warn!(key = %self.key, "Failed to clear booking snapshot: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::clock::ManualClock;
    use crate::flow::{FlowState, resolve_flow};
    use crate::store::MemoryStore;

    fn setup() -> (Arc<MemoryStore>, Arc<ManualClock>, PersistenceStore) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
        ));
        let persistence = PersistenceStore::new(store.clone(), clock.clone());
        (store, clock, persistence)
    }

    fn snapshot(clock: &ManualClock) -> PersistedSnapshot {
        let config = resolve_flow(FlowArchetype::Simple, Some("seo"));
        let steps = config.steps.iter().map(Step::from_definition).collect();
        let mut state = FlowState::new(steps, clock.now());
        state.complete_current();
        state.move_to(1, &[], clock.now());
        PersistedSnapshot::new(
            config.archetype,
            config.service.clone(),
            state.steps.clone(),
            state.current_step_index,
            clock.now_millis(),
        )
    }

    #[test]
    fn roundtrip_within_ttl() {
        let (_store, clock, persistence) = setup();
        let snap = snapshot(&clock);
        assert!(persistence.save(snap.clone()));

        clock.advance(chrono::Duration::hours(23));
        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.steps, snap.steps);
        assert_eq!(loaded.current_step_index, 1);
        assert_eq!(loaded.service.as_deref(), Some("seo"));
        assert_eq!(loaded.schema_version, SCHEMA_VERSION);
    }

    #[test]
    fn expired_snapshot_is_dropped_and_deleted() {
        let (store, clock, persistence) = setup();
        persistence.save(snapshot(&clock));

        clock.advance(chrono::Duration::hours(24));
        assert!(persistence.load().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn save_stamps_saved_at() {
        let (store, clock, persistence) = setup();
        persistence.save(snapshot(&clock));
        let raw = store.get(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["savedAt"], clock.now_millis());
        assert_eq!(value["archetype"], "simple");
        assert_eq!(value["currentStepIndex"], 1);
    }

    #[test]
    fn unparseable_entry_is_discarded() {
        let (store, _clock, persistence) = setup();
        store.set(DEFAULT_STORAGE_KEY, "{not json").unwrap();
        assert!(persistence.load().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn unknown_schema_version_is_discarded() {
        let (store, clock, persistence) = setup();
        persistence.save(snapshot(&clock));
        let raw = store.get(DEFAULT_STORAGE_KEY).unwrap().unwrap();
        let mut value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        value["schemaVersion"] = "0.9".into();
        store.set(DEFAULT_STORAGE_KEY, &value.to_string()).unwrap();

        assert!(persistence.load().is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn storage_failures_are_swallowed() {
        let (store, clock, persistence) = setup();
        store.set_disabled(true);
        assert!(!persistence.save(snapshot(&clock)));
        assert!(persistence.load().is_none());
        persistence.clear();
    }

    #[test]
    fn quota_exceeded_is_a_noop() {
        let store = Arc::new(MemoryStore::with_quota(16));
        let clock = Arc::new(ManualClock::default());
        let persistence = PersistenceStore::new(store.clone(), clock.clone());
        assert!(!persistence.save(snapshot(&clock)));
        assert!(store.is_empty());
    }

    #[test]
    fn save_overwrites_previous() {
        let (store, clock, persistence) = setup();
        let mut snap = snapshot(&clock);
        persistence.save(snap.clone());
        snap.current_step_index = 2;
        persistence.save(snap);
        assert_eq!(store.len(), 1);
        assert_eq!(persistence.load().unwrap().current_step_index, 2);
    }

    #[test]
    fn custom_key_and_ttl() {
        let (store, clock, persistence) = setup();
        let persistence = persistence
            .with_key("other")
            .with_ttl(Duration::from_secs(60));
        persistence.save(snapshot(&clock));
        assert!(store.get("other").unwrap().is_some());

        clock.advance(chrono::Duration::seconds(61));
        assert!(persistence.load().is_none());
    }
}
