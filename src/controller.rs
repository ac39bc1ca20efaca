//! FlowController — the stateful booking session.
//!
//! One controller owns one `FlowState` and one `BookingPhase`. Callers drive
//! it through explicit methods; every mutation runs under the session lock,
//! then side effects (snapshot save, analytics, observer events, host hooks)
//! are flushed after the lock is released.
//!
//! Three timers run per session: a repeating elapsed-time tick, the idle
//! abandonment watch, and the auto-save debounce. Timer tasks hold only a
//! `Weak` reference and are aborted on `dispose`, `restart`, and drop.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde_json::{Value, json};
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};

use crate::abandonment::{
    AbandonmentReport, AbandonmentTracker, AbandonmentTrigger, ActivitySignal, IdlePoll,
};
use crate::analytics::{AnalyticsContext, AnalyticsDispatcher, AnalyticsEmitter, events};
use crate::clock::Clock;
use crate::config::FlowSettings;
use crate::error::{Error, FlowError};
use crate::flow::{
    BookingPhase, ConditionalStepEvaluator, Direction, FlowConfiguration, FlowState, FormData,
    NavigationDecision, NavigationGuard, Step,
};
use crate::mode::{ModeDecision, ModeDecisionEngine, ModeOptions};
use crate::store::{KeyValueStore, PersistedSnapshot, PersistenceStore};
use crate::submission::{BookingError, BookingErrorCode, BookingResult, BookingSubmitter};

/// Broadcast channel capacity for observer events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Host callbacks. Invoked outside the session lock.
#[derive(Clone, Default)]
pub struct FlowHooks {
    pub on_success: Option<Arc<dyn Fn(&BookingResult) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(&BookingError) + Send + Sync>>,
    /// Called for idle abandonment only; page exit never calls back.
    pub on_abandon: Option<Arc<dyn Fn(&AbandonmentReport) + Send + Sync>>,
}

/// Capabilities injected into a controller.
#[derive(Clone)]
pub struct FlowControllerDeps {
    pub clock: Arc<dyn Clock>,
    pub store: Arc<dyn KeyValueStore>,
    pub submitter: Arc<dyn BookingSubmitter>,
    pub dispatcher: Option<Arc<dyn AnalyticsDispatcher>>,
    /// Base fields (service, variant, source, ...) merged into every
    /// analytics event of the session.
    pub context: AnalyticsContext,
    pub settings: FlowSettings,
    pub hooks: FlowHooks,
}

/// State-change notifications for observers.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    Started { session_id: String, restored: bool },
    StepChanged { from: usize, to: usize, direction: Direction },
    StepsUpdated { step_ids: Vec<String> },
    FormDataChanged,
    PhaseChanged { from: BookingPhase, to: BookingPhase },
    Tick { elapsed_seconds: u64 },
    Completed(BookingResult),
    Failed(BookingError),
    Abandoned(AbandonmentReport),
    Restarted { session_id: String },
    Disposed,
}

struct Session {
    state: FlowState,
    phase: BookingPhase,
    tracker: AbandonmentTracker,
    elapsed: Duration,
    result: Option<BookingResult>,
    error: Option<BookingError>,
    /// Bumped by `restart`; stale timers and submissions compare against it.
    generation: u64,
    restored: bool,
    /// Set when the idle timeout fires. An abandoned session is never saved.
    abandoned: bool,
    disposed: bool,
}

#[derive(Default)]
struct Timers {
    tick: Option<JoinHandle<()>>,
    idle: Option<JoinHandle<()>>,
    autosave: Option<JoinHandle<()>>,
}

impl Timers {
    fn abort_all(&mut self) {
        for handle in [self.tick.take(), self.idle.take(), self.autosave.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }

    fn stop_session_timers(&mut self) {
        if let Some(handle) = self.tick.take() {
            handle.abort();
        }
        if let Some(handle) = self.idle.take() {
            handle.abort();
        }
    }
}

enum HookCall {
    Success(BookingResult),
    Error(BookingError),
    Abandon(AbandonmentReport),
}

/// Side effects collected under the lock, flushed after it is released.
#[derive(Default)]
struct Outbox {
    analytics: Vec<(&'static str, Value)>,
    events: Vec<FlowEvent>,
    hooks: Vec<HookCall>,
}

impl Outbox {
    fn track(&mut self, name: &'static str, payload: Value) {
        self.analytics.push((name, payload));
    }

    fn notify(&mut self, event: FlowEvent) {
        self.events.push(event);
    }

    fn phase_change(&mut self, from: BookingPhase, to: BookingPhase) {
        self.track(events::PHASE_CHANGED, json!({"from": from, "to": to}));
        self.notify(FlowEvent::PhaseChanged { from, to });
    }
}

/// The booking session orchestrator.
pub struct FlowController {
    config: FlowConfiguration,
    base_steps: Vec<Step>,
    evaluator: ConditionalStepEvaluator,
    guard: NavigationGuard,
    settings: FlowSettings,
    clock: Arc<dyn Clock>,
    persistence: PersistenceStore,
    submitter: Arc<dyn BookingSubmitter>,
    analytics: AnalyticsEmitter,
    context: AnalyticsContext,
    hooks: FlowHooks,
    session: RwLock<Session>,
    timers: Mutex<Timers>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowController {
    /// Create a controller for a fresh session. Call `start` to begin.
    pub fn new(config: FlowConfiguration, deps: FlowControllerDeps) -> Result<Arc<Self>, Error> {
        deps.settings.validate()?;
        config.validate()?;

        let evaluator = ConditionalStepEvaluator::new(config.conditional_rules.clone());
        let base_steps: Vec<Step> = config.steps.iter().map(Step::from_definition).collect();
        let steps = evaluator.apply(&base_steps, &FormData::new());
        let state = FlowState::new(steps, deps.clock.now());

        Ok(Self::assemble(
            config,
            base_steps,
            evaluator,
            deps,
            state,
            BookingPhase::Initial,
            false,
        ))
    }

    /// Resume from a stored snapshot if one exists for the same archetype and
    /// service and is still fresh. Returns `None` otherwise.
    pub fn restore(
        config: FlowConfiguration,
        deps: FlowControllerDeps,
    ) -> Result<Option<Arc<Self>>, Error> {
        deps.settings.validate()?;
        config.validate()?;

        let persistence =
            PersistenceStore::from_settings(deps.store.clone(), deps.clock.clone(), &deps.settings);
        let Some(snapshot) = persistence.load() else {
            return Ok(None);
        };
        if snapshot.archetype != config.archetype || snapshot.service != config.service {
            debug!(
                stored = %snapshot.archetype,
                requested = %config.archetype,
                "Stored snapshot belongs to a different flow, not restoring"
            );
            return Ok(None);
        }
        if snapshot.steps.is_empty() {
            return Ok(None);
        }

        let started_at = chrono::DateTime::from_timestamp_millis(snapshot.started_at)
            .unwrap_or_else(|| deps.clock.now());
        let state = FlowState::resume(
            snapshot.steps,
            snapshot.current_step_index,
            started_at,
            deps.clock.now(),
        );
        let phase = if state.current_step_index == 0 {
            BookingPhase::Selecting
        } else {
            BookingPhase::Form
        };

        let evaluator = ConditionalStepEvaluator::new(config.conditional_rules.clone());
        let base_steps: Vec<Step> = config.steps.iter().map(Step::from_definition).collect();

        info!(
            session_id = %state.session_id,
            step = state.current_step_index,
            "Restored booking session from snapshot"
        );
        Ok(Some(Self::assemble(
            config, base_steps, evaluator, deps, state, phase, true,
        )))
    }

    fn assemble(
        config: FlowConfiguration,
        base_steps: Vec<Step>,
        evaluator: ConditionalStepEvaluator,
        deps: FlowControllerDeps,
        state: FlowState,
        phase: BookingPhase,
        restored: bool,
    ) -> Arc<Self> {
        let persistence =
            PersistenceStore::from_settings(deps.store.clone(), deps.clock.clone(), &deps.settings);
        let analytics = AnalyticsEmitter::new(deps.clock.clone(), &state.session_id);
        if let Some(dispatcher) = deps.dispatcher {
            analytics.set_dispatcher(dispatcher);
        }
        let (events, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let tracker = AbandonmentTracker::new(deps.settings.idle_timeout, Instant::now());

        Arc::new(Self {
            config,
            base_steps,
            evaluator,
            guard: NavigationGuard,
            settings: deps.settings,
            clock: deps.clock,
            persistence,
            submitter: deps.submitter,
            analytics,
            context: deps.context,
            hooks: deps.hooks,
            session: RwLock::new(Session {
                state,
                phase,
                tracker,
                elapsed: Duration::ZERO,
                result: None,
                error: None,
                generation: 0,
                restored,
                abandoned: false,
                disposed: false,
            }),
            timers: Mutex::new(Timers::default()),
            events,
        })
    }

    // ── Observation ─────────────────────────────────────────────────

    /// Subscribe to state-change events.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Subscribe as a `Stream`.
    pub fn event_stream(&self) -> BroadcastStream<FlowEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    /// The session-scoped analytics emitter (register dispatchers here).
    pub fn analytics(&self) -> &AnalyticsEmitter {
        &self.analytics
    }

    pub fn config(&self) -> &FlowConfiguration {
        &self.config
    }

    pub fn settings(&self) -> &FlowSettings {
        &self.settings
    }

    /// A copy of the current flow state.
    pub async fn state(&self) -> FlowState {
        self.session.read().await.state.clone()
    }

    pub async fn phase(&self) -> BookingPhase {
        self.session.read().await.phase
    }

    pub async fn session_id(&self) -> String {
        self.session.read().await.state.session_id.clone()
    }

    pub async fn current_step(&self) -> Option<Step> {
        self.session.read().await.state.current_step().cloned()
    }

    pub async fn completion_percentage(&self) -> u8 {
        self.session.read().await.state.completion_percentage
    }

    /// Estimated seconds left from the current step onward.
    pub async fn time_remaining(&self) -> u32 {
        self.session.read().await.state.time_remaining()
    }

    pub async fn elapsed_seconds(&self) -> u64 {
        self.session.read().await.elapsed.as_secs()
    }

    pub async fn result(&self) -> Option<BookingResult> {
        self.session.read().await.result.clone()
    }

    pub async fn error(&self) -> Option<BookingError> {
        self.session.read().await.error.clone()
    }

    pub async fn is_disposed(&self) -> bool {
        self.session.read().await.disposed
    }

    pub async fn abandonment_reported(&self) -> bool {
        self.session.read().await.tracker.has_fired()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Begin the session: enter `selecting` (unless restored into a later
    /// phase), emit the start event, persist, and arm the timers.
    pub async fn start(self: &Arc<Self>) -> Result<(), FlowError> {
        let mut outbox = Outbox::default();
        let generation = {
            let mut s = self.session.write().await;
            ensure_live(&s)?;
            if s.phase.is_terminal() {
                return Err(FlowError::Terminal { phase: s.phase });
            }

            if s.phase == BookingPhase::Initial {
                s.phase = BookingPhase::Selecting;
                outbox.phase_change(BookingPhase::Initial, BookingPhase::Selecting);
            }
            s.tracker = AbandonmentTracker::new(self.settings.idle_timeout, Instant::now());

            outbox.track(
                events::FLOW_STARTED,
                json!({
                    "archetype": self.config.archetype,
                    "service": self.config.service,
                    "totalSteps": s.state.steps.len(),
                    "estimatedTotalTimeSeconds": self.config.estimated_total_time_seconds,
                    "restored": s.restored,
                }),
            );
            outbox.notify(FlowEvent::Started {
                session_id: s.state.session_id.clone(),
                restored: s.restored,
            });
            self.persist(&s);

            info!(
                session_id = %s.state.session_id,
                archetype = %self.config.archetype,
                steps = s.state.steps.len(),
                "Booking flow started"
            );
            s.generation
        };

        self.flush(outbox);
        self.spawn_session_timers(generation);
        Ok(())
    }

    /// Start over with a new session id, empty form data, fresh steps and
    /// fresh timers. A pending submission keeps running but its result is
    /// ignored.
    pub async fn restart(self: &Arc<Self>) -> Result<(), FlowError> {
        let mut outbox = Outbox::default();
        let generation = {
            let mut s = self.session.write().await;
            ensure_live(&s)?;
            self.lock_timers().abort_all();

            let previous_session = s.state.session_id.clone();
            let previous_phase = s.phase;
            let steps = self.evaluator.apply(&self.base_steps, &FormData::new());

            s.state = FlowState::new(steps, self.clock.now());
            s.phase = BookingPhase::Initial;
            s.tracker = AbandonmentTracker::new(self.settings.idle_timeout, Instant::now());
            s.elapsed = Duration::ZERO;
            s.result = None;
            s.error = None;
            s.restored = false;
            s.abandoned = false;
            s.generation += 1;

            self.analytics.set_session_id(&s.state.session_id);
            self.persistence.clear();

            if previous_phase != BookingPhase::Initial {
                outbox.phase_change(previous_phase, BookingPhase::Initial);
            }
            outbox.track(
                events::RESTARTED,
                json!({"previousSessionId": previous_session, "fromPhase": previous_phase}),
            );
            outbox.notify(FlowEvent::Restarted {
                session_id: s.state.session_id.clone(),
            });

            info!(
                previous_session = %previous_session,
                session_id = %s.state.session_id,
                "Booking flow restarted"
            );
            s.generation
        };

        self.flush(outbox);
        self.spawn_session_timers(generation);
        Ok(())
    }

    /// Tear down: cancel every timer, stop tracking, and unregister the
    /// analytics dispatcher. Further operations fail with `Disposed`.
    pub async fn dispose(&self) {
        {
            let mut s = self.session.write().await;
            if s.disposed {
                return;
            }
            s.disposed = true;
            s.tracker.disarm();
            self.lock_timers().abort_all();
            info!(session_id = %s.state.session_id, "Booking flow disposed");
        }
        self.analytics.clear_dispatcher();
        let _ = self.events.send(FlowEvent::Disposed);
    }

    // ── Steps ───────────────────────────────────────────────────────

    /// Ask the guard whether `index` is reachable, without moving.
    pub async fn can_navigate_to(&self, index: usize) -> NavigationDecision {
        let s = self.session.read().await;
        self.guard
            .validate(s.state.current_step_index, index, &s.state.steps)
    }

    /// Jump to a step (e.g. a progress-bar click).
    pub async fn go_to_step(&self, index: usize) -> Result<NavigationDecision, FlowError> {
        let mut outbox = Outbox::default();
        let result = {
            let mut s = self.session.write().await;
            ensure_interactive(&s)?;
            self.move_locked(&mut s, index, &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// Validate and complete the current step, then advance to the next one.
    /// Returns the new current index (unchanged on the last step).
    pub async fn complete_current_step(&self) -> Result<usize, FlowError> {
        let mut outbox = Outbox::default();
        let result = {
            let mut s = self.session.write().await;
            ensure_interactive(&s)?;
            self.complete_locked(&mut s, &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// Alias for `complete_current_step`.
    pub async fn next_step(&self) -> Result<usize, FlowError> {
        self.complete_current_step().await
    }

    /// Move one step back. No-op on the first step.
    pub async fn previous_step(&self) -> Result<usize, FlowError> {
        let mut outbox = Outbox::default();
        let result = {
            let mut s = self.session.write().await;
            ensure_interactive(&s)?;
            let index = s.state.current_step_index;
            if index == 0 {
                Ok(0)
            } else {
                self.move_locked(&mut s, index - 1, &mut outbox)
                    .map(|_| index - 1)
            }
        };
        self.flush(outbox);
        result
    }

    /// Skip the current step if it is optional and advance.
    pub async fn skip_current_step(&self) -> Result<usize, FlowError> {
        let mut outbox = Outbox::default();
        let result = {
            let mut s = self.session.write().await;
            ensure_interactive(&s)?;
            self.skip_locked(&mut s, &mut outbox)
        };
        self.flush(outbox);
        result
    }

    /// Put a step into the error state (e.g. calendar unavailable). On the
    /// current step only the message is recorded, so it stays current.
    pub async fn mark_step_error(&self, step_id: &str, message: &str) -> Result<(), FlowError> {
        let mut outbox = Outbox::default();
        {
            let mut s = self.session.write().await;
            ensure_live(&s)?;
            let index = s
                .state
                .step_index(step_id)
                .ok_or_else(|| FlowError::UnknownStep {
                    id: step_id.to_string(),
                })?;
            s.state.mark_step_error(index, message.to_string());
            self.persist(&s);
            warn!(step = %step_id, "Step marked as error: {}", message);

            outbox.track(
                events::STEP_ERROR,
                json!({"step": index, "stepName": step_id, "message": message}),
            );
            outbox.notify(FlowEvent::StepsUpdated {
                step_ids: s.state.steps.iter().map(|st| st.id.clone()).collect(),
            });
        }
        self.flush(outbox);
        Ok(())
    }

    /// Clear a step's error. An errored step returns to `completed` if it
    /// was finished before, otherwise to `pending`.
    pub async fn clear_step_error(&self, step_id: &str) -> Result<(), FlowError> {
        let mut s = self.session.write().await;
        ensure_live(&s)?;
        let index = s
            .state
            .step_index(step_id)
            .ok_or_else(|| FlowError::UnknownStep {
                id: step_id.to_string(),
            })?;
        s.state.clear_step_error(index);
        self.persist(&s);
        debug!(step = %step_id, "Step error cleared");
        Ok(())
    }

    // ── Form data ───────────────────────────────────────────────────

    /// Merge fields into the form data, re-evaluate conditional steps, and
    /// schedule a debounced snapshot save.
    pub async fn update_form_data(self: &Arc<Self>, fields: FormData) -> Result<(), FlowError> {
        let mut outbox = Outbox::default();
        {
            let mut s = self.session.write().await;
            ensure_interactive(&s)?;
            s.state.form_data.extend(fields);
            self.reevaluate_locked(&mut s, &mut outbox);
            outbox.notify(FlowEvent::FormDataChanged);
        }
        self.flush(outbox);
        self.schedule_autosave();
        Ok(())
    }

    /// Set a single form field.
    pub async fn set_field(self: &Arc<Self>, key: &str, value: Value) -> Result<(), FlowError> {
        let mut fields = FormData::new();
        fields.insert(key.to_string(), value);
        self.update_form_data(fields).await
    }

    pub async fn form_data(&self) -> FormData {
        self.session.read().await.state.form_data.clone()
    }

    // ── Phase ───────────────────────────────────────────────────────

    /// Move one phase forward (up to `confirming`).
    pub async fn advance_phase(&self) -> Result<BookingPhase, FlowError> {
        let mut outbox = Outbox::default();
        let result = {
            let mut s = self.session.write().await;
            ensure_interactive(&s)?;
            let from = s.phase;
            match from.next() {
                Some(to) if from.can_transition_to(to) => {
                    s.phase = to;
                    outbox.phase_change(from, to);
                    info!(session_id = %s.state.session_id, from = %from, to = %to, "Booking phase advanced");
                    Ok(to)
                }
                _ => Err(FlowError::InvalidPhaseTransition {
                    from,
                    to: BookingPhase::Submitting,
                }),
            }
        };
        self.flush(outbox);
        result
    }

    /// Move one phase back in the fixed sequence. Returns false when there
    /// is nowhere to go: already `initial`, or succeeded. A pending
    /// submission also returns false; no new navigation is accepted until
    /// it settles, and its outcome decides the next phase.
    pub async fn go_back(self: &Arc<Self>) -> Result<bool, FlowError> {
        let mut outbox = Outbox::default();
        let mut rearm = None;
        {
            let mut s = self.session.write().await;
            ensure_live(&s)?;
            let from = s.phase;
            let Some(to) = from.previous() else {
                return Ok(false);
            };
            s.phase = to;
            if from == BookingPhase::Error {
                s.error = None;
                if !s.tracker.has_fired() {
                    s.tracker = AbandonmentTracker::new(self.settings.idle_timeout, Instant::now());
                }
                rearm = Some(s.generation);
            }
            outbox.phase_change(from, to);
            info!(session_id = %s.state.session_id, from = %from, to = %to, "Booking phase moved back");
        }
        self.flush(outbox);
        if let Some(generation) = rearm {
            self.spawn_session_timers(generation);
        }
        Ok(true)
    }

    /// Submit the booking: enter `submitting`, merge `data`, call the host
    /// submitter (bounded by the submission timeout), then settle in
    /// `success` or `error`.
    pub async fn submit_booking(self: &Arc<Self>, data: FormData) -> Result<BookingResult, Error> {
        let mut outbox = Outbox::default();
        let (generation, form_data) = {
            let mut s = self.session.write().await;
            ensure_live(&s)?;
            let from = s.phase;
            if from == BookingPhase::Submitting {
                return Err(FlowError::SubmissionInProgress.into());
            }
            if from.is_terminal() {
                return Err(FlowError::Terminal { phase: from }.into());
            }
            if !from.can_transition_to(BookingPhase::Submitting) {
                return Err(FlowError::InvalidPhaseTransition {
                    from,
                    to: BookingPhase::Submitting,
                }
                .into());
            }

            s.state.form_data.extend(data);
            s.phase = BookingPhase::Submitting;
            outbox.phase_change(from, BookingPhase::Submitting);
            outbox.track(
                events::SUBMITTED,
                json!({
                    "service": self.config.service,
                    "step": s.state.current_step_index,
                    "completionPercentage": s.state.completion_percentage,
                }),
            );
            info!(session_id = %s.state.session_id, "Submitting booking");
            (s.generation, s.state.form_data.clone())
        };
        self.flush(outbox);

        let timeout = self.settings.submission_timeout;
        let call = AssertUnwindSafe(self.submitter.submit(&form_data)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, call).await {
            Ok(Ok(result)) => result,
            Ok(Err(_panic)) => Err(BookingError::new(
                BookingErrorCode::NetworkError,
                "Booking submission failed unexpectedly",
            )),
            Err(_elapsed) => Err(BookingError::new(
                BookingErrorCode::ProviderTimeout,
                format!("Booking provider did not respond within {}s", timeout.as_secs()),
            )),
        };

        let mut outbox = Outbox::default();
        let settled = {
            let mut s = self.session.write().await;
            if s.disposed || s.generation != generation {
                debug!("Ignoring submission result for a superseded session");
                return outcome.map_err(Error::from);
            }

            match outcome {
                Ok(result) => {
                    s.state.complete_current();
                    s.phase = BookingPhase::Success;
                    s.result = Some(result.clone());
                    s.tracker.disarm();
                    self.lock_timers().stop_session_timers();
                    self.persistence.clear();

                    outbox.phase_change(BookingPhase::Submitting, BookingPhase::Success);
                    outbox.track(
                        events::SUCCESS,
                        json!({
                            "provider": result.provider,
                            "service": result.service,
                            "eventId": result.event_id,
                            "scheduledAt": result.scheduled_at,
                            "elapsedSeconds": s.elapsed.as_secs(),
                        }),
                    );
                    outbox.notify(FlowEvent::Completed(result.clone()));
                    outbox.hooks.push(HookCall::Success(result.clone()));
                    info!(session_id = %s.state.session_id, event_id = %result.event_id, "Booking confirmed");
                    Ok(result)
                }
                Err(err) => {
                    let mut err = if err.phase().is_none() {
                        err.in_phase(BookingPhase::Submitting)
                    } else {
                        err
                    };
                    if err.service.is_none() {
                        err.service = self.config.service.clone();
                    }
                    s.phase = BookingPhase::Error;
                    s.error = Some(err.clone());
                    s.tracker.disarm();
                    self.lock_timers().stop_session_timers();
                    self.persist(&s);

                    outbox.phase_change(BookingPhase::Submitting, BookingPhase::Error);
                    outbox.track(
                        events::ERROR,
                        json!({
                            "code": err.code,
                            "message": err.message,
                            "provider": err.provider,
                            "service": err.service,
                        }),
                    );
                    outbox.notify(FlowEvent::Failed(err.clone()));
                    outbox.hooks.push(HookCall::Error(err.clone()));
                    warn!(session_id = %s.state.session_id, code = %err.code, "Booking failed: {}", err.message);
                    Err(Error::Booking(err))
                }
            }
        };
        self.flush(outbox);
        settled
    }

    // ── Activity & abandonment ──────────────────────────────────────

    /// Reset the idle timer in response to user activity.
    pub async fn record_activity(&self, signal: ActivitySignal) -> bool {
        let mut s = self.session.write().await;
        if s.disposed {
            return false;
        }
        s.tracker.record_activity(signal, Instant::now())
    }

    /// The page is unloading. Best-effort: reports abandonment to analytics
    /// (never to host callbacks) and flushes the snapshot.
    pub async fn page_exit(&self) -> bool {
        let mut s = self.session.write().await;
        if s.disposed {
            return false;
        }
        let phase = s.phase;
        if !s.tracker.page_exit(phase) {
            return false;
        }
        let report = self.report_locked(&s, AbandonmentTrigger::PageExit);
        self.persist(&s);
        drop(s);

        info!(session_id = %report.session_id, step = report.step_index, "Booking abandoned on page exit");
        self.track(events::ABANDONED, abandonment_payload(&report));
        true
    }

    // ── Presentation ────────────────────────────────────────────────

    /// Decide the presentation mode and record the decision.
    pub fn choose_mode(&self, engine: &ModeDecisionEngine, options: &ModeOptions) -> ModeDecision {
        let decision = engine.decide(options);
        self.track(
            events::MODE_SELECTED,
            json!({"mode": decision.mode, "reason": decision.reason, "service": self.config.service}),
        );
        decision
    }

    // ── Internals ───────────────────────────────────────────────────

    fn move_locked(
        &self,
        s: &mut Session,
        to: usize,
        outbox: &mut Outbox,
    ) -> Result<NavigationDecision, FlowError> {
        let from = s.state.current_step_index;
        let decision = self.guard.validate(from, to, &s.state.steps);

        if !decision.allowed {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "Navigation not allowed".to_string());
            info!(session_id = %s.state.session_id, from, to, reason = %reason, "Navigation blocked");
            outbox.track(
                events::NAVIGATION_BLOCKED,
                json!({"from": from, "to": to, "reason": reason}),
            );
            return Err(FlowError::NavigationBlocked { reason });
        }

        let direction =
            s.state
                .move_to(to, &decision.skipped_optional_indices, self.clock.now());
        if direction == Direction::Stay {
            return Ok(decision);
        }

        for &idx in &decision.skipped_optional_indices {
            let step = &s.state.steps[idx];
            outbox.track(
                events::STEP_SKIPPED,
                json!({"step": idx, "stepName": step.id}),
            );
        }
        let step_name = s.state.steps[to].id.clone();
        outbox.track(
            events::STEP_PROGRESS,
            json!({
                "step": to,
                "stepName": step_name,
                "direction": direction,
                "completionPercentage": s.state.completion_percentage,
                "timeRemainingSeconds": s.state.time_remaining(),
            }),
        );
        outbox.notify(FlowEvent::StepChanged { from, to, direction });
        debug!(session_id = %s.state.session_id, from, to, direction = %direction, "Step changed");

        self.persist(s);
        Ok(decision)
    }

    fn complete_locked(&self, s: &mut Session, outbox: &mut Outbox) -> Result<usize, FlowError> {
        let index = s.state.current_step_index;
        let step_id = s
            .state
            .current_step()
            .map(|step| step.id.clone())
            .unwrap_or_default();

        if let Err(message) = s.state.validate_current_fields() {
            s.state.set_step_error(index, Some(message.clone()));
            outbox.track(
                events::VALIDATION_FAILED,
                json!({"step": index, "stepName": step_id, "message": message}),
            );
            info!(session_id = %s.state.session_id, step = %step_id, "Step validation failed: {}", message);
            return Err(FlowError::FormValidation {
                step: step_id,
                message,
            });
        }

        s.state.complete_current();
        outbox.track(
            events::STEP_COMPLETED,
            json!({
                "step": index,
                "stepName": step_id,
                "completionPercentage": s.state.completion_percentage,
            }),
        );

        if s.state.is_last_step() {
            self.persist(s);
            return Ok(index);
        }
        self.move_locked(s, index + 1, outbox).map(|_| index + 1)
    }

    fn skip_locked(&self, s: &mut Session, outbox: &mut Outbox) -> Result<usize, FlowError> {
        let index = s.state.current_step_index;
        let Some(step) = s.state.current_step() else {
            return Ok(index);
        };
        if !step.optional {
            return Err(FlowError::NavigationBlocked {
                reason: format!("\"{}\" is required and cannot be skipped", step.label),
            });
        }
        let step_id = step.id.clone();

        s.state.skip_current();
        outbox.track(
            events::STEP_SKIPPED,
            json!({"step": index, "stepName": step_id}),
        );

        if s.state.is_last_step() {
            self.persist(s);
            return Ok(index);
        }
        self.move_locked(s, index + 1, outbox).map(|_| index + 1)
    }

    fn reevaluate_locked(&self, s: &mut Session, outbox: &mut Outbox) {
        if self.evaluator.is_empty() {
            return;
        }
        let next = self.evaluator.apply(&self.base_steps, &s.state.form_data);
        let changed = next.len() != s.state.steps.len()
            || next.iter().zip(&s.state.steps).any(|(a, b)| a.id != b.id);
        if !changed {
            return;
        }

        s.state.replace_steps(next);
        let step_ids: Vec<String> = s.state.steps.iter().map(|st| st.id.clone()).collect();
        debug!(session_id = %s.state.session_id, steps = ?step_ids, "Conditional steps re-evaluated");
        outbox.notify(FlowEvent::StepsUpdated { step_ids });
    }

    fn report_locked(&self, s: &Session, trigger: AbandonmentTrigger) -> AbandonmentReport {
        AbandonmentReport {
            session_id: s.state.session_id.clone(),
            trigger,
            step_index: s.state.current_step_index,
            step_id: s.state.current_step().map(|st| st.id.clone()),
            phase: s.phase,
            elapsed_seconds: s.elapsed.as_secs(),
            completion_percentage: s.state.completion_percentage,
        }
    }

    fn snapshot_of(&self, s: &Session) -> PersistedSnapshot {
        PersistedSnapshot::new(
            self.config.archetype,
            self.config.service.clone(),
            s.state.steps.clone(),
            s.state.current_step_index,
            s.state.started_at.timestamp_millis(),
        )
    }

    fn persist(&self, s: &Session) {
        if s.disposed || s.abandoned || s.phase == BookingPhase::Success {
            return;
        }
        self.persistence.save(self.snapshot_of(s));
    }

    fn track(&self, name: &str, payload: Value) {
        self.analytics
            .with_context(self.context.clone())
            .emit(name, payload);
    }

    fn flush(&self, outbox: Outbox) {
        for (name, payload) in outbox.analytics {
            self.track(name, payload);
        }
        for event in outbox.events {
            // No receivers is fine
            let _ = self.events.send(event);
        }
        for call in outbox.hooks {
            match call {
                HookCall::Success(result) => {
                    if let Some(hook) = &self.hooks.on_success {
                        hook(&result);
                    }
                }
                HookCall::Error(err) => {
                    if let Some(hook) = &self.hooks.on_error {
                        hook(&err);
                    }
                }
                HookCall::Abandon(report) => {
                    if let Some(hook) = &self.hooks.on_abandon {
                        hook(&report);
                    }
                }
            }
        }
    }

    fn lock_timers(&self) -> std::sync::MutexGuard<'_, Timers> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Timers ──────────────────────────────────────────────────────

    fn spawn_session_timers(self: &Arc<Self>, generation: u64) {
        let tick = spawn_ticker(Arc::downgrade(self), self.settings.tick_interval, generation);
        let idle = spawn_idle_watch(Arc::downgrade(self), generation);
        let mut timers = self.lock_timers();
        if let Some(old) = timers.tick.replace(tick) {
            old.abort();
        }
        if let Some(old) = timers.idle.replace(idle) {
            old.abort();
        }
    }

    fn schedule_autosave(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let delay = self.settings.autosave_debounce;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(controller) = weak.upgrade() {
                controller.flush_snapshot().await;
            }
        });
        if let Some(old) = self.lock_timers().autosave.replace(handle) {
            old.abort();
        }
    }

    async fn flush_snapshot(&self) {
        let s = self.session.read().await;
        if s.phase.is_terminal() {
            return;
        }
        self.persist(&s);
    }

    /// One elapsed-time tick. Returns false once the timer should stop.
    async fn tick(&self, generation: u64) -> bool {
        let elapsed_seconds = {
            let mut s = self.session.write().await;
            if s.disposed || s.generation != generation || s.phase.is_terminal() {
                return false;
            }
            s.elapsed += self.settings.tick_interval;
            s.elapsed.as_secs()
        };
        let _ = self.events.send(FlowEvent::Tick { elapsed_seconds });
        true
    }

    async fn idle_deadline(&self, generation: u64) -> Option<Instant> {
        let s = self.session.read().await;
        if s.disposed || s.generation != generation {
            return None;
        }
        s.tracker.deadline()
    }

    /// Poll the idle timer. Returns false once the watch should stop.
    async fn check_idle(&self, generation: u64) -> bool {
        let mut outbox = Outbox::default();
        {
            let mut s = self.session.write().await;
            if s.disposed || s.generation != generation {
                return false;
            }
            let phase = s.phase;
            match s.tracker.poll_idle(Instant::now(), phase) {
                IdlePoll::Pending(_) => return true,
                IdlePoll::Inactive => return false,
                IdlePoll::Fire => {
                    s.abandoned = true;
                    if let Some(handle) = self.lock_timers().autosave.take() {
                        handle.abort();
                    }
                    self.persistence.clear();
                    let report = self.report_locked(&s, AbandonmentTrigger::IdleTimeout);
                    info!(
                        session_id = %report.session_id,
                        step = report.step_index,
                        elapsed_seconds = report.elapsed_seconds,
                        "Booking abandoned after inactivity"
                    );
                    outbox.track(events::ABANDONED, abandonment_payload(&report));
                    outbox.notify(FlowEvent::Abandoned(report.clone()));
                    outbox.hooks.push(HookCall::Abandon(report));
                }
            }
        }
        self.flush(outbox);
        false
    }
}

impl Drop for FlowController {
    fn drop(&mut self) {
        self.timers
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
    }
}

fn ensure_live(s: &Session) -> Result<(), FlowError> {
    if s.disposed {
        return Err(FlowError::Disposed);
    }
    Ok(())
}

/// Navigation and form edits are refused while submitting and after the
/// session has ended.
fn ensure_interactive(s: &Session) -> Result<(), FlowError> {
    ensure_live(s)?;
    if s.phase == BookingPhase::Submitting {
        return Err(FlowError::SubmissionInProgress);
    }
    if s.phase.is_terminal() {
        return Err(FlowError::Terminal { phase: s.phase });
    }
    Ok(())
}

fn abandonment_payload(report: &AbandonmentReport) -> Value {
    json!({
        "trigger": report.trigger,
        "step": report.step_index,
        "stepName": report.step_id,
        "phase": report.phase,
        "elapsedSeconds": report.elapsed_seconds,
        "completionPercentage": report.completion_percentage,
    })
}

fn spawn_ticker(weak: Weak<FlowController>, period: Duration, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        loop {
            interval.tick().await;
            let Some(controller) = weak.upgrade() else {
                break;
            };
            if !controller.tick(generation).await {
                break;
            }
        }
    })
}

fn spawn_idle_watch(weak: Weak<FlowController>, generation: u64) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let deadline = match weak.upgrade() {
                Some(controller) => controller.idle_deadline(generation).await,
                None => return,
            };
            let Some(deadline) = deadline else {
                return;
            };
            tokio::time::sleep_until(deadline).await;

            let Some(controller) = weak.upgrade() else {
                return;
            };
            if !controller.check_idle(generation).await {
                return;
            }
        }
    })
}
