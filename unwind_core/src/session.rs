//! Exercise session manager.
//!
//! Single authority over one guided exercise: stage progression, ratings,
//! local draft persistence, debounced remote sync, analytics and the
//! completion/abandonment accounting.
//!
//! ## Failure model
//!
//! - A missing identity at [`ExerciseSessionManager::initialize`] is the only
//!   blocking error. It is returned and also kept as [`error`] so a screen
//!   can offer a retry.
//! - Remote log failures are logged and swallowed. A session without a
//!   `log_id` keeps working locally.
//! - Mutators never return errors. Calling one without a live session, or
//!   advancing past the last stage, is logged and ignored.
//!
//! [`error`]: ExerciseSessionManager::error

use crate::analytics::{AnalyticsEvent, AnalyticsSink, Properties};
use crate::rating::{self, RatingChange};
use crate::remote::{AbandonRecord, CompletionRecord, ProgressRecord, RemoteLogStore, StartRecord};
use crate::storage::DraftStore;
use crate::timing::{Clock, Debouncer, SessionTimers, TimerSettings};
use crate::{
    CompletionStatus, Error, ExerciseData, ExerciseDefinition, ExerciseSession, Identity, Result,
    Stage, Trigger, TriggerCategory,
};
use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use uuid::Uuid;

/// Callback invoked with the final session on a terminal transition
pub type SessionCallback = Box<dyn FnMut(&ExerciseSession)>;

/// What the caller (a screen, the CLI) configures the manager with
pub struct SessionOptions {
    pub definition: ExerciseDefinition,
    pub module_context: Option<String>,
    pub module_screen: Option<String>,
    pub device_type: String,
    pub on_complete: Option<SessionCallback>,
    pub on_abandon: Option<SessionCallback>,
}

impl SessionOptions {
    pub fn new(definition: ExerciseDefinition) -> Self {
        Self {
            definition,
            module_context: None,
            module_screen: None,
            device_type: "unknown".into(),
            on_complete: None,
            on_abandon: None,
        }
    }

    pub fn module_context(mut self, context: impl Into<String>) -> Self {
        self.module_context = Some(context.into());
        self
    }

    pub fn module_screen(mut self, screen: impl Into<String>) -> Self {
        self.module_screen = Some(screen.into());
        self
    }

    pub fn device_type(mut self, device_type: impl Into<String>) -> Self {
        self.device_type = device_type.into();
        self
    }

    pub fn on_complete(mut self, f: impl FnMut(&ExerciseSession) + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn on_abandon(mut self, f: impl FnMut(&ExerciseSession) + 'static) -> Self {
        self.on_abandon = Some(Box::new(f));
        self
    }
}

/// External services the manager talks to
pub struct Collaborators {
    pub drafts: Box<dyn DraftStore>,
    pub log_store: Box<dyn RemoteLogStore>,
    pub analytics: Box<dyn AnalyticsSink>,
    pub clock: Arc<dyn Clock>,
}

pub struct ExerciseSessionManager {
    definition: ExerciseDefinition,
    module_context: Option<String>,
    module_screen: Option<String>,
    device_type: String,
    on_complete: Option<SessionCallback>,
    on_abandon: Option<SessionCallback>,

    drafts: Box<dyn DraftStore>,
    log_store: Box<dyn RemoteLogStore>,
    analytics: Box<dyn AnalyticsSink>,
    clock: Arc<dyn Clock>,

    timers: SessionTimers,
    remote_sync: Debouncer,

    session: Option<ExerciseSession>,
    is_loading: bool,
    error: Option<String>,
}

impl ExerciseSessionManager {
    pub fn new(options: SessionOptions, collaborators: Collaborators, timers: TimerSettings) -> Self {
        let now = collaborators.clock.now();
        Self {
            definition: options.definition,
            module_context: options.module_context,
            module_screen: options.module_screen,
            device_type: options.device_type,
            on_complete: options.on_complete,
            on_abandon: options.on_abandon,
            drafts: collaborators.drafts,
            log_store: collaborators.log_store,
            analytics: collaborators.analytics,
            clock: collaborators.clock,
            timers: SessionTimers::new(timers, now),
            remote_sync: Debouncer::new(
                i64::try_from(timers.remote_sync_debounce_ms)
                    .ok()
                    .and_then(Duration::try_milliseconds)
                    .unwrap_or(Duration::MAX),
            ),
            session: None,
            is_loading: true,
            error: None,
        }
    }

    pub fn session(&self) -> Option<&ExerciseSession> {
        self.session.as_ref()
    }

    pub fn definition(&self) -> &ExerciseDefinition {
        &self.definition
    }

    pub fn is_loading(&self) -> bool {
        self.is_loading
    }

    /// Error message surfaced by the last failed `initialize`
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    // ========================================================================
    // Initialization
    // ========================================================================

    /// Restore a matching draft or start a fresh session.
    ///
    /// Calling this again while a live session exists returns that session
    /// without side effects. After a terminal transition it starts over.
    pub fn initialize(&mut self, identity: Option<&Identity>) -> Result<&ExerciseSession> {
        let live = self
            .session
            .as_ref()
            .is_some_and(|s| !s.completion_status.is_terminal());
        if live {
            tracing::debug!("Session already initialized, ignoring repeat initialize");
            return self
                .session
                .as_ref()
                .ok_or_else(|| Error::Session("session vanished".into()));
        }

        self.is_loading = true;
        self.error = None;

        let identity = match identity {
            Some(identity) if !identity.user_id.trim().is_empty() => identity,
            _ => {
                tracing::error!(
                    "Cannot start {}: no authenticated user",
                    self.definition.exercise_type
                );
                self.is_loading = false;
                self.error = Some("Exercise failed to start: please sign in and try again".into());
                return Err(Error::NotAuthenticated);
            }
        };

        match self.restore_or_create(identity) {
            Ok(session) => {
                let now = self.clock.now();
                self.timers.reset(now);
                self.remote_sync.cancel();
                self.session = Some(session);
                self.is_loading = false;
                self.session
                    .as_ref()
                    .ok_or_else(|| Error::Session("session vanished".into()))
            }
            Err(e) => {
                tracing::error!("Failed to initialize {}: {}", self.definition.exercise_type, e);
                self.is_loading = false;
                self.error = Some(format!("Exercise failed to start: {}", e));
                Err(e)
            }
        }
    }

    fn restore_or_create(&mut self, identity: &Identity) -> Result<ExerciseSession> {
        match self.drafts.load()? {
            Some(draft) if self.is_resumable(&draft, identity) => {
                tracing::info!(
                    "Resuming {} session {} at stage {}",
                    draft.exercise_type,
                    draft.session_id,
                    draft.current_stage
                );
                let mut props = base_properties(&draft);
                props.insert("current_step".into(), json!(draft.progress.current_step()));
                self.analytics.track(AnalyticsEvent::ExerciseResumed, props);
                return Ok(draft);
            }
            Some(draft) => {
                tracing::info!(
                    "Discarding {} draft {} ({})",
                    draft.exercise_type,
                    draft.session_id,
                    draft.completion_status.as_str()
                );
                if let Err(e) = self.drafts.clear() {
                    tracing::warn!("Failed to clear stale draft: {}", e);
                }
            }
            None => {}
        }

        let now = self.clock.now();
        let stage = self.definition.initial_stage();
        let mut session = ExerciseSession {
            session_id: Uuid::new_v4(),
            user_id: identity.user_id.clone(),
            exercise_type: self.definition.exercise_type,
            module_context: self.module_context.clone(),
            module_screen: self.module_screen.clone(),
            current_stage: stage,
            completion_status: CompletionStatus::InProgress,
            pre_rating: None,
            post_rating: None,
            exercise_data: ExerciseData::empty(self.definition.exercise_type),
            trigger: None,
            progress: self.definition.progress_at(stage),
            current_stage_duration: 0,
            total_duration: 0,
            is_paused: false,
            log_id: None,
            started_at: now,
            completed_at: None,
        };

        self.drafts.save(&session)?;
        tracing::info!(
            "Started {} session {} at stage {}",
            session.exercise_type,
            session.session_id,
            stage
        );
        self.analytics
            .track(AnalyticsEvent::ExerciseStarted, base_properties(&session));

        let record = StartRecord {
            user_id: session.user_id.clone(),
            exercise_type: session.exercise_type,
            exercise_name: self.definition.title.clone(),
            module_context: session.module_context.clone(),
            module_screen: session.module_screen.clone(),
            device_type: self.device_type.clone(),
        };
        match self.log_store.start_exercise(&record) {
            Ok(log_id) => {
                tracing::debug!("Opened remote log {} for {}", log_id, session.session_id);
                session.log_id = Some(log_id);
                if let Err(e) = self.drafts.save(&session) {
                    tracing::warn!("Failed to persist log id for {}: {}", session.session_id, e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Remote log unavailable for {}, continuing locally: {}",
                    session.session_id,
                    e
                );
            }
        }

        Ok(session)
    }

    /// Whether `initialize` would restore `draft` for `identity`.
    ///
    /// Only `in_progress` drafts qualify; abandoned drafts are deliberately
    /// not restored, same as completed ones.
    pub fn is_resumable(&self, draft: &ExerciseSession, identity: &Identity) -> bool {
        draft.exercise_type == self.definition.exercise_type
            && draft.completion_status == CompletionStatus::InProgress
            && draft.user_id == identity.user_id
            && self.definition.contains(draft.current_stage)
    }

    // ========================================================================
    // Mutators
    // ========================================================================

    /// Apply one mutation: update, persist, track.
    ///
    /// `update` must not touch the session when it returns `Err`.
    fn apply<F>(&mut self, action: &str, update: F) -> bool
    where
        F: FnOnce(
            &mut ExerciseSession,
            &ExerciseDefinition,
            DateTime<Utc>,
        ) -> std::result::Result<(AnalyticsEvent, Properties), String>,
    {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            tracing::error!("{} called with no active session", action);
            return false;
        };
        if session.completion_status.is_terminal() {
            tracing::error!(
                "{} called on {} session {}",
                action,
                session.completion_status.as_str(),
                session.session_id
            );
            return false;
        }

        let (event, props) = match update(session, &self.definition, now) {
            Ok(outcome) => outcome,
            Err(reason) => {
                tracing::error!("{} ignored for {}: {}", action, session.session_id, reason);
                return false;
            }
        };

        if let Err(e) = self.drafts.save(session) {
            tracing::error!("Failed to persist draft after {}: {}", action, e);
        }
        self.analytics.track(event, props);
        true
    }

    /// Move to the next stage. Returns the new stage, or `None` if there
    /// was nothing to advance.
    pub fn advance_stage(&mut self) -> Option<Stage> {
        let advanced = self.apply("advance_stage", |session, def, _| {
            let from = session.current_stage;
            let next = def
                .next_stage(from)
                .ok_or_else(|| format!("already at last stage {}", from))?;

            session.current_stage = next;
            session.current_stage_duration = 0;
            session.progress = def.progress_at(next);

            let mut props = base_properties(session);
            props.insert("from_stage".into(), json!(from.as_str()));
            props.insert("to_stage".into(), json!(next.as_str()));
            props.insert("current_step".into(), json!(session.progress.current_step()));
            props.insert("total_steps".into(), json!(session.progress.total_steps()));
            Ok((AnalyticsEvent::ExerciseStageAdvanced, props))
        });

        if advanced {
            self.timers.reset(self.clock.now());
            self.session.as_ref().map(|s| s.current_stage)
        } else {
            None
        }
    }

    pub fn set_pre_rating(&mut self, rating: i32) -> bool {
        warn_off_scale("pre", rating);
        self.apply("set_pre_rating", |session, _, _| {
            session.pre_rating = Some(rating);

            let mut props = base_properties(session);
            props.insert("rating".into(), json!(rating));
            Ok((AnalyticsEvent::ExercisePreRatingSet, props))
        })
    }

    /// Store the post-exercise rating and report the change against the
    /// pre-rating. The change itself is not stored.
    pub fn set_post_rating(&mut self, rating: i32) -> bool {
        warn_off_scale("post", rating);
        self.apply("set_post_rating", |session, _, _| {
            session.post_rating = Some(rating);
            let change = RatingChange::between(session.pre_rating, rating);

            let mut props = base_properties(session);
            props.insert("rating".into(), json!(rating));
            props.insert("pre_rating".into(), json!(session.pre_rating));
            props.insert("anxiety_reduction".into(), json!(change.reduction));
            props.insert(
                "reduction_percentage".into(),
                json!(change.reduction_percentage),
            );
            Ok((AnalyticsEvent::ExercisePostRatingSet, props))
        })
    }

    /// Attach trigger context. Does not advance the stage.
    pub fn log_trigger(&mut self, category: TriggerCategory, note: Option<String>) -> bool {
        let note = note.filter(|n| !n.trim().is_empty());
        let logged = self.apply("log_trigger", |session, _, now| {
            let mut props = base_properties(session);
            props.insert("trigger_category".into(), json!(category.as_str()));
            props.insert("has_note".into(), json!(note.is_some()));

            session.trigger = Some(Trigger {
                category,
                note,
                logged_at: now,
            });
            Ok((AnalyticsEvent::ExerciseTriggerLogged, props))
        });
        if logged {
            self.remote_sync.schedule(self.clock.now());
        }
        logged
    }

    /// Shallow-merge `partial` into the exercise payload
    pub fn update_exercise_data(&mut self, partial: &Map<String, Value>) -> bool {
        let updated = self.apply("update_exercise_data", |session, _, _| {
            session
                .exercise_data
                .merge(partial)
                .map_err(|e| e.to_string())?;

            let mut props = base_properties(session);
            let fields: Vec<&str> = partial
                .keys()
                .map(String::as_str)
                .filter(|k| *k != "type")
                .collect();
            props.insert("fields".into(), json!(fields));
            Ok((AnalyticsEvent::ExerciseDataUpdated, props))
        });
        if updated {
            self.remote_sync.schedule(self.clock.now());
        }
        updated
    }

    pub fn pause(&mut self) -> bool {
        self.set_paused(true)
    }

    pub fn resume(&mut self) -> bool {
        self.set_paused(false)
    }

    fn set_paused(&mut self, paused: bool) -> bool {
        if self.session.as_ref().is_some_and(|s| s.is_paused == paused) {
            tracing::debug!("Session already {}", if paused { "paused" } else { "running" });
            return false;
        }

        let (action, event) = if paused {
            ("pause", AnalyticsEvent::ExercisePaused)
        } else {
            ("resume", AnalyticsEvent::ExerciseUnpaused)
        };
        let flipped = self.apply(action, |session, _, _| {
            session.is_paused = paused;
            let mut props = base_properties(session);
            props.insert("total_duration".into(), json!(session.total_duration));
            Ok((event, props))
        });

        if flipped {
            self.timers.reset(self.clock.now());
        }
        flipped
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Drive the session timers.
    ///
    /// Adds elapsed whole ticks to both duration counters (unless paused),
    /// performs the periodic safety save, and pushes debounced edits to the
    /// log store once their quiet period has passed.
    pub fn poll(&mut self) {
        let now = self.clock.now();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.completion_status.is_terminal() {
            return;
        }

        if !session.is_paused {
            let secs = self.timers.take_elapsed_ticks(now);
            session.current_stage_duration += secs;
            session.total_duration += secs;
        }

        if self.timers.take_autosave(now) {
            if let Err(e) = self.drafts.save(session) {
                tracing::warn!("Safety save failed for {}: {}", session.session_id, e);
            }
        }

        if self.remote_sync.take_due(now) {
            self.sync_progress();
        }
    }

    /// Persist the draft and push any pending edits right away.
    ///
    /// Called when the owning screen goes away without finishing.
    pub fn flush(&mut self) {
        self.poll();
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.completion_status.is_terminal() {
            return;
        }
        if let Err(e) = self.drafts.save(session) {
            tracing::warn!("Flush failed for {}: {}", session.session_id, e);
        }
        if self.remote_sync.take_pending() {
            self.sync_progress();
        }
    }

    fn sync_progress(&mut self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let Some(log_id) = session.log_id.as_ref() else {
            tracing::debug!("No log id for {}, skipping progress sync", session.session_id);
            return;
        };
        let record = ProgressRecord {
            current_stage: session.current_stage,
            percentage: session.progress.percentage(),
            exercise_data: session.exercise_data.clone(),
        };
        if let Err(e) = self.log_store.sync_progress(log_id, &record) {
            tracing::warn!("Progress sync failed for {}: {}", session.session_id, e);
        }
    }

    // ========================================================================
    // Terminal operations
    // ========================================================================

    /// Mark the session completed, push the completion record (best effort),
    /// clear the draft and invoke `on_complete`.
    pub fn complete(&mut self) -> bool {
        let now = self.clock.now();
        let Some(session) = live_session(&mut self.session, "complete") else {
            return false;
        };

        session.completion_status = CompletionStatus::Completed;
        session.completed_at = Some(now);
        session.total_duration = wall_clock_seconds(session.started_at, now);
        self.remote_sync.cancel();

        let remote_synced = match session.log_id.as_ref() {
            Some(log_id) => {
                let record = CompletionRecord {
                    completed_at: now,
                    duration_seconds: session.total_duration,
                    post_rating: session.post_rating,
                    completion_status: CompletionStatus::Completed,
                    exercise_data: session.exercise_data.clone(),
                };
                match self.log_store.complete_exercise(log_id, &record) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Failed to record completion of {}: {}", session.session_id, e);
                        false
                    }
                }
            }
            None => {
                tracing::warn!(
                    "No remote log for {}, completion recorded locally only",
                    session.session_id
                );
                false
            }
        };

        let mut props = base_properties(session);
        props.insert("duration_seconds".into(), json!(session.total_duration));
        props.insert("pre_rating".into(), json!(session.pre_rating));
        props.insert("post_rating".into(), json!(session.post_rating));
        if let Some(post) = session.post_rating {
            let change = RatingChange::between(session.pre_rating, post);
            props.insert("anxiety_reduction".into(), json!(change.reduction));
            props.insert(
                "reduction_percentage".into(),
                json!(change.reduction_percentage),
            );
        }
        props.insert("has_trigger".into(), json!(session.trigger.is_some()));
        props.insert("remote_synced".into(), json!(remote_synced));
        props.insert("remote_log_degraded".into(), json!(!remote_synced));
        self.analytics.track(AnalyticsEvent::ExerciseCompleted, props);

        if let Err(e) = self.drafts.clear() {
            tracing::error!("Failed to clear draft for {}: {}", session.session_id, e);
        }

        tracing::info!(
            "Completed {} session {} in {}s",
            session.exercise_type,
            session.session_id,
            session.total_duration
        );

        if let Some(callback) = self.on_complete.as_mut() {
            callback(&*session);
        }
        true
    }

    /// Mark the session abandoned, record the progress reached (best
    /// effort), clear the draft and invoke `on_abandon`.
    pub fn abandon(&mut self) -> bool {
        let now = self.clock.now();
        let Some(session) = live_session(&mut self.session, "abandon") else {
            return false;
        };

        session.completion_status = CompletionStatus::Abandoned;
        session.total_duration = wall_clock_seconds(session.started_at, now);
        self.remote_sync.cancel();

        let percentage = session.progress.percentage();
        let remote_synced = match session.log_id.as_ref() {
            Some(log_id) => {
                let record = AbandonRecord {
                    completion_status: CompletionStatus::Abandoned,
                    duration_seconds: session.total_duration,
                    abandoned_at_percentage: percentage,
                };
                match self.log_store.abandon_exercise(log_id, &record) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::warn!("Failed to record abandonment of {}: {}", session.session_id, e);
                        false
                    }
                }
            }
            None => {
                tracing::warn!(
                    "No remote log for {}, abandonment recorded locally only",
                    session.session_id
                );
                false
            }
        };

        let mut props = base_properties(session);
        props.insert("duration_seconds".into(), json!(session.total_duration));
        props.insert("abandoned_at_percentage".into(), json!(percentage));
        props.insert("remote_synced".into(), json!(remote_synced));
        props.insert("remote_log_degraded".into(), json!(!remote_synced));
        self.analytics.track(AnalyticsEvent::ExerciseAbandoned, props);

        if let Err(e) = self.drafts.clear() {
            tracing::error!("Failed to clear draft for {}: {}", session.session_id, e);
        }

        tracing::info!(
            "Abandoned {} session {} at {}%",
            session.exercise_type,
            session.session_id,
            percentage
        );

        if let Some(callback) = self.on_abandon.as_mut() {
            callback(&*session);
        }
        true
    }
}

fn live_session<'a>(
    slot: &'a mut Option<ExerciseSession>,
    action: &str,
) -> Option<&'a mut ExerciseSession> {
    match slot.as_mut() {
        None => {
            tracing::error!("{} called with no active session", action);
            None
        }
        Some(session) if session.completion_status.is_terminal() => {
            tracing::error!(
                "{} called on {} session {}",
                action,
                session.completion_status.as_str(),
                session.session_id
            );
            None
        }
        Some(session) => Some(session),
    }
}

fn base_properties(session: &ExerciseSession) -> Properties {
    let mut props = Properties::new();
    props.insert("session_id".into(), json!(session.session_id.to_string()));
    props.insert("exercise_type".into(), json!(session.exercise_type.as_str()));
    props.insert("stage".into(), json!(session.current_stage.as_str()));
    props.insert(
        "progress_percentage".into(),
        json!(session.progress.percentage()),
    );
    if let Some(context) = &session.module_context {
        props.insert("module_context".into(), json!(context));
    }
    if let Some(screen) = &session.module_screen {
        props.insert("module_screen".into(), json!(screen));
    }
    props
}

fn wall_clock_seconds(started_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (now - started_at).num_seconds().max(0) as u64
}

fn warn_off_scale(which: &str, rating: i32) {
    if !rating::is_on_scale(rating) {
        tracing::warn!(
            "{}-rating {} outside {}..={}",
            which,
            rating,
            rating::RATING_MIN,
            rating::RATING_MAX
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::RecordingAnalytics;
    use crate::catalog::get_default_catalog;
    use crate::remote::{LogEntry, OfflineLogStore};
    use crate::storage::MemoryDraftStore;
    use crate::timing::ManualClock;
    use crate::{DefinitionFlags, ExerciseType, LogId};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Log store that records calls and can be told to fail
    #[derive(Clone, Default)]
    struct FakeLogStore {
        calls: Rc<RefCell<Vec<LogEntry>>>,
        fail: bool,
    }

    impl FakeLogStore {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<LogEntry> {
            self.calls.borrow().clone()
        }

        fn check(&self) -> Result<()> {
            if self.fail {
                Err(Error::Remote("connection refused".into()))
            } else {
                Ok(())
            }
        }
    }

    impl RemoteLogStore for FakeLogStore {
        fn start_exercise(&mut self, record: &StartRecord) -> Result<LogId> {
            self.check()?;
            let log_id = LogId(format!("log-{}", self.calls.borrow().len() + 1));
            self.calls.borrow_mut().push(LogEntry::Started {
                log_id: log_id.clone(),
                recorded_at: Utc::now(),
                record: record.clone(),
            });
            Ok(log_id)
        }

        fn complete_exercise(&mut self, log_id: &LogId, record: &CompletionRecord) -> Result<()> {
            self.check()?;
            self.calls.borrow_mut().push(LogEntry::Completed {
                log_id: log_id.clone(),
                recorded_at: Utc::now(),
                record: record.clone(),
            });
            Ok(())
        }

        fn abandon_exercise(&mut self, log_id: &LogId, record: &AbandonRecord) -> Result<()> {
            self.check()?;
            self.calls.borrow_mut().push(LogEntry::Abandoned {
                log_id: log_id.clone(),
                recorded_at: Utc::now(),
                record: record.clone(),
            });
            Ok(())
        }

        fn sync_progress(&mut self, log_id: &LogId, record: &ProgressRecord) -> Result<()> {
            self.check()?;
            self.calls.borrow_mut().push(LogEntry::Progress {
                log_id: log_id.clone(),
                recorded_at: Utc::now(),
                record: record.clone(),
            });
            Ok(())
        }
    }

    struct Harness {
        drafts: MemoryDraftStore,
        analytics: RecordingAnalytics,
        clock: ManualClock,
        completed: Rc<RefCell<Vec<ExerciseSession>>>,
        abandoned: Rc<RefCell<Vec<ExerciseSession>>>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                drafts: MemoryDraftStore::new(),
                analytics: RecordingAnalytics::new(),
                clock: ManualClock::default(),
                completed: Rc::default(),
                abandoned: Rc::default(),
            }
        }

        fn manager(
            &self,
            definition: ExerciseDefinition,
            log_store: impl RemoteLogStore + 'static,
        ) -> ExerciseSessionManager {
            let completed = Rc::clone(&self.completed);
            let abandoned = Rc::clone(&self.abandoned);
            let options = SessionOptions::new(definition)
                .module_context("anxiety_basics")
                .module_screen("lesson_2")
                .device_type("test")
                .on_complete(move |s| completed.borrow_mut().push(s.clone()))
                .on_abandon(move |s| abandoned.borrow_mut().push(s.clone()));
            ExerciseSessionManager::new(
                options,
                Collaborators {
                    drafts: Box::new(self.drafts.clone()),
                    log_store: Box::new(log_store),
                    analytics: Box::new(self.analytics.clone()),
                    clock: Arc::new(self.clock.clone()),
                },
                TimerSettings::default(),
            )
        }
    }

    fn definition(exercise_type: ExerciseType) -> ExerciseDefinition {
        get_default_catalog().get(exercise_type).cloned().unwrap()
    }

    fn user() -> Identity {
        Identity::new("user-1")
    }

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn stored(h: &Harness) -> ExerciseSession {
        h.drafts.load().unwrap().expect("draft should be stored")
    }

    #[test]
    fn test_worked_example_scenario() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), log_store.clone());

        let session = manager.initialize(Some(&user())).unwrap();
        assert_eq!(session.current_stage, Stage::PreRating);
        assert_eq!(session.progress.current_step(), 1);
        assert_eq!(session.progress.percentage(), 20);
        assert!(!manager.is_loading());

        assert!(manager.set_pre_rating(7));
        assert_eq!(manager.advance_stage(), Some(Stage::Instructions));
        assert_eq!(manager.session().unwrap().progress.percentage(), 40);

        assert_eq!(manager.advance_stage(), Some(Stage::Exercise));
        assert_eq!(manager.session().unwrap().progress.percentage(), 60);

        assert!(manager.update_exercise_data(&object(serde_json::json!({ "word_count": 42 }))));
        assert_eq!(manager.advance_stage(), Some(Stage::PostRating));
        assert_eq!(manager.session().unwrap().progress.percentage(), 80);

        assert!(manager.set_post_rating(4));
        let post = h.analytics.last(AnalyticsEvent::ExercisePostRatingSet).unwrap();
        assert_eq!(post.property("anxiety_reduction"), Some(&json!(3)));
        assert_eq!(post.property("reduction_percentage"), Some(&json!(43)));

        h.clock.advance_secs(120);
        assert!(manager.complete());

        assert!(h.drafts.is_empty());
        assert_eq!(h.completed.borrow().len(), 1);
        let done = &h.completed.borrow()[0];
        assert_eq!(done.completion_status, CompletionStatus::Completed);
        assert_eq!(done.total_duration, 120);
        assert_eq!(
            done.exercise_data,
            ExerciseData::BrainDump {
                entries: vec![],
                word_count: 42
            }
        );

        let completed = h.analytics.last(AnalyticsEvent::ExerciseCompleted).unwrap();
        assert_eq!(completed.property("anxiety_reduction"), Some(&json!(3)));
        assert_eq!(completed.property("reduction_percentage"), Some(&json!(43)));
        assert_eq!(completed.property("remote_log_degraded"), Some(&json!(false)));

        let calls = log_store.calls();
        assert!(matches!(calls.first(), Some(LogEntry::Started { .. })));
        match calls.last() {
            Some(LogEntry::Completed { record, .. }) => {
                assert_eq!(record.duration_seconds, 120);
                assert_eq!(record.post_rating, Some(4));
            }
            other => panic!("expected completion record, got {:?}", other),
        }
    }

    #[test]
    fn test_resume_restores_draft_verbatim() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();

        let mut first = h.manager(definition(ExerciseType::EmotionWheel), log_store.clone());
        first.initialize(Some(&user())).unwrap();
        first.set_pre_rating(6);
        first.advance_stage();
        first.update_exercise_data(&object(json!({ "primary_emotion": "fear" })));
        let original = first.session().cloned().unwrap();
        drop(first);

        let mut second = h.manager(definition(ExerciseType::EmotionWheel), log_store.clone());
        let restored = second.initialize(Some(&user())).unwrap().clone();

        assert_eq!(restored, original);
        assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseResumed), 1);
        assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseStarted), 1);
        assert_eq!(log_store.calls().len(), 1, "resume must not open a new log row");
    }

    #[test]
    fn test_draft_of_other_type_is_discarded() {
        let h = Harness::new();

        let mut first = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        let first_id = first.initialize(Some(&user())).unwrap().session_id;

        let mut second = h.manager(definition(ExerciseType::MindClear), OfflineLogStore);
        let second = second.initialize(Some(&user())).unwrap().clone();

        assert_ne!(second.session_id, first_id);
        assert_eq!(second.exercise_type, ExerciseType::MindClear);
        assert_eq!(stored(&h).session_id, second.session_id);
        assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseResumed), 0);
    }

    #[test]
    fn test_completed_draft_is_not_restored() {
        let h = Harness::new();

        let mut first = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        first.initialize(Some(&user())).unwrap();
        let mut draft = first.session().cloned().unwrap();
        draft.completion_status = CompletionStatus::Completed;
        h.drafts.save(&draft).unwrap();

        let mut second = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        let fresh = second.initialize(Some(&user())).unwrap();
        assert_ne!(fresh.session_id, draft.session_id);
        assert_eq!(fresh.completion_status, CompletionStatus::InProgress);
    }

    #[test]
    fn test_abandoned_draft_is_not_restored() {
        let h = Harness::new();

        let mut first = h.manager(definition(ExerciseType::EmotionWheel), OfflineLogStore);
        first.initialize(Some(&user())).unwrap();
        let mut draft = first.session().cloned().unwrap();
        draft.completion_status = CompletionStatus::Abandoned;
        h.drafts.save(&draft).unwrap();

        let mut second = h.manager(definition(ExerciseType::EmotionWheel), OfflineLogStore);
        assert!(!second.is_resumable(&draft, &user()));
        let fresh = second.initialize(Some(&user())).unwrap();
        assert_ne!(fresh.session_id, draft.session_id);
        assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseResumed), 0);
    }

    #[test]
    fn test_is_resumable_checks_user_and_type() {
        let h = Harness::new();
        let mut first = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        first.initialize(Some(&user())).unwrap();
        let draft = first.session().cloned().unwrap();

        let same = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        assert!(same.is_resumable(&draft, &user()));
        assert!(!same.is_resumable(&draft, &Identity::new("user-2")));

        let other_type = h.manager(definition(ExerciseType::Grounding), OfflineLogStore);
        assert!(!other_type.is_resumable(&draft, &user()));
    }

    #[test]
    fn test_draft_of_other_user_is_not_restored() {
        let h = Harness::new();

        let mut first = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        let first_id = first.initialize(Some(&user())).unwrap().session_id;

        let mut second = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        let other = second.initialize(Some(&Identity::new("user-2"))).unwrap();
        assert_ne!(other.session_id, first_id);
        assert_eq!(other.user_id, "user-2");
    }

    #[test]
    fn test_stages_visited_in_order_with_exact_progress() {
        for def in get_default_catalog().exercises.values() {
            let h = Harness::new();
            let mut manager = h.manager(def.clone(), OfflineLogStore);
            manager.initialize(Some(&user())).unwrap();

            let total = def.stages.len() as f64;
            let start = def.position(def.initial_stage()).unwrap();
            let mut visited = vec![manager.session().unwrap().current_stage];
            let mut n = 0;
            while let Some(stage) = manager.advance_stage() {
                n += 1;
                visited.push(stage);
                let expected = (100.0 * (1 + start + n) as f64 / total).round() as u32;
                assert_eq!(manager.session().unwrap().progress.percentage(), expected);
                assert_eq!(manager.session().unwrap().current_stage_duration, 0);
            }

            assert_eq!(visited, def.stages[start..].to_vec(), "{}", def.exercise_type);
            assert_eq!(manager.session().unwrap().current_stage, Stage::Complete);

            let advanced = h.analytics.count(AnalyticsEvent::ExerciseStageAdvanced);
            assert_eq!(manager.advance_stage(), None);
            assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseStageAdvanced), advanced);
        }
    }

    #[test]
    fn test_post_rating_without_pre_rating() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BoxBreathing), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        manager.set_post_rating(3);
        let event = h.analytics.last(AnalyticsEvent::ExercisePostRatingSet).unwrap();
        assert_eq!(event.property("anxiety_reduction"), Some(&json!(0)));
        assert_eq!(event.property("reduction_percentage"), Some(&json!(0)));
    }

    #[test]
    fn test_reduction_rounds_half_up() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        manager.set_pre_rating(8);
        manager.set_post_rating(3);
        let event = h.analytics.last(AnalyticsEvent::ExercisePostRatingSet).unwrap();
        assert_eq!(event.property("anxiety_reduction"), Some(&json!(5)));
        assert_eq!(event.property("reduction_percentage"), Some(&json!(63)));
    }

    #[test]
    fn test_complete_clears_draft_and_next_start_is_fresh() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::MindClear), FakeLogStore::default());
        let first_id = manager.initialize(Some(&user())).unwrap().session_id;
        assert!(manager.complete());
        assert!(h.drafts.is_empty());

        let mut next = h.manager(definition(ExerciseType::MindClear), FakeLogStore::default());
        let next_id = next.initialize(Some(&user())).unwrap().session_id;
        assert_ne!(next_id, first_id);
    }

    #[test]
    fn test_abandon_records_progress_and_clears_draft() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), log_store.clone());
        let first_id = manager.initialize(Some(&user())).unwrap().session_id;
        manager.advance_stage();
        manager.advance_stage();

        h.clock.advance_secs(45);
        assert!(manager.abandon());

        assert!(h.drafts.is_empty());
        assert_eq!(h.abandoned.borrow().len(), 1);
        assert!(h.completed.borrow().is_empty());
        match log_store.calls().last() {
            Some(LogEntry::Abandoned { record, .. }) => {
                assert_eq!(record.abandoned_at_percentage, 60);
                assert_eq!(record.duration_seconds, 45);
            }
            other => panic!("expected abandon record, got {:?}", other),
        }

        // same manager may start over after a terminal transition
        let again = manager.initialize(Some(&user())).unwrap().session_id;
        assert_ne!(again, first_id);
    }

    #[test]
    fn test_degraded_remote_never_blocks() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::Grounding), FakeLogStore::failing());

        let session = manager.initialize(Some(&user())).unwrap();
        assert!(session.log_id.is_none());

        assert!(manager.set_pre_rating(9));
        assert!(manager.advance_stage().is_some());
        assert!(manager.update_exercise_data(&object(json!({ "seen": ["lamp", "window"] }))));
        assert!(manager.log_trigger(TriggerCategory::Work, Some("inbox".into())));
        h.clock.advance_secs(5);
        manager.poll();
        assert!(manager.set_post_rating(5));
        assert!(manager.complete());

        assert!(h.drafts.is_empty());
        assert_eq!(h.completed.borrow().len(), 1);
        let completed = h.analytics.last(AnalyticsEvent::ExerciseCompleted).unwrap();
        assert_eq!(completed.property("remote_log_degraded"), Some(&json!(true)));
        assert_eq!(completed.property("remote_synced"), Some(&json!(false)));
    }

    #[test]
    fn test_degraded_remote_abandon_still_fires_callback() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        assert!(manager.abandon());
        assert!(h.drafts.is_empty());
        assert_eq!(h.abandoned.borrow().len(), 1);
        let event = h.analytics.last(AnalyticsEvent::ExerciseAbandoned).unwrap();
        assert_eq!(event.property("remote_log_degraded"), Some(&json!(true)));
    }

    #[test]
    fn test_pause_freezes_duration() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BoxBreathing), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        assert!(manager.pause());
        for _ in 0..10 {
            h.clock.advance_secs(1);
            manager.poll();
        }
        let session = manager.session().unwrap();
        assert_eq!(session.current_stage_duration, 0);
        assert_eq!(session.total_duration, 0);

        assert!(manager.resume());
        for _ in 0..10 {
            h.clock.advance_secs(1);
            manager.poll();
        }
        let session = manager.session().unwrap();
        assert_eq!(session.current_stage_duration, 10);
        assert_eq!(session.total_duration, 10);
    }

    #[test]
    fn test_pause_twice_is_a_noop() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BoxBreathing), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        assert!(manager.pause());
        assert!(!manager.pause());
        assert_eq!(h.analytics.count(AnalyticsEvent::ExercisePaused), 1);
        assert!(stored(&h).is_paused);
    }

    #[test]
    fn test_stage_duration_resets_on_advance() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        h.clock.advance_secs(3);
        manager.poll();
        manager.advance_stage();
        h.clock.advance_secs(2);
        manager.poll();

        let session = manager.session().unwrap();
        assert_eq!(session.current_stage_duration, 2);
        assert_eq!(session.total_duration, 5);
    }

    #[test]
    fn test_partial_tick_does_not_leak_into_next_stage() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        h.clock.advance(Duration::milliseconds(2700));
        manager.poll();
        manager.advance_stage();

        // 0.3s left over from the previous stage must not complete a tick here
        h.clock.advance(Duration::milliseconds(800));
        manager.poll();
        assert_eq!(manager.session().unwrap().current_stage_duration, 0);

        h.clock.advance(Duration::milliseconds(200));
        manager.poll();
        let session = manager.session().unwrap();
        assert_eq!(session.current_stage_duration, 1);
        assert_eq!(session.total_duration, 3);
    }

    #[test]
    fn test_autosave_flushes_ticks() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        for _ in 0..4 {
            h.clock.advance_secs(1);
            manager.poll();
        }
        assert_eq!(stored(&h).total_duration, 0);

        h.clock.advance_secs(1);
        manager.poll();
        assert_eq!(stored(&h).total_duration, 5);
    }

    #[test]
    fn test_complete_uses_wall_clock_not_ticks() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        manager.pause();
        h.clock.advance_secs(60);
        manager.poll();
        manager.complete();

        assert_eq!(h.completed.borrow()[0].total_duration, 60);
    }

    #[test]
    fn test_missing_identity_is_blocking_and_retryable() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);

        let result = manager.initialize(None);
        assert!(matches!(result, Err(Error::NotAuthenticated)));
        assert!(manager.error().is_some());
        assert!(!manager.is_loading());
        assert!(manager.session().is_none());
        assert!(h.drafts.is_empty());

        assert!(manager.initialize(Some(&Identity::new("  "))).is_err());

        manager.initialize(Some(&user())).unwrap();
        assert!(manager.error().is_none());
        assert!(manager.session().is_some());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), log_store.clone());

        let first = manager.initialize(Some(&user())).unwrap().session_id;
        let second = manager.initialize(Some(&user())).unwrap().session_id;

        assert_eq!(first, second);
        assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseStarted), 1);
        assert_eq!(log_store.calls().len(), 1);
    }

    #[test]
    fn test_mutators_without_session_are_noops() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);

        assert_eq!(manager.advance_stage(), None);
        assert!(!manager.set_pre_rating(5));
        assert!(!manager.pause());
        assert!(!manager.complete());
        assert!(!manager.abandon());
        manager.poll();
        assert!(h.analytics.events().is_empty());
        assert!(h.completed.borrow().is_empty());
    }

    #[test]
    fn test_mutators_after_completion_are_noops() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();
        manager.complete();
        let events = h.analytics.events().len();

        assert_eq!(manager.advance_stage(), None);
        assert!(!manager.set_post_rating(2));
        assert!(!manager.abandon());
        assert!(!manager.complete());
        assert_eq!(h.analytics.events().len(), events);
        assert!(h.drafts.is_empty());
        assert_eq!(h.completed.borrow().len(), 1);
    }

    #[test]
    fn test_every_mutation_is_persisted_immediately() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::MindClear), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        manager.set_pre_rating(6);
        assert_eq!(stored(&h).pre_rating, Some(6));

        manager.log_trigger(TriggerCategory::Finances, None);
        assert_eq!(
            stored(&h).trigger.map(|t| t.category),
            Some(TriggerCategory::Finances)
        );
        assert_eq!(stored(&h).current_stage, Stage::PreRating);

        manager.advance_stage();
        assert_eq!(stored(&h).current_stage, Stage::Instructions);
    }

    #[test]
    fn test_invalid_data_update_is_rejected() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        manager.initialize(Some(&user())).unwrap();

        assert!(!manager.update_exercise_data(&object(json!({ "type": "grounding" }))));
        assert!(!manager.update_exercise_data(&object(json!({ "bogus": 1 }))));
        assert_eq!(h.analytics.count(AnalyticsEvent::ExerciseDataUpdated), 0);
        assert_eq!(
            manager.session().unwrap().exercise_data,
            ExerciseData::empty(ExerciseType::BrainDump)
        );
    }

    #[test]
    fn test_edits_are_debounced_before_remote_sync() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), log_store.clone());
        manager.initialize(Some(&user())).unwrap();

        manager.update_exercise_data(&object(json!({ "word_count": 1 })));
        h.clock.advance_secs(1);
        manager.poll();
        manager.update_exercise_data(&object(json!({ "word_count": 2 })));
        h.clock.advance_secs(1);
        manager.poll();

        let progress_calls = |store: &FakeLogStore| {
            store
                .calls()
                .into_iter()
                .filter(|c| matches!(c, LogEntry::Progress { .. }))
                .count()
        };
        assert_eq!(progress_calls(&log_store), 0);

        h.clock.advance_secs(1);
        manager.poll();
        assert_eq!(progress_calls(&log_store), 1);

        match log_store.calls().last() {
            Some(LogEntry::Progress { record, .. }) => assert_eq!(
                record.exercise_data,
                ExerciseData::BrainDump {
                    entries: vec![],
                    word_count: 2
                }
            ),
            other => panic!("expected progress record, got {:?}", other),
        }
    }

    #[test]
    fn test_flush_pushes_pending_edits() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), log_store.clone());
        manager.initialize(Some(&user())).unwrap();

        manager.update_exercise_data(&object(json!({ "entries": ["rent"] })));
        manager.flush();

        assert!(matches!(log_store.calls().last(), Some(LogEntry::Progress { .. })));
    }

    #[test]
    fn test_complete_drops_pending_sync() {
        let h = Harness::new();
        let log_store = FakeLogStore::default();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), log_store.clone());
        manager.initialize(Some(&user())).unwrap();

        manager.update_exercise_data(&object(json!({ "word_count": 9 })));
        manager.complete();
        h.clock.advance_secs(10);
        manager.poll();

        assert!(log_store
            .calls()
            .iter()
            .all(|c| !matches!(c, LogEntry::Progress { .. })));
    }

    #[test]
    fn test_module_tags_are_write_once() {
        let h = Harness::new();
        let mut manager = h.manager(definition(ExerciseType::BrainDump), OfflineLogStore);
        let session = manager.initialize(Some(&user())).unwrap();
        assert_eq!(session.module_context.as_deref(), Some("anxiety_basics"));
        assert_eq!(session.module_screen.as_deref(), Some("lesson_2"));

        let started = h.analytics.last(AnalyticsEvent::ExerciseStarted).unwrap();
        assert_eq!(started.property("module_context"), Some(&json!("anxiety_basics")));
    }

    #[test]
    fn test_exercise_only_definition_starts_at_exercise() {
        let h = Harness::new();
        let def = ExerciseDefinition::new(
            ExerciseType::BoxBreathing,
            "Quick Breath",
            DefinitionFlags {
                require_pre_rating: false,
                show_instructions: false,
                require_post_rating: false,
                log_trigger: false,
            },
        );
        let mut manager = h.manager(def, OfflineLogStore);
        let session = manager.initialize(Some(&user())).unwrap();
        assert_eq!(session.current_stage, Stage::Exercise);
        assert_eq!(session.progress.percentage(), 50);
    }
}
