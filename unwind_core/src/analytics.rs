//! Analytics sink for session lifecycle events.
//!
//! Tracking is fire-and-forget: sinks swallow their own failures and
//! nothing is returned to the caller.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Event properties
pub type Properties = Map<String, Value>;

/// Events emitted by the session manager
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnalyticsEvent {
    ExerciseStarted,
    ExerciseResumed,
    ExerciseStageAdvanced,
    ExercisePreRatingSet,
    ExercisePostRatingSet,
    ExerciseTriggerLogged,
    ExerciseDataUpdated,
    ExercisePaused,
    ExerciseUnpaused,
    ExerciseCompleted,
    ExerciseAbandoned,
}

impl AnalyticsEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalyticsEvent::ExerciseStarted => "exercise_started",
            AnalyticsEvent::ExerciseResumed => "exercise_resumed",
            AnalyticsEvent::ExerciseStageAdvanced => "exercise_stage_advanced",
            AnalyticsEvent::ExercisePreRatingSet => "exercise_pre_rating_set",
            AnalyticsEvent::ExercisePostRatingSet => "exercise_post_rating_set",
            AnalyticsEvent::ExerciseTriggerLogged => "exercise_trigger_logged",
            AnalyticsEvent::ExerciseDataUpdated => "exercise_data_updated",
            AnalyticsEvent::ExercisePaused => "exercise_paused",
            AnalyticsEvent::ExerciseUnpaused => "exercise_unpaused",
            AnalyticsEvent::ExerciseCompleted => "exercise_completed",
            AnalyticsEvent::ExerciseAbandoned => "exercise_abandoned",
        }
    }
}

/// Destination for analytics events
pub trait AnalyticsSink {
    fn track(&mut self, event: AnalyticsEvent, properties: Properties);
}

/// Emits each event as a structured `tracing` record
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn track(&mut self, event: AnalyticsEvent, properties: Properties) {
        let properties = Value::Object(properties);
        tracing::info!(
            target: "analytics",
            event = event.as_str(),
            properties = %properties,
            "track"
        );
    }
}

/// One tracked event as written to disk or kept in memory
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct TrackedEvent {
    pub event: AnalyticsEvent,
    pub properties: Properties,
    pub tracked_at: DateTime<Utc>,
}

impl TrackedEvent {
    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }
}

/// Appends events to a JSON Lines file
pub struct JsonlAnalytics {
    path: PathBuf,
}

impl JsonlAnalytics {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, tracked: &TrackedEvent) -> crate::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(tracked)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }
}

impl AnalyticsSink for JsonlAnalytics {
    fn track(&mut self, event: AnalyticsEvent, properties: Properties) {
        let tracked = TrackedEvent {
            event,
            properties,
            tracked_at: Utc::now(),
        };
        if let Err(e) = self.append(&tracked) {
            tracing::warn!("Dropping analytics event {}: {}", event.as_str(), e);
        }
    }
}

/// Keeps events in memory. Clones share the same list.
#[derive(Clone, Default)]
pub struct RecordingAnalytics {
    events: Arc<Mutex<Vec<TrackedEvent>>>,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TrackedEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Most recent event with the given name
    pub fn last(&self, event: AnalyticsEvent) -> Option<TrackedEvent> {
        self.events().into_iter().rev().find(|e| e.event == event)
    }

    pub fn count(&self, event: AnalyticsEvent) -> usize {
        self.events().iter().filter(|e| e.event == event).count()
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn track(&mut self, event: AnalyticsEvent, properties: Properties) {
        if let Ok(mut events) = self.events.lock() {
            events.push(TrackedEvent {
                event,
                properties,
                tracked_at: Utc::now(),
            });
        }
    }
}

/// Fans every event out to several sinks
#[derive(Default)]
pub struct FanoutAnalytics {
    sinks: Vec<Box<dyn AnalyticsSink>>,
}

impl FanoutAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl AnalyticsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl AnalyticsSink for FanoutAnalytics {
    fn track(&mut self, event: AnalyticsEvent, properties: Properties) {
        for sink in &mut self.sinks {
            sink.track(event, properties.clone());
        }
    }
}
