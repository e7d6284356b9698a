//! Core domain types for guided exercise sessions.
//!
//! This module defines the fundamental types used throughout the system:
//! - Exercise types, stages and static definitions
//! - Per-exercise payloads (tagged by exercise type)
//! - Triggers, progress and the session record itself

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// ============================================================================
// Exercise Types
// ============================================================================

/// Kind of guided exercise
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ExerciseType {
    BrainDump,
    EmotionWheel,
    MindClear,
    BoxBreathing,
    Grounding,
}

impl ExerciseType {
    pub const ALL: [ExerciseType; 5] = [
        ExerciseType::BrainDump,
        ExerciseType::EmotionWheel,
        ExerciseType::MindClear,
        ExerciseType::BoxBreathing,
        ExerciseType::Grounding,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExerciseType::BrainDump => "brain_dump",
            ExerciseType::EmotionWheel => "emotion_wheel",
            ExerciseType::MindClear => "mind_clear",
            ExerciseType::BoxBreathing => "box_breathing",
            ExerciseType::Grounding => "grounding",
        }
    }
}

impl fmt::Display for ExerciseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExerciseType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        ExerciseType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| Error::UnknownExercise(s.to_string()))
    }
}

/// One named step in an exercise's fixed sequence
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreRating,
    Instructions,
    Exercise,
    PostRating,
    TriggerLog,
    Complete,
}

impl Stage {
    /// Relative order every definition's stage list must respect
    pub const CANONICAL_ORDER: [Stage; 6] = [
        Stage::PreRating,
        Stage::Instructions,
        Stage::Exercise,
        Stage::PostRating,
        Stage::TriggerLog,
        Stage::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::PreRating => "pre_rating",
            Stage::Instructions => "instructions",
            Stage::Exercise => "exercise",
            Stage::PostRating => "post_rating",
            Stage::TriggerLog => "trigger_log",
            Stage::Complete => "complete",
        }
    }

    pub(crate) fn canonical_rank(&self) -> usize {
        Stage::CANONICAL_ORDER
            .iter()
            .position(|s| s == self)
            .unwrap_or(usize::MAX)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session. Only ever moves out of `InProgress`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    #[default]
    InProgress,
    Completed,
    Abandoned,
}

impl CompletionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CompletionStatus::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::InProgress => "in_progress",
            CompletionStatus::Completed => "completed",
            CompletionStatus::Abandoned => "abandoned",
        }
    }
}

// ============================================================================
// Definitions
// ============================================================================

/// Stage switches for a definition
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DefinitionFlags {
    pub require_pre_rating: bool,
    pub show_instructions: bool,
    pub require_post_rating: bool,
    pub log_trigger: bool,
}

impl Default for DefinitionFlags {
    fn default() -> Self {
        Self {
            require_pre_rating: true,
            show_instructions: true,
            require_post_rating: true,
            log_trigger: false,
        }
    }
}

/// Static description of one exercise. Never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExerciseDefinition {
    pub exercise_type: ExerciseType,
    pub title: String,
    pub flags: DefinitionFlags,
    pub stages: Vec<Stage>,
}

// ============================================================================
// Exercise Payloads
// ============================================================================

/// Exercise-specific payload, tagged by exercise type.
///
/// The session manager only ever merges into this value; interpreting the
/// fields is left to whoever renders the exercise.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExerciseData {
    BrainDump {
        #[serde(default)]
        entries: Vec<String>,
        #[serde(default)]
        word_count: u32,
    },
    EmotionWheel {
        #[serde(default)]
        primary_emotion: Option<String>,
        #[serde(default)]
        secondary_emotion: Option<String>,
        #[serde(default)]
        specific_emotion: Option<String>,
        #[serde(default)]
        intensity: Option<u8>,
    },
    MindClear {
        #[serde(default)]
        thoughts_released: u32,
        #[serde(default)]
        categories: Vec<String>,
    },
    BoxBreathing {
        #[serde(default)]
        cycles_completed: u32,
        #[serde(default)]
        target_cycles: Option<u32>,
    },
    Grounding {
        #[serde(default)]
        seen: Vec<String>,
        #[serde(default)]
        touched: Vec<String>,
        #[serde(default)]
        heard: Vec<String>,
        #[serde(default)]
        smelled: Vec<String>,
        #[serde(default)]
        tasted: Vec<String>,
    },
}

impl ExerciseData {
    /// Empty payload for a given exercise type
    pub fn empty(exercise_type: ExerciseType) -> Self {
        match exercise_type {
            ExerciseType::BrainDump => ExerciseData::BrainDump {
                entries: Vec::new(),
                word_count: 0,
            },
            ExerciseType::EmotionWheel => ExerciseData::EmotionWheel {
                primary_emotion: None,
                secondary_emotion: None,
                specific_emotion: None,
                intensity: None,
            },
            ExerciseType::MindClear => ExerciseData::MindClear {
                thoughts_released: 0,
                categories: Vec::new(),
            },
            ExerciseType::BoxBreathing => ExerciseData::BoxBreathing {
                cycles_completed: 0,
                target_cycles: None,
            },
            ExerciseType::Grounding => ExerciseData::Grounding {
                seen: Vec::new(),
                touched: Vec::new(),
                heard: Vec::new(),
                smelled: Vec::new(),
                tasted: Vec::new(),
            },
        }
    }

    pub fn exercise_type(&self) -> ExerciseType {
        match self {
            ExerciseData::BrainDump { .. } => ExerciseType::BrainDump,
            ExerciseData::EmotionWheel { .. } => ExerciseType::EmotionWheel,
            ExerciseData::MindClear { .. } => ExerciseType::MindClear,
            ExerciseData::BoxBreathing { .. } => ExerciseType::BoxBreathing,
            ExerciseData::Grounding { .. } => ExerciseType::Grounding,
        }
    }

    /// Shallow-merge a partial JSON object into this payload.
    ///
    /// Top-level keys in `partial` replace the existing values. The `type`
    /// tag may be repeated but not changed, and every key must name a field
    /// of the current variant. On error `self` is left untouched.
    pub fn merge(&mut self, partial: &Map<String, Value>) -> Result<()> {
        let tag = self.exercise_type().as_str();

        let mut merged = match serde_json::to_value(&*self)? {
            Value::Object(map) => map,
            other => {
                return Err(Error::Session(format!(
                    "exercise data serialized to non-object: {}",
                    other
                )))
            }
        };

        for (key, value) in partial {
            if key == "type" {
                if value.as_str() != Some(tag) {
                    return Err(Error::Session(format!(
                        "cannot change exercise data type from {} to {}",
                        tag, value
                    )));
                }
                continue;
            }
            if !merged.contains_key(key) {
                return Err(Error::Session(format!(
                    "unknown field '{}' for {} data",
                    key, tag
                )));
            }
            merged.insert(key.clone(), value.clone());
        }

        *self = serde_json::from_value(Value::Object(merged))?;
        Ok(())
    }
}

// ============================================================================
// Triggers and Progress
// ============================================================================

/// What precipitated the need for the exercise
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCategory {
    Work,
    Relationships,
    Health,
    Finances,
    Social,
    Family,
    Other,
}

impl TriggerCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCategory::Work => "work",
            TriggerCategory::Relationships => "relationships",
            TriggerCategory::Health => "health",
            TriggerCategory::Finances => "finances",
            TriggerCategory::Social => "social",
            TriggerCategory::Family => "family",
            TriggerCategory::Other => "other",
        }
    }
}

impl FromStr for TriggerCategory {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "work" => Ok(TriggerCategory::Work),
            "relationships" => Ok(TriggerCategory::Relationships),
            "health" => Ok(TriggerCategory::Health),
            "finances" => Ok(TriggerCategory::Finances),
            "social" => Ok(TriggerCategory::Social),
            "family" => Ok(TriggerCategory::Family),
            "other" => Ok(TriggerCategory::Other),
            _ => Err(Error::Other(format!("Unknown trigger category: {}", s))),
        }
    }
}

/// Logged trigger context
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub category: TriggerCategory,
    pub note: Option<String>,
    pub logged_at: DateTime<Utc>,
}

/// Position within the stage list. Only constructed through [`Progress::at`].
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Progress {
    current_step: u32,
    total_steps: u32,
    percentage: u32,
}

impl Progress {
    pub fn at(current_step: u32, total_steps: u32) -> Self {
        let percentage = if total_steps == 0 {
            0
        } else {
            (f64::from(current_step) / f64::from(total_steps) * 100.0).round() as u32
        };
        Self {
            current_step,
            total_steps,
            percentage,
        }
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn total_steps(&self) -> u32 {
        self.total_steps
    }

    pub fn percentage(&self) -> u32 {
        self.percentage
    }
}

// ============================================================================
// Session Types
// ============================================================================

/// Opaque reference to a row in the remote log store
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct LogId(pub String);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The signed-in user a session belongs to
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

/// One user's single attempt at one exercise
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ExerciseSession {
    pub session_id: Uuid,
    pub user_id: String,
    pub exercise_type: ExerciseType,
    pub module_context: Option<String>,
    pub module_screen: Option<String>,
    pub current_stage: Stage,
    pub completion_status: CompletionStatus,
    pub pre_rating: Option<i32>,
    pub post_rating: Option<i32>,
    pub exercise_data: ExerciseData,
    pub trigger: Option<Trigger>,
    pub progress: Progress,
    pub current_stage_duration: u64,
    pub total_duration: u64,
    pub is_paused: bool,
    pub log_id: Option<LogId>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}
