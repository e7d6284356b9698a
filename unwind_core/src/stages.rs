//! Stage-transition table for exercise definitions.
//!
//! A definition's stage list is derived from its flags in canonical order:
//! `[pre_rating] [instructions] exercise [post_rating] [trigger_log] complete`.
//! Sessions only ever move forward through that list.

use crate::{DefinitionFlags, ExerciseDefinition, ExerciseType, Progress, Stage};
use std::collections::HashSet;

impl ExerciseDefinition {
    /// Build a definition whose stage list is derived from `flags`
    pub fn new(exercise_type: ExerciseType, title: impl Into<String>, flags: DefinitionFlags) -> Self {
        let mut stages = Vec::with_capacity(Stage::CANONICAL_ORDER.len());
        if flags.require_pre_rating {
            stages.push(Stage::PreRating);
        }
        if flags.show_instructions {
            stages.push(Stage::Instructions);
        }
        stages.push(Stage::Exercise);
        if flags.require_post_rating {
            stages.push(Stage::PostRating);
        }
        if flags.log_trigger {
            stages.push(Stage::TriggerLog);
        }
        stages.push(Stage::Complete);

        Self {
            exercise_type,
            title: title.into(),
            flags,
            stages,
        }
    }

    /// Stage a fresh session starts at.
    ///
    /// Walks the flags in fixed priority: pre-rating, then instructions,
    /// then the exercise itself.
    pub fn initial_stage(&self) -> Stage {
        if self.flags.require_pre_rating {
            Stage::PreRating
        } else if self.flags.show_instructions {
            Stage::Instructions
        } else {
            Stage::Exercise
        }
    }

    /// Zero-based index of `stage` in this definition
    pub fn position(&self, stage: Stage) -> Option<usize> {
        self.stages.iter().position(|s| *s == stage)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.position(stage).is_some()
    }

    /// Stage after `current`, or `None` at the last stage (or if `current`
    /// does not belong to this definition)
    pub fn next_stage(&self, current: Stage) -> Option<Stage> {
        let idx = self.position(current)?;
        self.stages.get(idx + 1).copied()
    }

    /// Progress for a session sitting at `stage`
    pub fn progress_at(&self, stage: Stage) -> Progress {
        let step = self.position(stage).map(|i| i + 1).unwrap_or(0);
        Progress::at(step as u32, self.stages.len() as u32)
    }

    pub fn total_steps(&self) -> u32 {
        self.stages.len() as u32
    }

    /// Validate the stage list against the flags
    ///
    /// Returns a list of validation errors (empty if valid)
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let id = self.exercise_type;

        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(*stage) {
                errors.push(format!("{}: duplicate stage {}", id, stage));
            }
        }

        if !self.contains(Stage::Exercise) {
            errors.push(format!("{}: missing exercise stage", id));
        }

        if self.stages.last() != Some(&Stage::Complete) {
            errors.push(format!("{}: last stage must be complete", id));
        }

        let ranks: Vec<usize> = self.stages.iter().map(Stage::canonical_rank).collect();
        if ranks.windows(2).any(|w| w[0] >= w[1]) {
            errors.push(format!("{}: stages out of canonical order", id));
        }

        let flagged = [
            (Stage::PreRating, self.flags.require_pre_rating),
            (Stage::Instructions, self.flags.show_instructions),
            (Stage::PostRating, self.flags.require_post_rating),
            (Stage::TriggerLog, self.flags.log_trigger),
        ];
        for (stage, wanted) in flagged {
            if self.contains(stage) != wanted {
                errors.push(format!(
                    "{}: stage {} present={} but flag={}",
                    id,
                    stage,
                    self.contains(stage),
                    wanted
                ));
            }
        }

        if !self.contains(self.initial_stage()) {
            errors.push(format!(
                "{}: initial stage {} not in stage list",
                id,
                self.initial_stage()
            ));
        }

        errors
    }
}
