//! Default catalog of guided exercises.
//!
//! This module provides the built-in exercise definitions.

use crate::types::*;
use crate::{Error, Result};
use once_cell::sync::Lazy;
use std::collections::BTreeMap;

/// The set of exercise definitions available to the app
#[derive(Clone, Debug)]
pub struct Catalog {
    pub exercises: BTreeMap<ExerciseType, ExerciseDefinition>,
}

/// Cached default catalog - built once and reused across all operations
static DEFAULT_CATALOG: Lazy<Catalog> = Lazy::new(build_default_catalog_internal);

/// Get a reference to the cached default catalog
pub fn get_default_catalog() -> &'static Catalog {
    &DEFAULT_CATALOG
}

/// Builds the default catalog
///
/// **Note**: For production use, prefer `get_default_catalog()`.
pub fn build_default_catalog() -> Catalog {
    build_default_catalog_internal()
}

fn build_default_catalog_internal() -> Catalog {
    let standard = DefinitionFlags::default();

    let definitions = [
        ExerciseDefinition::new(ExerciseType::BrainDump, "Brain Dump", standard),
        ExerciseDefinition::new(ExerciseType::EmotionWheel, "Emotion Wheel", standard),
        ExerciseDefinition::new(
            ExerciseType::MindClear,
            "Mind Clear",
            DefinitionFlags {
                log_trigger: true,
                ..standard
            },
        ),
        // Breathing is offered mid-panic, so it skips the pre-rating.
        ExerciseDefinition::new(
            ExerciseType::BoxBreathing,
            "Box Breathing",
            DefinitionFlags {
                require_pre_rating: false,
                ..standard
            },
        ),
        ExerciseDefinition::new(
            ExerciseType::Grounding,
            "5-4-3-2-1 Grounding",
            DefinitionFlags {
                show_instructions: false,
                log_trigger: true,
                ..standard
            },
        ),
    ];

    Catalog {
        exercises: definitions
            .into_iter()
            .map(|d| (d.exercise_type, d))
            .collect(),
    }
}

impl Catalog {
    pub fn get(&self, exercise_type: ExerciseType) -> Option<&ExerciseDefinition> {
        self.exercises.get(&exercise_type)
    }

    /// Look up a definition by its string id (e.g. `brain_dump`)
    pub fn find(&self, id: &str) -> Result<&ExerciseDefinition> {
        let exercise_type: ExerciseType = id.parse()?;
        self.get(exercise_type)
            .ok_or_else(|| Error::UnknownExercise(id.to_string()))
    }

    /// Validate every definition in the catalog
    ///
    /// Returns a list of validation errors (empty if valid)
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (key, def) in &self.exercises {
            if *key != def.exercise_type {
                errors.push(format!(
                    "Catalog key {} does not match definition type {}",
                    key, def.exercise_type
                ));
            }
            if def.title.trim().is_empty() {
                errors.push(format!("{}: empty title", key));
            }
            errors.extend(def.validate());
        }
        errors
    }
}
