#![forbid(unsafe_code)]

//! Core domain model and session engine for unwind guided exercises.
//!
//! This crate provides:
//! - Domain types (exercise definitions, stages, sessions, payloads)
//! - The built-in exercise catalog and stage-transition table
//! - The exercise session manager
//! - Persistence (draft slot, log journal, CSV archive)
//! - Analytics sinks, clocks and timers

pub mod types;
pub mod error;
pub mod stages;
pub mod rating;
pub mod catalog;
pub mod config;
pub mod logging;
pub mod timing;
pub mod storage;
pub mod remote;
pub mod analytics;
pub mod session;
pub mod history;
pub mod rollup;

// Re-export commonly used types
pub use error::{Error, Result};
pub use types::*;
pub use catalog::{build_default_catalog, get_default_catalog, Catalog};
pub use config::Config;
pub use rating::RatingChange;
pub use storage::{DraftStore, FileDraftStore, MemoryDraftStore};
pub use remote::{JsonlLogStore, OfflineLogStore, RemoteLogStore};
pub use analytics::{AnalyticsEvent, AnalyticsSink, JsonlAnalytics, TracingAnalytics};
pub use timing::{Clock, ManualClock, SystemClock, TimerSettings};
pub use session::{Collaborators, ExerciseSessionManager, SessionOptions};
pub use history::{load_recent_summaries, ExerciseSummary};
