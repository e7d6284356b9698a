use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use unwind_core::analytics::FanoutAnalytics;
use unwind_core::storage::DRAFT_FILE_NAME;
use unwind_core::*;

#[derive(Parser)]
#[command(name = "unwind")]
#[command(about = "Guided exercise sessions from the terminal", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use a specific config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Signed-in user (overrides config)
    #[arg(long, global = true)]
    user: Option<String>,

    /// Pretend the log store is unreachable
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List available exercises
    List,

    /// Start an exercise, or resume the one in progress
    Start {
        /// Exercise id (e.g. brain_dump, emotion_wheel)
        exercise: String,

        /// Part of the app that launched the exercise
        #[arg(long)]
        context: Option<String>,

        /// Screen that launched the exercise
        #[arg(long)]
        screen: Option<String>,
    },

    /// Show the exercise in progress (default)
    Status,

    /// Move to the next stage
    Advance,

    /// Record a rating on the 1-10 scale
    Rate {
        /// Rating before the exercise
        #[arg(long, conflicts_with = "post", required_unless_present = "post")]
        pre: Option<i32>,

        /// Rating after the exercise
        #[arg(long)]
        post: Option<i32>,
    },

    /// Log what triggered the exercise
    Trigger {
        /// work, relationships, health, finances, social, family, other
        category: String,

        /// Free-text note
        #[arg(long)]
        note: Option<String>,
    },

    /// Update exercise data with key=value pairs (values may be JSON)
    Data {
        #[arg(required = true)]
        fields: Vec<String>,
    },

    /// Pause the duration timer
    Pause,

    /// Resume the duration timer
    Resume,

    /// Finish the exercise
    Complete,

    /// Give up on the exercise
    Abandon,

    /// Show recent exercises
    History {
        /// How many days back to look
        #[arg(long, default_value_t = 7)]
        days: i64,
    },

    /// Roll up the log journal to CSV
    Rollup {
        /// Clean up processed journals after rollup
        #[arg(long)]
        cleanup: bool,
    },
}

struct Paths {
    draft: PathBuf,
    logs_dir: PathBuf,
    journal: PathBuf,
    csv: PathBuf,
    analytics: PathBuf,
}

impl Paths {
    fn new(data_dir: &Path) -> Self {
        let logs_dir = data_dir.join("logs");
        Self {
            draft: data_dir.join(DRAFT_FILE_NAME),
            journal: logs_dir.join("exercise_log.jsonl"),
            logs_dir,
            csv: data_dir.join("exercises.csv"),
            analytics: data_dir.join("analytics.jsonl"),
        }
    }
}

struct Env {
    paths: Paths,
    user: Option<Identity>,
    offline: bool,
    config: Config,
}

fn main() -> Result<()> {
    unwind_core::logging::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(|| config.data.data_dir.clone());
    tracing::debug!("Using data directory {:?}", data_dir);

    let env = Env {
        paths: Paths::new(&data_dir),
        user: cli
            .user
            .clone()
            .or_else(|| config.user.user_id.clone())
            .map(Identity::new),
        offline: cli.offline,
        config,
    };

    match cli.command.unwrap_or(Commands::Status) {
        Commands::List => cmd_list(),
        Commands::Start {
            exercise,
            context,
            screen,
        } => cmd_start(&env, &exercise, context, screen),
        Commands::Status => cmd_status(&env),
        Commands::Advance => with_session(&env, |manager| {
            manager
                .advance_stage()
                .map(|stage| println!("→ {}", stage))
                .ok_or_else(|| Error::Session("Already at the final stage".into()))
        }),
        Commands::Rate { pre, post } => with_session(&env, |manager| {
            let accepted = match (pre, post) {
                (Some(rating), _) => manager.set_pre_rating(rating),
                (None, Some(rating)) => manager.set_post_rating(rating),
                (None, None) => false,
            };
            ensure(accepted, "Rating was not recorded")
        }),
        Commands::Trigger { category, note } => {
            let category: TriggerCategory = category.parse()?;
            with_session(&env, |manager| {
                ensure(manager.log_trigger(category, note), "Trigger was not logged")
            })
        }
        Commands::Data { fields } => {
            let partial = parse_fields(&fields)?;
            with_session(&env, |manager| {
                ensure(
                    manager.update_exercise_data(&partial),
                    "Exercise data update rejected",
                )
            })
        }
        Commands::Pause => with_session(&env, |manager| {
            manager.pause();
            Ok(())
        }),
        Commands::Resume => with_session(&env, |manager| {
            manager.resume();
            Ok(())
        }),
        Commands::Complete => with_session(&env, |manager| {
            ensure(manager.complete(), "Exercise could not be completed")
        }),
        Commands::Abandon => with_session(&env, |manager| {
            ensure(manager.abandon(), "Exercise could not be abandoned")
        }),
        Commands::History { days } => cmd_history(&env, days),
        Commands::Rollup { cleanup } => cmd_rollup(&env, cleanup),
    }
}

fn ensure(ok: bool, message: &str) -> Result<()> {
    if ok {
        Ok(())
    } else {
        Err(Error::Session(message.into()))
    }
}

fn cmd_list() -> Result<()> {
    let catalog = get_default_catalog();
    let errors = catalog.validate();
    if !errors.is_empty() {
        eprintln!("Catalog validation errors:");
        for error in errors {
            eprintln!("  - {}", error);
        }
        return Err(Error::Other("Invalid catalog".into()));
    }

    println!("Available exercises:");
    for def in catalog.exercises.values() {
        let stages: Vec<&str> = def.stages.iter().map(Stage::as_str).collect();
        println!("  {:<14} {:<22} {}", def.exercise_type, def.title, stages.join(" → "));
    }
    Ok(())
}

fn cmd_start(
    env: &Env,
    exercise: &str,
    context: Option<String>,
    screen: Option<String>,
) -> Result<()> {
    let definition = get_default_catalog().find(exercise)?.clone();
    let prior = FileDraftStore::new(&env.paths.draft).load()?;

    let mut options = SessionOptions::new(definition);
    if let Some(context) = context {
        options = options.module_context(context);
    }
    if let Some(screen) = screen {
        options = options.module_screen(screen);
    }

    let mut manager = build_manager(env, options);
    initialize(env, &mut manager)?;
    manager.flush();

    let Some(session) = manager.session() else {
        return Err(Error::Session("Exercise failed to start".into()));
    };
    let resumed = prior.is_some_and(|d| d.session_id == session.session_id);
    println!(
        "{} {}",
        if resumed { "Resumed" } else { "Started" },
        manager.definition().title
    );
    display_session(manager.definition(), session);
    Ok(())
}

fn cmd_status(env: &Env) -> Result<()> {
    match FileDraftStore::new(&env.paths.draft).load()? {
        Some(session) => {
            let definition = get_default_catalog()
                .get(session.exercise_type)
                .ok_or_else(|| Error::UnknownExercise(session.exercise_type.to_string()))?;
            display_session(definition, &session);
        }
        None => println!("No exercise in progress."),
    }
    Ok(())
}

/// Resume the draft, apply one operation, persist
fn with_session<F>(env: &Env, op: F) -> Result<()>
where
    F: FnOnce(&mut ExerciseSessionManager) -> Result<()>,
{
    let draft = FileDraftStore::new(&env.paths.draft)
        .load()?
        .ok_or_else(|| {
            Error::Session("No exercise in progress. Start one with `unwind start <exercise>`".into())
        })?;
    let definition = get_default_catalog()
        .get(draft.exercise_type)
        .cloned()
        .ok_or_else(|| Error::UnknownExercise(draft.exercise_type.to_string()))?;

    let mut manager = build_manager(env, SessionOptions::new(definition));

    // initialize would replace a draft it cannot resume; leave it alone
    if let Some(identity) = env.user.as_ref().filter(|i| !i.user_id.trim().is_empty()) {
        if !manager.is_resumable(&draft, identity) {
            return Err(no_session_for_user(&draft));
        }
    }
    initialize(env, &mut manager)?;
    if manager.session().map(|s| s.session_id) != Some(draft.session_id) {
        return Err(no_session_for_user(&draft));
    }

    let outcome = op(&mut manager);
    manager.flush();

    if let Some(session) = manager.session() {
        if !session.completion_status.is_terminal() {
            display_session(manager.definition(), session);
        }
    }
    outcome
}

fn no_session_for_user(draft: &ExerciseSession) -> Error {
    tracing::warn!(
        "Draft {} ({}, {}) cannot be resumed by this user",
        draft.session_id,
        draft.exercise_type,
        draft.completion_status.as_str()
    );
    Error::Session("No exercise in progress for this user".into())
}

fn initialize(env: &Env, manager: &mut ExerciseSessionManager) -> Result<()> {
    let result = manager.initialize(env.user.as_ref()).map(|_| ());
    if result.is_err() {
        eprintln!(
            "{}",
            manager.error().unwrap_or("Exercise failed to start")
        );
    }
    result
}

fn build_manager(env: &Env, options: SessionOptions) -> ExerciseSessionManager {
    let log_store: Box<dyn RemoteLogStore> = if env.offline {
        Box::new(OfflineLogStore)
    } else {
        Box::new(JsonlLogStore::new(&env.paths.journal))
    };

    let mut analytics = FanoutAnalytics::new();
    if env.config.analytics.enabled {
        analytics = analytics.with(TracingAnalytics);
        if env.config.analytics.jsonl {
            analytics = analytics.with(JsonlAnalytics::new(&env.paths.analytics));
        }
    }

    let options = options
        .device_type(env.config.user.device_type.clone())
        .on_complete(|session| {
            println!("\n✓ Exercise complete!");
            println!("  Duration: {}s", session.total_duration);
            if let Some(post) = session.post_rating {
                let change = RatingChange::between(session.pre_rating, post);
                println!(
                    "  Feeling: {} → {} ({}%)",
                    session
                        .pre_rating
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "-".into()),
                    post,
                    change.reduction_percentage
                );
            }
            if session.log_id.is_none() {
                println!("  (saved locally only; log store unavailable)");
            }
        })
        .on_abandon(|session| {
            println!(
                "\n✗ Exercise abandoned at {}%",
                session.progress.percentage()
            );
        });

    ExerciseSessionManager::new(
        options,
        Collaborators {
            drafts: Box::new(FileDraftStore::new(&env.paths.draft)),
            log_store,
            analytics: Box::new(analytics),
            clock: Arc::new(SystemClock),
        },
        env.config.timer_settings(),
    )
}

/// Parse `key=value` pairs; values that are not valid JSON become strings
fn parse_fields(fields: &[String]) -> Result<Map<String, Value>> {
    let mut partial = Map::new();
    for field in fields {
        let (key, raw) = field
            .split_once('=')
            .ok_or_else(|| Error::Other(format!("Expected key=value, got '{}'", field)))?;
        let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        partial.insert(key.trim().to_string(), value);
    }
    Ok(partial)
}

fn cmd_history(env: &Env, days: i64) -> Result<()> {
    let summaries = load_recent_summaries(&env.paths.journal, &env.paths.csv, days)?;
    if summaries.is_empty() {
        println!("No exercises in the last {} days.", days);
        return Ok(());
    }

    for summary in summaries {
        println!(
            "  {}  {:<22} {:<11} {:>5}  {}",
            summary.started_at.format("%Y-%m-%d %H:%M"),
            summary.exercise_name,
            summary.status.as_str(),
            summary
                .duration_seconds
                .map(|d| format!("{}s", d))
                .unwrap_or_else(|| "-".into()),
            summary
                .percentage_reached
                .map(|p| format!("{}%", p))
                .unwrap_or_default()
        );
    }
    Ok(())
}

fn cmd_rollup(env: &Env, cleanup: bool) -> Result<()> {
    if !env.paths.journal.exists() {
        println!("No journal found - nothing to roll up.");
        return Ok(());
    }

    let count = unwind_core::rollup::journal_to_csv_and_archive(&env.paths.journal, &env.paths.csv)?;

    println!("✓ Rolled up {} exercises to CSV", count);
    println!("  CSV: {}", env.paths.csv.display());

    if cleanup {
        let cleaned = unwind_core::rollup::cleanup_processed_journals(&env.paths.logs_dir)?;
        if cleaned > 0 {
            println!("✓ Cleaned up {} processed journals", cleaned);
        }
    }

    Ok(())
}

fn display_session(definition: &ExerciseDefinition, session: &ExerciseSession) {
    println!("\n╭─────────────────────────────────────────╮");
    println!("│  {}", definition.title.to_uppercase());
    println!("╰─────────────────────────────────────────╯");
    println!();
    println!(
        "  Stage: {} (step {}/{}, {}%)",
        session.current_stage,
        session.progress.current_step(),
        session.progress.total_steps(),
        session.progress.percentage()
    );

    let filled = (session.progress.percentage() / 5) as usize;
    println!("  [{}{}]", "█".repeat(filled), "·".repeat(20 - filled.min(20)));

    if let Some(pre) = session.pre_rating {
        println!("  Before: {}/10", pre);
    }
    if let Some(post) = session.post_rating {
        println!("  After:  {}/10", post);
    }
    if let Some(trigger) = &session.trigger {
        match &trigger.note {
            Some(note) => println!("  Trigger: {} ({})", trigger.category.as_str(), note),
            None => println!("  Trigger: {}", trigger.category.as_str()),
        }
    }
    if session.is_paused {
        println!("  ⏸ Paused");
    }
    if session.log_id.is_none() {
        println!("  ⚠ Not synced to log store");
    }
    println!();
}
