//! Clocks, debouncing and the per-session timers.
//!
//! Nothing here spawns threads. Timers are anchors that the session manager
//! polls on the caller's thread.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

/// Source of wall-clock time
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

/// The system clock
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now += by;
        }
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map(|now| *now).unwrap_or_else(|_| Utc::now())
    }
}

/// Timer periods for a session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerSettings {
    /// Duration tick period; each tick adds this many seconds
    pub tick_seconds: u64,
    /// Safety-net save period
    pub autosave_seconds: u64,
    /// Quiet period before intra-stage edits are pushed to the log store
    pub remote_sync_debounce_ms: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            tick_seconds: 1,
            autosave_seconds: 5,
            remote_sync_debounce_ms: 1500,
        }
    }
}

/// Trailing-edge debouncer.
///
/// Each `schedule` pushes the deadline out by `delay`; `take_due` reports
/// (once) when the deadline has passed.
#[derive(Clone, Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<DateTime<Utc>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn schedule(&mut self, now: DateTime<Utc>) {
        self.deadline = Some(
            now.checked_add_signed(self.delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        );
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    /// True once the deadline has passed; disarms the debouncer
    pub fn take_due(&mut self, now: DateTime<Utc>) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// True if anything was pending, regardless of deadline; disarms
    pub fn take_pending(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn cancel(&mut self) {
        self.deadline = None;
    }
}

/// Duration tick and safety-save anchors for one session
#[derive(Clone, Debug)]
pub struct SessionTimers {
    settings: TimerSettings,
    tick_anchor: DateTime<Utc>,
    save_anchor: DateTime<Utc>,
}

impl SessionTimers {
    pub fn new(settings: TimerSettings, now: DateTime<Utc>) -> Self {
        Self {
            settings,
            tick_anchor: now,
            save_anchor: now,
        }
    }

    pub fn settings(&self) -> TimerSettings {
        self.settings
    }

    /// Tear down and re-establish both timers at `now`
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.tick_anchor = now;
        self.save_anchor = now;
    }

    /// Seconds accumulated by whole ticks since the last call.
    ///
    /// Partial ticks carry over to the next call.
    pub fn take_elapsed_ticks(&mut self, now: DateTime<Utc>) -> u64 {
        let period = self.settings.tick_seconds.max(1);
        let elapsed = (now - self.tick_anchor).num_seconds();
        if elapsed <= 0 {
            return 0;
        }
        let ticks = elapsed as u64 / period;
        self.tick_anchor += Duration::seconds((ticks * period) as i64);
        ticks * period
    }

    /// Whether the safety-net save is due; re-arms when it is
    pub fn take_autosave(&mut self, now: DateTime<Utc>) -> bool {
        let Some(period) = i64::try_from(self.settings.autosave_seconds.max(1))
            .ok()
            .and_then(Duration::try_seconds)
        else {
            return false;
        };
        if now - self.save_anchor >= period {
            self.save_anchor = now;
            true
        } else {
            false
        }
    }
}
