//! Token budget tracking.
//!
//! The [`TokenUsageTracker`] keeps a rolling hourly bucket and a UTC-day
//! accumulator, and classifies consumption against the configured limits.
//! It is updated once per completed execution and consulted by the
//! controller to decide when to wind down.
//!
//! # Example
//!
//! ```rust
//! use foreman::usage::{TokenUsageTracker, UsageLimitConfig, UsageLimitStatus};
//! use chrono::Utc;
//!
//! let config = UsageLimitConfig { max_tokens_per_hour: 1000, ..UsageLimitConfig::default() };
//! let mut tracker = TokenUsageTracker::new(config, Utc::now());
//! let update = tracker.update(850, 0, None, Utc::now());
//! assert_eq!(update.status, UsageLimitStatus::ApproachingLimit);
//! ```

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info};

/// Length of the rolling budget window.
pub const HOUR_WINDOW_SECS: i64 = 3600;

/// Number of expired hourly buckets kept for inspection.
pub const MAX_HOURLY_HISTORY: usize = 24;

/// Ratio between the daily and hourly limits when the agent reports its
/// context window.
pub const DAILY_TO_HOURLY_RATIO: u64 = 5;

// =============================================================================
// Configuration
// =============================================================================

/// Budget limits and status thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageLimitConfig {
    #[serde(default = "default_max_tokens_per_hour")]
    pub max_tokens_per_hour: u64,
    #[serde(default = "default_max_tokens_per_day")]
    pub max_tokens_per_day: u64,
    /// Fraction of the budget at which observers are warned.
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    /// Fraction of the budget at which the controller winds down.
    #[serde(default = "default_pause_threshold")]
    pub pause_threshold: f64,
}

fn default_max_tokens_per_hour() -> u64 {
    200_000
}

fn default_max_tokens_per_day() -> u64 {
    1_000_000
}

fn default_warning_threshold() -> f64 {
    0.6
}

fn default_pause_threshold() -> f64 {
    0.8
}

impl Default for UsageLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens_per_hour: default_max_tokens_per_hour(),
            max_tokens_per_day: default_max_tokens_per_day(),
            warning_threshold: default_warning_threshold(),
            pause_threshold: default_pause_threshold(),
        }
    }
}

impl UsageLimitConfig {
    /// Classify a usage fraction.
    #[must_use]
    pub fn classify(&self, fraction: f64) -> UsageLimitStatus {
        if fraction >= 1.0 {
            UsageLimitStatus::AtLimit
        } else if fraction >= self.pause_threshold {
            UsageLimitStatus::ApproachingLimit
        } else if fraction >= self.warning_threshold {
            UsageLimitStatus::Warning
        } else {
            UsageLimitStatus::Ok
        }
    }
}

// =============================================================================
// Status
// =============================================================================

/// Budget status, ordered by severity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum UsageLimitStatus {
    #[default]
    Ok,
    Warning,
    ApproachingLimit,
    AtLimit,
}

impl UsageLimitStatus {
    /// Check if new work must stop being picked up.
    #[must_use]
    pub fn requires_wind_down(&self) -> bool {
        matches!(
            self,
            UsageLimitStatus::ApproachingLimit | UsageLimitStatus::AtLimit
        )
    }
}

impl fmt::Display for UsageLimitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UsageLimitStatus::Ok => write!(f, "ok"),
            UsageLimitStatus::Warning => write!(f, "warning"),
            UsageLimitStatus::ApproachingLimit => write!(f, "approaching_limit"),
            UsageLimitStatus::AtLimit => write!(f, "at_limit"),
        }
    }
}

// =============================================================================
// Buckets
// =============================================================================

/// Token usage within one hourly window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HourlyUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub limit: u64,
    pub window_start: DateTime<Utc>,
    pub reset_at: DateTime<Utc>,
}

impl HourlyUsage {
    /// Empty bucket opening at `start`.
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>, limit: u64) -> Self {
        Self {
            input_tokens: 0,
            output_tokens: 0,
            limit,
            window_start: start,
            reset_at: start + chrono::Duration::seconds(HOUR_WINDOW_SECS),
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_at
    }
}

/// Token usage for one UTC calendar day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    pub date: NaiveDate,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl DailyUsage {
    #[must_use]
    pub fn for_date(date: NaiveDate) -> Self {
        Self {
            date,
            input_tokens: 0,
            output_tokens: 0,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

// =============================================================================
// Tracker
// =============================================================================

/// Result of recording usage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageUpdate {
    pub previous_status: UsageLimitStatus,
    pub status: UsageLimitStatus,
    /// The hourly window expired and a fresh bucket was started.
    pub rolled_over: bool,
    pub hourly_percentage: f64,
    pub daily_percentage: f64,
}

impl UsageUpdate {
    #[must_use]
    pub fn status_changed(&self) -> bool {
        self.previous_status != self.status
    }
}

/// Serializable tracker state, carried across restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSnapshot {
    pub hourly: HourlyUsage,
    pub daily: DailyUsage,
    #[serde(default)]
    pub history: Vec<HourlyUsage>,
}

/// Rolling hourly and daily token budget.
#[derive(Debug, Clone)]
pub struct TokenUsageTracker {
    config: UsageLimitConfig,
    hourly: HourlyUsage,
    daily: DailyUsage,
    history: VecDeque<HourlyUsage>,
    status: UsageLimitStatus,
}

impl TokenUsageTracker {
    /// Create a tracker with an empty bucket opening at `now`.
    #[must_use]
    pub fn new(config: UsageLimitConfig, now: DateTime<Utc>) -> Self {
        Self {
            hourly: HourlyUsage::starting_at(now, config.max_tokens_per_hour),
            daily: DailyUsage::for_date(now.date_naive()),
            history: VecDeque::new(),
            status: UsageLimitStatus::Ok,
            config,
        }
    }

    /// Restore buckets from a snapshot, re-deriving the status.
    #[must_use]
    pub fn restore(config: UsageLimitConfig, snapshot: UsageSnapshot) -> Self {
        let mut tracker = Self {
            hourly: snapshot.hourly,
            daily: snapshot.daily,
            history: snapshot
                .history
                .into_iter()
                .rev()
                .take(MAX_HOURLY_HISTORY)
                .rev()
                .collect(),
            status: UsageLimitStatus::Ok,
            config,
        };
        tracker.hourly.limit = config.max_tokens_per_hour;
        tracker.status = tracker.compute_status();
        tracker
    }

    #[must_use]
    pub fn snapshot(&self) -> UsageSnapshot {
        UsageSnapshot {
            hourly: self.hourly,
            daily: self.daily,
            history: self.history.iter().copied().collect(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &UsageLimitConfig {
        &self.config
    }

    #[must_use]
    pub fn hourly(&self) -> &HourlyUsage {
        &self.hourly
    }

    #[must_use]
    pub fn daily(&self) -> &DailyUsage {
        &self.daily
    }

    /// Expired hourly buckets, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &HourlyUsage> {
        self.history.iter()
    }

    #[must_use]
    pub fn status(&self) -> UsageLimitStatus {
        self.status
    }

    #[must_use]
    pub fn hourly_percentage(&self) -> f64 {
        fraction(self.hourly.total(), self.config.max_tokens_per_hour)
    }

    #[must_use]
    pub fn daily_percentage(&self) -> f64 {
        fraction(self.daily.total(), self.config.max_tokens_per_day)
    }

    /// Record the usage of one completed execution.
    pub fn update(
        &mut self,
        input_tokens: u64,
        output_tokens: u64,
        context_window_hint: Option<u64>,
        now: DateTime<Utc>,
    ) -> UsageUpdate {
        let previous_status = self.status;

        if let Some(window) = context_window_hint.filter(|w| *w > 0) {
            self.apply_context_window(window);
        }

        let rolled_over = self.roll_hour(now);
        self.hourly.input_tokens += input_tokens;
        self.hourly.output_tokens += output_tokens;

        self.roll_day(now);
        self.daily.input_tokens += input_tokens;
        self.daily.output_tokens += output_tokens;

        self.status = self.compute_status();
        let update = self.make_update(previous_status, rolled_over);

        debug!(
            "Token usage: hour {}/{} ({:.1}%), day {}/{} ({:.1}%), status {}",
            self.hourly.total(),
            self.config.max_tokens_per_hour,
            update.hourly_percentage * 100.0,
            self.daily.total(),
            self.config.max_tokens_per_day,
            update.daily_percentage * 100.0,
            self.status
        );

        update
    }

    /// Roll the hourly window if it has expired, without recording usage.
    ///
    /// Returns `None` when the window is still current.
    pub fn roll_if_expired(&mut self, now: DateTime<Utc>) -> Option<UsageUpdate> {
        if !self.hourly.is_expired(now) {
            return None;
        }
        let previous_status = self.status;
        self.roll_hour(now);
        self.roll_day(now);
        self.status = self.compute_status();
        Some(self.make_update(previous_status, true))
    }

    fn apply_context_window(&mut self, window: u64) {
        if self.config.max_tokens_per_hour != window {
            info!(
                "Adopting agent context window {} as hourly token limit",
                window
            );
        }
        self.config.max_tokens_per_hour = window;
        self.config.max_tokens_per_day = window.saturating_mul(DAILY_TO_HOURLY_RATIO);
        self.hourly.limit = window;
    }

    fn roll_hour(&mut self, now: DateTime<Utc>) -> bool {
        if !self.hourly.is_expired(now) {
            return false;
        }
        let expired = self.hourly;
        self.history.push_back(expired);
        while self.history.len() > MAX_HOURLY_HISTORY {
            self.history.pop_front();
        }
        self.hourly = HourlyUsage::starting_at(now, self.config.max_tokens_per_hour);
        info!(
            "Hourly token window reset ({} tokens used in previous window)",
            expired.total()
        );
        true
    }

    fn roll_day(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if self.daily.date != today {
            debug!(
                "Daily token usage reset ({} tokens used on {})",
                self.daily.total(),
                self.daily.date
            );
            self.daily = DailyUsage::for_date(today);
        }
    }

    fn compute_status(&self) -> UsageLimitStatus {
        let worst = self.hourly_percentage().max(self.daily_percentage());
        self.config.classify(worst)
    }

    fn make_update(&self, previous_status: UsageLimitStatus, rolled_over: bool) -> UsageUpdate {
        UsageUpdate {
            previous_status,
            status: self.status,
            rolled_over,
            hourly_percentage: self.hourly_percentage(),
            daily_percentage: self.daily_percentage(),
        }
    }
}

fn fraction(used: u64, limit: u64) -> f64 {
    if limit == 0 {
        if used == 0 {
            0.0
        } else {
            f64::INFINITY
        }
    } else {
        used as f64 / limit as f64
    }
}
