//! Warmup ramps — progressive daily-limit increases for new sending
//! accounts, with a reputation safety valve.

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use cadence_core::config::WarmupConfig;
use cadence_core::types::{EmailAccount, WarmupStage};

/// Result of a warmup progression check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmupOutcome {
    /// Account entered week 1 of the ramp.
    Started { week: u32 },
    /// Advanced to the next week of the ladder.
    Advanced { week: u32 },
    /// In progress, criteria for advancing not yet met.
    Held,
    /// Safety valve tripped; stays paused until a manual resume.
    Paused,
    /// Ladder finished; the configured account limit governs alone.
    Completed,
    /// Warmup not running for this account.
    Inactive,
}

/// Applies the configured warmup ladder to accounts. Thresholds are
/// deployment policy (`WarmupConfig`), never constants baked in here.
pub struct WarmupEngine {
    config: WarmupConfig,
}

impl WarmupEngine {
    pub fn new(config: &WarmupConfig) -> Self {
        info!(
            weeks = config.weekly_limits.len(),
            max_bounce_rate = config.max_bounce_rate,
            max_complaint_rate = config.max_complaint_rate,
            "Warmup engine initialized"
        );
        Self {
            config: config.clone(),
        }
    }

    /// Daily limit for a 1-based ladder week, clamped to the final rung.
    pub fn limit_for_week(&self, week: u32) -> u32 {
        if self.config.weekly_limits.is_empty() {
            return u32::MAX;
        }
        let index = (week.max(1) as usize - 1).min(self.config.weekly_limits.len() - 1);
        self.config.weekly_limits[index]
    }

    /// Put an account at the bottom of the ladder.
    pub fn start(&self, account: &mut EmailAccount, now: DateTime<Utc>) -> WarmupOutcome {
        account.warmup.stage = WarmupStage::InProgress;
        account.warmup.current_week = 1;
        account.warmup.current_daily_limit = self.limit_for_week(1);
        account.warmup.started_at = Some(now);
        account.warmup.week_started_at = Some(now);
        info!(account = %account.address, limit = account.warmup.current_daily_limit, "Warmup started");
        WarmupOutcome::Started { week: 1 }
    }

    /// Evaluate progression for the account: advance the week when enough
    /// days have elapsed and reputation is clean, pause when the bounce or
    /// complaint rate breaches its ceiling. A paused ramp never resumes on
    /// its own.
    pub fn evaluate_progression(&self, account: &mut EmailAccount, now: DateTime<Utc>) -> WarmupOutcome {
        match account.warmup.stage {
            WarmupStage::NotStarted => WarmupOutcome::Inactive,
            WarmupStage::Paused => WarmupOutcome::Paused,
            WarmupStage::Completed => WarmupOutcome::Completed,
            WarmupStage::InProgress => {
                if self.reputation_breached(account) {
                    warn!(
                        account = %account.address,
                        bounce_rate = account.bounce_rate(),
                        complaint_rate = account.complaint_rate(),
                        "Warmup paused: reputation over threshold"
                    );
                    account.warmup.stage = WarmupStage::Paused;
                    return WarmupOutcome::Paused;
                }

                let week_started = account.warmup.week_started_at.unwrap_or(now);
                if now - week_started < Duration::days(self.config.min_days_per_week) {
                    return WarmupOutcome::Held;
                }

                if account.warmup.current_week as usize >= self.config.weekly_limits.len() {
                    account.warmup.stage = WarmupStage::Completed;
                    account.warmup.current_daily_limit = account.daily_send_limit;
                    info!(account = %account.address, "Warmup completed");
                    return WarmupOutcome::Completed;
                }

                account.warmup.current_week += 1;
                account.warmup.week_started_at = Some(now);
                account.warmup.current_daily_limit = self.limit_for_week(account.warmup.current_week);
                info!(
                    account = %account.address,
                    week = account.warmup.current_week,
                    limit = account.warmup.current_daily_limit,
                    "Warmup advanced"
                );
                WarmupOutcome::Advanced {
                    week: account.warmup.current_week,
                }
            }
        }
    }

    /// Operator-initiated resume after a pause. Restarts the current week's
    /// clock; the ladder position is kept.
    pub fn resume(&self, account: &mut EmailAccount, now: DateTime<Utc>) -> bool {
        if account.warmup.stage != WarmupStage::Paused {
            return false;
        }
        account.warmup.stage = WarmupStage::InProgress;
        account.warmup.week_started_at = Some(now);
        info!(account = %account.address, week = account.warmup.current_week, "Warmup resumed");
        true
    }

    fn reputation_breached(&self, account: &EmailAccount) -> bool {
        account.bounce_rate() > self.config.max_bounce_rate
            || account.complaint_rate() > self.config.max_complaint_rate
    }
}
