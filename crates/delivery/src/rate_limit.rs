//! Daily send budgets — answers "can this account send one more message to
//! this domain right now, and if not, when can it".
//!
//! Counters are date-stamped in a reference timezone. The midnight reset is
//! an external cron-style trigger (`reset_daily_counters`); a counter whose
//! stamp predates today is stale and counts as zero, so a late or missed
//! reset never blocks or over-permits sending.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use cadence_core::config::DeliveryConfig;
use cadence_core::types::{EmailAccount, RateLimitSettings};

#[derive(Debug, Clone, Copy)]
struct DailyCounter {
    date: NaiveDate,
    count: u32,
}

/// Whether a send may proceed, and when to retry if not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Permitted,
    AccountExhausted { retry_at: DateTime<Utc> },
    DomainExhausted { retry_at: DateTime<Utc> },
    AccountDisabled,
}

impl RateDecision {
    pub fn is_permitted(&self) -> bool {
        matches!(self, RateDecision::Permitted)
    }
}

/// Shared send-budget counters. Check-and-increment happens under the map's
/// entry lock, so two concurrent lanes can never both consume the last slot.
pub struct RateController {
    reference_tz: Tz,
    accounts: DashMap<Uuid, DailyCounter>,
    domains: DashMap<String, DailyCounter>,
    last_reset: std::sync::Mutex<NaiveDate>,
}

impl RateController {
    pub fn new(config: &DeliveryConfig) -> Self {
        let reference_tz: Tz = config.reference_timezone.parse().unwrap_or_else(|_| {
            warn!(
                timezone = %config.reference_timezone,
                "Unknown reference timezone, falling back to UTC"
            );
            Tz::UTC
        });
        let today = Utc::now().with_timezone(&reference_tz).date_naive();
        Self {
            reference_tz,
            accounts: DashMap::new(),
            domains: DashMap::new(),
            last_reset: std::sync::Mutex::new(today),
        }
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.reference_tz).date_naive()
    }

    /// Next counter-reset boundary: the upcoming midnight in the reference
    /// zone.
    pub fn next_reset(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tomorrow = self.today(now) + chrono::Duration::days(1);
        let midnight = tomorrow.and_hms_opt(0, 0, 0).unwrap_or_default();
        match self.reference_tz.from_local_datetime(&midnight).earliest() {
            Some(at) => at.with_timezone(&Utc),
            None => now + chrono::Duration::days(1),
        }
    }

    /// Atomically consume one send slot for the account and the recipient
    /// domain, or report which budget refused.
    pub fn try_acquire(
        &self,
        account: &EmailAccount,
        domain: &str,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> RateDecision {
        if !account.enabled {
            return RateDecision::AccountDisabled;
        }

        let today = self.today(now);
        let account_limit = account.effective_daily_limit().min(limits.daily_limit);

        // Lock order is always account then domain, so concurrent acquires
        // cannot deadlock.
        let mut account_entry = self.accounts.entry(account.id).or_insert(DailyCounter {
            date: today,
            count: 0,
        });
        if account_entry.date != today {
            account_entry.date = today;
            account_entry.count = 0;
        }
        if account_entry.count >= account_limit {
            drop(account_entry);
            return RateDecision::AccountExhausted {
                retry_at: self.next_reset(now),
            };
        }

        let mut domain_entry = self.domains.entry(domain.to_string()).or_insert(DailyCounter {
            date: today,
            count: 0,
        });
        if domain_entry.date != today {
            domain_entry.date = today;
            domain_entry.count = 0;
        }
        if domain_entry.count >= limits.domain_limit {
            drop(domain_entry);
            drop(account_entry);
            return RateDecision::DomainExhausted {
                retry_at: self.next_reset(now),
            };
        }

        account_entry.count += 1;
        domain_entry.count += 1;
        RateDecision::Permitted
    }

    /// Read-only headroom check; does not consume a slot.
    pub fn has_headroom(
        &self,
        account: &EmailAccount,
        domain: &str,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> bool {
        if !account.enabled {
            return false;
        }
        let today = self.today(now);
        let account_limit = account.effective_daily_limit().min(limits.daily_limit);
        if account_limit == 0 || limits.domain_limit == 0 {
            return false;
        }

        let account_used = self
            .accounts
            .get(&account.id)
            .filter(|c| c.date == today)
            .map(|c| c.count)
            .unwrap_or(0);
        if account_used >= account_limit {
            return false;
        }

        let domain_used = self
            .domains
            .get(domain)
            .filter(|c| c.date == today)
            .map(|c| c.count)
            .unwrap_or(0);
        domain_used < limits.domain_limit
    }

    /// Earliest instant at or after `now` when the account could send to the
    /// domain. `None` means never (disabled account or a zero limit).
    pub fn next_available(
        &self,
        account: &EmailAccount,
        domain: &str,
        limits: &RateLimitSettings,
        now: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        if !account.enabled {
            return None;
        }
        if account.effective_daily_limit().min(limits.daily_limit) == 0 || limits.domain_limit == 0 {
            return None;
        }
        if self.has_headroom(account, domain, limits, now) {
            Some(now)
        } else {
            Some(self.next_reset(now))
        }
    }

    /// Sends consumed by the account today.
    pub fn account_usage(&self, account_id: Uuid, now: DateTime<Utc>) -> u32 {
        let today = self.today(now);
        self.accounts
            .get(&account_id)
            .filter(|c| c.date == today)
            .map(|c| c.count)
            .unwrap_or(0)
    }

    /// Cron-driven day-boundary reset.
    pub fn reset_daily_counters(&self, now: DateTime<Utc>) {
        let today = self.today(now);
        for mut entry in self.accounts.iter_mut() {
            entry.date = today;
            entry.count = 0;
        }
        for mut entry in self.domains.iter_mut() {
            entry.date = today;
            entry.count = 0;
        }
    }

    /// Periodic entry point for the reset trigger: resets only when the
    /// reference-zone date has rolled since the last reset, so it is safe
    /// to call on any cadence.
    pub fn roll_day(&self, now: DateTime<Utc>) -> bool {
        let today = self.today(now);
        if let Ok(mut last) = self.last_reset.lock() {
            if *last == today {
                return false;
            }
            *last = today;
        }
        self.reset_daily_counters(now);
        true
    }
}
