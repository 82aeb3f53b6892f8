//! Delivery-window scheduling — turns "send after a 2-day delay" into a
//! concrete instant that respects weekdays, holidays, business hours, the
//! governing timezone, and account availability.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tracing::debug;
use uuid::Uuid;

use cadence_core::config::DeliveryConfig;
use cadence_core::types::{EmailAccount, ScheduleSettings};

use crate::rate_limit::RateController;

/// Result of a scheduling pass. Never an unbounded timestamp: when no
/// account or window can ever satisfy the send, the caller gets an explicit
/// refusal to surface to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled { at: DateTime<Utc>, account_id: Uuid },
    Unschedulable { reason: String },
}

/// Computes the next eligible send instant for a contact entering a step.
pub struct SchedulingEngine {
    rate: Arc<RateController>,
    horizon_days: i64,
}

impl SchedulingEngine {
    pub fn new(rate: Arc<RateController>, config: &DeliveryConfig) -> Self {
        Self {
            rate,
            horizon_days: config.horizon_days,
        }
    }

    /// Recipient zone when detection is on and the zone is known and valid,
    /// else the campaign default, else UTC.
    pub fn governing_timezone(&self, settings: &ScheduleSettings, recipient_tz: Option<&str>) -> Tz {
        if settings.timezone_detection {
            if let Some(tz) = recipient_tz.and_then(|name| name.parse::<Tz>().ok()) {
                return tz;
            }
        }
        settings.default_timezone.parse().unwrap_or(Tz::UTC)
    }

    /// Moves a candidate forward (never backward) until it lands on an
    /// allowed weekday, outside holidays, and inside the business-hours
    /// window, all in the governing zone. `None` when the horizon is
    /// exhausted (e.g. an empty weekday set).
    pub fn adjust_to_window(
        &self,
        candidate: DateTime<Utc>,
        settings: &ScheduleSettings,
        tz: Tz,
    ) -> Option<DateTime<Utc>> {
        let mut local = candidate.with_timezone(&tz);

        // Each rejected day advances at least to the next midnight, so the
        // horizon bounds the loop.
        for _ in 0..=self.horizon_days * 2 {
            let date = local.date_naive();

            if !day_allowed(settings, date)
                || (settings.avoid_holidays && settings.holiday_list.contains(&date))
            {
                local = at_hour(date + Duration::days(1), first_hour(settings), tz)?;
                continue;
            }

            if settings.business_hours_only {
                let hour = local.hour();
                let start = settings.business_hours_start;
                let end = settings.business_hours_end;
                let inside = if start <= end {
                    hour >= start && hour < end
                } else {
                    // Overnight window, e.g. 22 -> 6.
                    hour >= start || hour < end
                };
                if !inside {
                    local = if hour < start {
                        at_hour(date, start, tz)?
                    } else {
                        at_hour(date + Duration::days(1), start, tz)?
                    };
                    continue;
                }
            }

            return Some(local.with_timezone(&Utc));
        }
        None
    }

    /// Computes `nextSendAt` and the sending account for a contact whose
    /// prior step completed at `base` and whose next step carries
    /// `delay_hours`. With rotation enabled the account with the earliest
    /// availability wins; ties go to the least-used account.
    pub fn next_send_slot(
        &self,
        base: DateTime<Utc>,
        delay_hours: i64,
        settings: &ScheduleSettings,
        recipient_tz: Option<&str>,
        accounts: &[EmailAccount],
        domain: &str,
    ) -> ScheduleOutcome {
        let tz = self.governing_timezone(settings, recipient_tz);
        let mut candidate = base + Duration::hours(delay_hours);

        let enabled: Vec<&EmailAccount> = accounts.iter().filter(|a| a.enabled).collect();
        if enabled.is_empty() {
            return ScheduleOutcome::Unschedulable {
                reason: "no enabled sending accounts".to_string(),
            };
        }

        let pool: &[&EmailAccount] = if settings.rate_limiting.account_rotation {
            &enabled
        } else {
            std::slice::from_ref(&enabled[0])
        };

        // Bounded: every pass either schedules or moves the candidate
        // strictly forward to some account's availability.
        for _ in 0..32 {
            let Some(window) = self.adjust_to_window(candidate, settings, tz) else {
                return ScheduleOutcome::Unschedulable {
                    reason: format!("no delivery window within {} days", self.horizon_days),
                };
            };

            let mut best: Option<(DateTime<Utc>, &EmailAccount)> = None;
            for account in pool.iter().copied() {
                let Some(available) =
                    self.rate
                        .next_available(account, domain, &settings.rate_limiting, window)
                else {
                    continue;
                };
                let at = available.max(window);
                let better = match best {
                    None => true,
                    Some((best_at, best_account)) => {
                        at < best_at
                            || (at == best_at
                                && self.rate.account_usage(account.id, window)
                                    < self.rate.account_usage(best_account.id, window))
                    }
                };
                if better {
                    best = Some((at, account));
                }
            }

            let Some((at, account)) = best else {
                return ScheduleOutcome::Unschedulable {
                    reason: "no sending account will ever have headroom".to_string(),
                };
            };

            if at <= window {
                debug!(at = %window, account = %account.address, "Slot scheduled");
                return ScheduleOutcome::Scheduled {
                    at: window,
                    account_id: account.id,
                };
            }
            candidate = at;
        }

        ScheduleOutcome::Unschedulable {
            reason: "no schedulable slot found".to_string(),
        }
    }
}

fn day_allowed(settings: &ScheduleSettings, date: NaiveDate) -> bool {
    let dow = date.weekday().num_days_from_sunday() as u8;
    if !settings.business_days.is_empty() && !settings.business_days.contains(&dow) {
        return false;
    }
    if settings.avoid_weekends && (dow == 0 || dow == 6) {
        return false;
    }
    true
}

fn first_hour(settings: &ScheduleSettings) -> u32 {
    if settings.business_hours_only {
        settings.business_hours_start
    } else {
        0
    }
}

/// Local wall-clock instant, sliding forward past DST gaps.
fn at_hour(date: NaiveDate, hour: u32, tz: Tz) -> Option<DateTime<Tz>> {
    for h in hour..hour.saturating_add(3) {
        if let Some(naive) = date.and_hms_opt(h, 0, 0) {
            if let Some(local) = tz.from_local_datetime(&naive).earliest() {
                return Some(local);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::types::RateLimitSettings;

    fn engine() -> SchedulingEngine {
        SchedulingEngine::new(
            Arc::new(RateController::new(&DeliveryConfig::default())),
            &DeliveryConfig::default(),
        )
    }

    fn engine_with_rate(rate: Arc<RateController>) -> SchedulingEngine {
        SchedulingEngine::new(rate, &DeliveryConfig::default())
    }

    fn business_settings() -> ScheduleSettings {
        ScheduleSettings {
            business_hours_only: true,
            business_hours_start: 9,
            business_hours_end: 17,
            avoid_weekends: true,
            ..Default::default()
        }
    }

    fn account() -> EmailAccount {
        EmailAccount::new("out@relay.dev", "Relay", 500)
    }

    // 2026-03-06 is a Friday.
    fn friday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 6, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_candidate_inside_window_is_untouched() {
        let engine = engine();
        let adjusted = engine
            .adjust_to_window(friday_noon(), &business_settings(), Tz::UTC)
            .unwrap();
        assert_eq!(adjusted, friday_noon());
    }

    #[test]
    fn test_weekend_pushes_to_monday_opening() {
        let engine = engine();
        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap();
        let adjusted = engine
            .adjust_to_window(saturday, &business_settings(), Tz::UTC)
            .unwrap();
        assert_eq!(adjusted, Utc.with_ymd_and_hms(2026, 3, 9, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_after_hours_pushes_to_next_morning() {
        let engine = engine();
        let thursday_evening = Utc.with_ymd_and_hms(2026, 3, 5, 19, 30, 0).unwrap();
        let adjusted = engine
            .adjust_to_window(thursday_evening, &business_settings(), Tz::UTC)
            .unwrap();
        assert_eq!(adjusted, Utc.with_ymd_and_hms(2026, 3, 6, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_holiday_is_skipped() {
        let engine = engine();
        let mut settings = business_settings();
        settings.avoid_holidays = true;
        settings
            .holiday_list
            .push(NaiveDate::from_ymd_opt(2026, 3, 9).unwrap());

        let saturday = Utc.with_ymd_and_hms(2026, 3, 7, 10, 0, 0).unwrap();
        let adjusted = engine.adjust_to_window(saturday, &settings, Tz::UTC).unwrap();
        // Monday is a holiday, so Tuesday opening.
        assert_eq!(adjusted, Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_custom_business_days() {
        let engine = engine();
        let mut settings = business_settings();
        settings.avoid_weekends = false;
        // Tuesday and Thursday only.
        settings.business_days = vec![2, 4];

        let friday = friday_noon();
        let adjusted = engine.adjust_to_window(friday, &settings, Tz::UTC).unwrap();
        assert_eq!(adjusted, Utc.with_ymd_and_hms(2026, 3, 10, 9, 0, 0).unwrap());
    }

    #[test]
    fn test_business_hours_respect_timezone() {
        let engine = engine();
        let settings = business_settings();
        let tz: Tz = "America/New_York".parse().unwrap();

        // 01:00 UTC on Friday is Thursday 20:00 in New York, past close.
        let candidate = Utc.with_ymd_and_hms(2026, 3, 6, 1, 0, 0).unwrap();
        let adjusted = engine.adjust_to_window(candidate, &settings, tz).unwrap();
        // Friday 09:00 EST == 14:00 UTC.
        assert_eq!(adjusted, Utc.with_ymd_and_hms(2026, 3, 6, 14, 0, 0).unwrap());
    }

    #[test]
    fn test_recipient_timezone_governs_when_detected() {
        let engine = engine();
        let mut settings = business_settings();
        settings.timezone_detection = true;
        settings.default_timezone = "UTC".to_string();

        assert_eq!(
            engine.governing_timezone(&settings, Some("Europe/Berlin")),
            "Europe/Berlin".parse::<Tz>().unwrap()
        );
        // Unknown zone falls back to the campaign default.
        assert_eq!(engine.governing_timezone(&settings, Some("Mars/Olympus")), Tz::UTC);
        settings.timezone_detection = false;
        assert_eq!(engine.governing_timezone(&settings, Some("Europe/Berlin")), Tz::UTC);
    }

    #[test]
    fn test_delay_is_added_before_adjustment() {
        let engine = engine();
        let settings = ScheduleSettings::default();
        let accounts = [account()];

        let outcome = engine.next_send_slot(friday_noon(), 54, &settings, None, &accounts, "example.com");
        match outcome {
            ScheduleOutcome::Scheduled { at, account_id } => {
                assert_eq!(at, friday_noon() + Duration::hours(54));
                assert_eq!(account_id, accounts[0].id);
            }
            other => panic!("Expected Scheduled, got {:?}", other),
        }
    }

    #[test]
    fn test_no_enabled_accounts_is_unschedulable() {
        let engine = engine();
        let mut disabled = account();
        disabled.enabled = false;

        let outcome = engine.next_send_slot(
            friday_noon(),
            0,
            &ScheduleSettings::default(),
            None,
            &[disabled],
            "example.com",
        );
        assert!(matches!(outcome, ScheduleOutcome::Unschedulable { .. }));
    }

    #[test]
    fn test_rotation_prefers_account_with_headroom() {
        let rate = Arc::new(RateController::new(&DeliveryConfig::default()));
        let engine = engine_with_rate(rate.clone());

        let mut settings = ScheduleSettings::default();
        settings.rate_limiting = RateLimitSettings {
            daily_limit: 1,
            domain_limit: 100,
            account_rotation: true,
            ..Default::default()
        };

        let first = account();
        let second = account();
        let now = friday_noon();

        // Exhaust the first account for today.
        rate.try_acquire(&first, "example.com", &settings.rate_limiting, now);

        let outcome =
            engine.next_send_slot(now, 0, &settings, None, &[first.clone(), second.clone()], "example.com");
        match outcome {
            ScheduleOutcome::Scheduled { at, account_id } => {
                assert_eq!(at, now);
                assert_eq!(account_id, second.id);
            }
            other => panic!("Expected Scheduled, got {:?}", other),
        }
    }

    #[test]
    fn test_exhausted_accounts_roll_to_next_reset() {
        let rate = Arc::new(RateController::new(&DeliveryConfig::default()));
        let engine = engine_with_rate(rate.clone());

        let mut settings = ScheduleSettings::default();
        settings.rate_limiting = RateLimitSettings {
            daily_limit: 1,
            domain_limit: 100,
            account_rotation: false,
            ..Default::default()
        };

        let sender = account();
        let now = friday_noon();
        rate.try_acquire(&sender, "example.com", &settings.rate_limiting, now);

        let outcome = engine.next_send_slot(now, 0, &settings, None, &[sender.clone()], "example.com");
        match outcome {
            ScheduleOutcome::Scheduled { at, account_id } => {
                assert_eq!(account_id, sender.id);
                assert_eq!(at, rate.next_reset(now));
            }
            other => panic!("Expected Scheduled, got {:?}", other),
        }
    }
}
