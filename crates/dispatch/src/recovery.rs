//! Stalled-job reconciler — finds contacts whose in-flight attempt stopped
//! making progress, resumes each exactly once, and hard-fails the ones that
//! stay stuck past the long threshold.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use cadence_core::clock::Clock;
use cadence_core::config::RecoveryConfig;
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{ContactStatus, EventType};
use cadence_sequence::ContactStateMachine;

use crate::store::OutreachStore;
use crate::worker::DispatchWorker;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub resumed: usize,
    pub hard_failed: usize,
}

pub struct Reconciler {
    store: Arc<dyn OutreachStore>,
    worker: Arc<DispatchWorker>,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: RecoveryConfig,
}

impl Reconciler {
    pub fn new(
        config: &RecoveryConfig,
        store: Arc<dyn OutreachStore>,
        worker: Arc<DispatchWorker>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            worker,
            clock,
            events: cadence_core::event_bus::noop_sink(),
            config: config.clone(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub async fn run(self: Arc<Self>) {
        info!(
            scan_interval_secs = self.config.scan_interval_secs,
            "Reconciler loop started"
        );
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.scan_interval_secs));
        loop {
            interval.tick().await;
            let summary = self.scan().await;
            if summary.resumed > 0 || summary.hard_failed > 0 {
                info!(
                    resumed = summary.resumed,
                    hard_failed = summary.hard_failed,
                    "Reconciler pass complete"
                );
            }
        }
    }

    /// One reconciliation pass over stalled in-flight contacts.
    pub async fn scan(&self) -> RecoverySummary {
        let now = self.clock.now();
        let stale_cutoff = now - Duration::seconds(self.config.stale_after_secs);
        let fail_cutoff = now - Duration::seconds(self.config.fail_after_secs);

        let mut summary = RecoverySummary::default();
        for contact in self.store.stale_in_flight(stale_cutoff) {
            if contact.status.is_terminal() {
                continue;
            }
            if contact.last_activity_at <= fail_cutoff {
                self.hard_fail(contact.id, contact.campaign_id, now);
                summary.hard_failed += 1;
                continue;
            }
            // One resume at a time per contact, across reconciler instances.
            if !self.store.claim_recovery(contact.id) {
                continue;
            }
            match self.worker.resume_contact(contact.id).await {
                Ok(outcome) => {
                    info!(contact_id = %contact.id, ?outcome, "Stalled contact resumed");
                    self.events.emit(make_event(
                        EventType::ContactRecovered,
                        Some(contact.campaign_id),
                        Some(contact.id),
                        None,
                    ));
                    summary.resumed += 1;
                }
                Err(error) => {
                    warn!(contact_id = %contact.id, error = %error, "Resume attempt failed");
                }
            }
            self.store.release_recovery(contact.id);
        }

        metrics::counter!("cadence.recovered").increment(summary.resumed as u64);
        summary
    }

    /// Past the long threshold the contact is parked as failed for the
    /// operator instead of being retried forever.
    fn hard_fail(&self, contact_id: uuid::Uuid, campaign_id: uuid::Uuid, now: DateTime<Utc>) {
        warn!(contact_id = %contact_id, "In-flight contact stalled past hard threshold, failing");
        let result = self.store.update_contact(contact_id, &mut |c| {
            if let Some(message_id) = c.in_flight_message.take() {
                let _ = self
                    .store
                    .update_tracking(&message_id, &mut |r| r.mark_failed("stalled in flight"));
            }
            if ContactStateMachine::can_transition(c.status, ContactStatus::Failed) {
                c.status = ContactStatus::Failed;
            }
            c.next_send_at = None;
            c.recovering = false;
            c.completed_at = Some(now);
            c.last_activity_at = now;
        });
        if result.is_ok() {
            self.events.emit(make_event(
                EventType::ContactFailed,
                Some(campaign_id),
                Some(contact_id),
                Some("stalled in flight".to_string()),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::{BlackholeSender, EmailSender};
    use crate::store::MemoryStore;
    use cadence_core::clock::ManualClock;
    use cadence_core::config::AppConfig;
    use cadence_core::types::{
        CampaignContact, CampaignStatus, EmailAccount, ScheduleSettings, TrackingRecord,
        TrackingStatus,
    };
    use cadence_sequence::types::Campaign;
    use cadence_sequence::SequenceStep;
    use chrono::TimeZone;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        reconciler: Reconciler,
        clock: Arc<ManualClock>,
        campaign_id: Uuid,
        account_id: Uuid,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap(),
        ));
        let mut config = AppConfig::default();
        config.worker.jitter_max_ms = 0;
        config.worker.jitter_min_ms = 0;

        let account = EmailAccount::new("out@relay.dev", "Relay", 500);
        let account_id = account.id;
        store.upsert_account(account);

        let mut campaign = Campaign::draft(
            "recovery",
            vec![
                SequenceStep::new(1, "s1", "b1"),
                SequenceStep::new(2, "s2", "b2").with_delay(1, 0),
            ],
            ScheduleSettings::default(),
        );
        campaign.status = CampaignStatus::Sending;
        let campaign_id = campaign.id;
        store.insert_campaign(campaign);

        let worker = Arc::new(DispatchWorker::new(
            &config,
            store.clone() as Arc<dyn OutreachStore>,
            Arc::new(BlackholeSender) as Arc<dyn EmailSender>,
            clock.clone() as Arc<dyn Clock>,
        ));
        let reconciler = Reconciler::new(
            &config.recovery,
            store.clone() as Arc<dyn OutreachStore>,
            worker,
            clock.clone() as Arc<dyn Clock>,
        );

        Fixture {
            store,
            reconciler,
            clock,
            campaign_id,
            account_id,
        }
    }

    /// Contact stuck with a pending attempt, last touched at `stalled_at`.
    fn stall_contact(f: &Fixture, stalled_at: chrono::DateTime<Utc>) -> (Uuid, String) {
        let mut contact =
            CampaignContact::new(f.campaign_id, Uuid::new_v4(), "ada@example.com", stalled_at);
        contact.next_send_at = Some(stalled_at);
        contact.last_activity_at = stalled_at;
        let contact_id = contact.id;
        f.store.insert_contact(contact);

        let record =
            TrackingRecord::pending(f.campaign_id, contact_id, f.account_id, 1, stalled_at);
        let message_id = record.message_id.clone();
        f.store.insert_tracking(record).unwrap();
        f.store.claim_in_flight(contact_id, &message_id).unwrap();
        (contact_id, message_id)
    }

    #[tokio::test]
    async fn test_fresh_in_flight_is_left_alone() {
        let f = fixture();
        let (contact_id, _) = stall_contact(&f, f.clock.now() - Duration::seconds(30));

        let summary = f.reconciler.scan().await;
        assert_eq!(summary, RecoverySummary::default());
        assert!(f.store.contact(contact_id).unwrap().in_flight_message.is_some());
    }

    #[tokio::test]
    async fn test_stalled_pending_attempt_is_retried() {
        let f = fixture();
        let (contact_id, message_id) = stall_contact(&f, f.clock.now() - Duration::seconds(300));

        let summary = f.reconciler.scan().await;
        assert_eq!(summary.resumed, 1);

        // Unknown outcome: the attempt is written off and retried later.
        let record = f.store.tracking(&message_id).unwrap();
        assert_eq!(record.status, TrackingStatus::Failed);

        let contact = f.store.contact(contact_id).unwrap();
        assert!(contact.in_flight_message.is_none());
        assert!(!contact.recovering);
        assert_eq!(contact.attempts, 1);
        assert!(contact.next_send_at.unwrap() > f.clock.now());
    }

    #[tokio::test]
    async fn test_stalled_sent_attempt_advances_without_resend() {
        let f = fixture();
        let stalled_at = f.clock.now() - Duration::seconds(300);
        let (contact_id, message_id) = stall_contact(&f, stalled_at);
        f.store
            .update_tracking(&message_id, &mut |r| r.mark_sent(stalled_at))
            .unwrap();

        let summary = f.reconciler.scan().await;
        assert_eq!(summary.resumed, 1);

        let contact = f.store.contact(contact_id).unwrap();
        assert_eq!(contact.current_step, 2);
        assert!(contact.in_flight_message.is_none());
    }

    #[tokio::test]
    async fn test_long_stall_hard_fails() {
        let f = fixture();
        let (contact_id, message_id) = stall_contact(&f, f.clock.now() - Duration::seconds(3600));

        let summary = f.reconciler.scan().await;
        assert_eq!(summary.hard_failed, 1);
        assert_eq!(summary.resumed, 0);

        let contact = f.store.contact(contact_id).unwrap();
        assert_eq!(contact.status, ContactStatus::Failed);
        assert_eq!(contact.next_send_at, None);
        assert_eq!(
            f.store.tracking(&message_id).unwrap().status,
            TrackingStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_recovery_claim_blocks_double_resume() {
        let f = fixture();
        let (contact_id, _) = stall_contact(&f, f.clock.now() - Duration::seconds(300));

        // Another reconciler instance already owns the contact.
        assert!(f.store.claim_recovery(contact_id));
        let summary = f.reconciler.scan().await;
        assert_eq!(summary.resumed, 0);

        f.store.release_recovery(contact_id);
        let summary = f.reconciler.scan().await;
        assert_eq!(summary.resumed, 1);
    }
}
