//! Engagement ingestion — resolves provider webhook events (delivered,
//! opened, clicked, replied, bounced, complained, unsubscribed) against
//! tracking records, escalates contact status, and feeds account
//! reputation counters.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{ContactStatus, EventType};
use cadence_core::{CadenceError, CadenceResult};
use cadence_sequence::ContactStateMachine;

use crate::store::OutreachStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngagementEvent {
    Delivered,
    Opened,
    Clicked,
    Replied,
    Bounced { reason: String },
    Complained,
    Unsubscribed,
}

impl EngagementEvent {
    fn label(&self) -> &'static str {
        match self {
            EngagementEvent::Delivered => "delivered",
            EngagementEvent::Opened => "opened",
            EngagementEvent::Clicked => "clicked",
            EngagementEvent::Replied => "replied",
            EngagementEvent::Bounced { .. } => "bounced",
            EngagementEvent::Complained => "complained",
            EngagementEvent::Unsubscribed => "unsubscribed",
        }
    }
}

pub struct EngagementIngest {
    store: Arc<dyn OutreachStore>,
    events: Arc<dyn EventSink>,
}

impl EngagementIngest {
    pub fn new(store: Arc<dyn OutreachStore>) -> Self {
        Self {
            store,
            events: cadence_core::event_bus::noop_sink(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Apply one engagement event to the attempt it belongs to. Timestamps
    /// are set at most once; out-of-order or repeated webhooks are dropped
    /// silently at the field level.
    pub fn record(
        &self,
        message_id: &str,
        event: EngagementEvent,
        at: DateTime<Utc>,
    ) -> CadenceResult<()> {
        let record = self
            .store
            .tracking(message_id)
            .ok_or_else(|| CadenceError::Store(format!("no tracking record for {message_id}")))?;

        debug!(message_id, kind = event.label(), "Recording engagement");

        self.store.update_tracking(message_id, &mut |r| match &event {
            EngagementEvent::Delivered => {
                if r.delivered_at.is_none() {
                    r.delivered_at = Some(at);
                }
            }
            EngagementEvent::Opened => {
                if r.opened_at.is_none() {
                    r.opened_at = Some(at);
                }
            }
            EngagementEvent::Clicked => {
                if r.clicked_at.is_none() {
                    r.clicked_at = Some(at);
                }
            }
            EngagementEvent::Replied => {
                if r.replied_at.is_none() {
                    r.replied_at = Some(at);
                }
            }
            EngagementEvent::Bounced { reason } => {
                r.mark_bounced(reason.clone(), at);
            }
            EngagementEvent::Complained => {
                if r.complained_at.is_none() {
                    r.complained_at = Some(at);
                }
            }
            EngagementEvent::Unsubscribed => {
                if r.unsubscribed_at.is_none() {
                    r.unsubscribed_at = Some(at);
                }
            }
        })?;

        self.apply_to_contact(&event, record.contact_id, at)?;
        self.apply_to_account(&event, record.account_id)?;

        self.events.emit(make_event(
            EventType::EngagementRecorded,
            Some(record.campaign_id),
            Some(record.contact_id),
            Some(event.label().to_string()),
        ));
        Ok(())
    }

    fn apply_to_contact(
        &self,
        event: &EngagementEvent,
        contact_id: uuid::Uuid,
        at: DateTime<Utc>,
    ) -> CadenceResult<()> {
        let target = match event {
            EngagementEvent::Delivered => ContactStatus::Delivered,
            EngagementEvent::Opened => ContactStatus::Opened,
            EngagementEvent::Clicked => ContactStatus::Clicked,
            EngagementEvent::Replied => ContactStatus::Replied,
            EngagementEvent::Bounced { .. } => ContactStatus::Bounced,
            EngagementEvent::Complained => ContactStatus::Complained,
            EngagementEvent::Unsubscribed => ContactStatus::Unsubscribed,
        };

        self.store.update_contact(contact_id, &mut |contact| {
            if target.is_terminal() {
                if ContactStateMachine::can_transition(contact.status, target) {
                    contact.status = target;
                    contact.next_send_at = None;
                    contact.completed_at = Some(at);
                } else {
                    warn!(
                        contact_id = %contact_id,
                        from = ?contact.status,
                        to = ?target,
                        "Dropping terminal engagement on settled contact"
                    );
                }
            } else {
                let mut machine = ContactStateMachine::new(contact.status);
                if machine.escalate(target) {
                    contact.status = machine.state;
                }
            }
            contact.last_activity_at = at;
        })
    }

    fn apply_to_account(&self, event: &EngagementEvent, account_id: uuid::Uuid) -> CadenceResult<()> {
        match event {
            EngagementEvent::Bounced { .. } => {
                self.store
                    .update_account(account_id, &mut |a| a.total_bounced += 1)
            }
            EngagementEvent::Complained => {
                self.store
                    .update_account(account_id, &mut |a| a.total_complained += 1)
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use cadence_core::types::{
        CampaignContact, CampaignStatus, EmailAccount, ScheduleSettings, TrackingRecord,
        TrackingStatus,
    };
    use cadence_sequence::types::Campaign;
    use cadence_sequence::SequenceStep;
    use uuid::Uuid;

    struct Fixture {
        store: Arc<MemoryStore>,
        ingest: EngagementIngest,
        contact_id: Uuid,
        account_id: Uuid,
        message_id: String,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let now = Utc::now();

        let mut campaign = Campaign::draft(
            "t",
            vec![SequenceStep::new(1, "s", "b")],
            ScheduleSettings::default(),
        );
        campaign.status = CampaignStatus::Sending;
        let account = EmailAccount::new("out@relay.dev", "Relay", 100);
        let mut contact = CampaignContact::new(campaign.id, Uuid::new_v4(), "a@b.co", now);
        contact.status = ContactStatus::Sent;
        contact.next_send_at = Some(now + chrono::Duration::days(1));

        let mut record = TrackingRecord::pending(campaign.id, contact.id, account.id, 1, now);
        record.mark_sent(now);
        let message_id = record.message_id.clone();

        let contact_id = contact.id;
        let account_id = account.id;
        store.insert_campaign(campaign);
        store.upsert_account(account);
        store.insert_contact(contact);
        store.insert_tracking(record).unwrap();

        let ingest = EngagementIngest::new(store.clone() as Arc<dyn OutreachStore>);
        Fixture {
            store,
            ingest,
            contact_id,
            account_id,
            message_id,
        }
    }

    #[test]
    fn test_open_escalates_contact() {
        let f = fixture();
        let at = Utc::now();
        f.ingest
            .record(&f.message_id, EngagementEvent::Opened, at)
            .unwrap();

        let record = f.store.tracking(&f.message_id).unwrap();
        assert_eq!(record.opened_at, Some(at));
        assert_eq!(f.store.contact(f.contact_id).unwrap().status, ContactStatus::Opened);
    }

    #[test]
    fn test_duplicate_event_keeps_first_timestamp() {
        let f = fixture();
        let first = Utc::now();
        let second = first + chrono::Duration::hours(1);
        f.ingest
            .record(&f.message_id, EngagementEvent::Opened, first)
            .unwrap();
        f.ingest
            .record(&f.message_id, EngagementEvent::Opened, second)
            .unwrap();

        assert_eq!(f.store.tracking(&f.message_id).unwrap().opened_at, Some(first));
    }

    #[test]
    fn test_late_delivered_does_not_downgrade() {
        let f = fixture();
        let at = Utc::now();
        f.ingest
            .record(&f.message_id, EngagementEvent::Replied, at)
            .unwrap();
        f.ingest
            .record(&f.message_id, EngagementEvent::Delivered, at)
            .unwrap();

        let contact = f.store.contact(f.contact_id).unwrap();
        assert_eq!(contact.status, ContactStatus::Replied);
        // The tracking timestamp still lands.
        assert!(f.store.tracking(&f.message_id).unwrap().delivered_at.is_some());
    }

    #[test]
    fn test_bounce_terminates_and_counts_against_account() {
        let f = fixture();
        f.ingest
            .record(
                &f.message_id,
                EngagementEvent::Bounced {
                    reason: "550 no such user".into(),
                },
                Utc::now(),
            )
            .unwrap();

        let contact = f.store.contact(f.contact_id).unwrap();
        assert_eq!(contact.status, ContactStatus::Bounced);
        assert_eq!(contact.next_send_at, None);

        let record = f.store.tracking(&f.message_id).unwrap();
        assert_eq!(record.status, TrackingStatus::Bounced);

        assert_eq!(f.store.account(f.account_id).unwrap().total_bounced, 1);
    }

    #[test]
    fn test_unknown_message_id_errors() {
        let f = fixture();
        assert!(f
            .ingest
            .record("cad-missing", EngagementEvent::Opened, Utc::now())
            .is_err());
    }
}
