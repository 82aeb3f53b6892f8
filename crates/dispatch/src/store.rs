//! Storage seam for scheduling state. The worker talks to an
//! `OutreachStore` trait so deployments can back it with a transactional
//! database; `MemoryStore` is the in-process implementation whose per-entry
//! locks give the same read-check-write atomicity for a single node.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use cadence_core::types::{
    CampaignContact, CampaignStatus, EmailAccount, TrackingRecord,
};
use cadence_core::{CadenceError, CadenceResult};
use cadence_sequence::types::Campaign;
use cadence_sequence::EngagementSnapshot;

/// Persistence operations the dispatch worker and reconciler depend on.
///
/// Claim operations are compare-and-swap shaped: they must fail, not
/// overwrite, when another worker already holds the claim.
pub trait OutreachStore: Send + Sync {
    // Campaigns
    fn insert_campaign(&self, campaign: Campaign);
    fn campaign(&self, id: Uuid) -> Option<Campaign>;
    fn update_campaign_status(&self, id: Uuid, status: CampaignStatus) -> CadenceResult<()>;

    // Contacts
    fn insert_contact(&self, contact: CampaignContact);
    fn contact(&self, id: Uuid) -> Option<CampaignContact>;
    fn update_contact(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut CampaignContact),
    ) -> CadenceResult<()>;
    fn contacts_for_campaign(&self, campaign_id: Uuid) -> Vec<CampaignContact>;
    /// Contacts with `next_send_at <= now` whose campaign is `sending`,
    /// ascending by `next_send_at`.
    fn due_contacts(&self, now: DateTime<Utc>) -> Vec<CampaignContact>;
    /// In-flight contacts of `sending` campaigns with no activity since
    /// `cutoff`.
    fn stale_in_flight(&self, cutoff: DateTime<Utc>) -> Vec<CampaignContact>;
    /// Claim the contact's single in-flight slot. Fails when an attempt is
    /// already outstanding.
    fn claim_in_flight(&self, contact_id: Uuid, message_id: &str) -> CadenceResult<()>;
    /// Claim the contact for one recovery pass. Returns false when another
    /// reconciler already holds it.
    fn claim_recovery(&self, contact_id: Uuid) -> bool;
    fn release_recovery(&self, contact_id: Uuid);

    // Accounts
    fn upsert_account(&self, account: EmailAccount);
    fn account(&self, id: Uuid) -> Option<EmailAccount>;
    fn accounts(&self) -> Vec<EmailAccount>;
    fn update_account(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut EmailAccount),
    ) -> CadenceResult<()>;

    // Tracking
    fn insert_tracking(&self, record: TrackingRecord) -> CadenceResult<()>;
    fn tracking(&self, message_id: &str) -> Option<TrackingRecord>;
    fn update_tracking(
        &self,
        message_id: &str,
        apply: &mut dyn FnMut(&mut TrackingRecord),
    ) -> CadenceResult<()>;
    fn tracking_for_contact(&self, contact_id: Uuid) -> Vec<TrackingRecord>;

    /// Engagement signals for the given step, from its most recent attempt.
    fn engagement_snapshot(
        &self,
        contact: &CampaignContact,
        step_number: u32,
        now: DateTime<Utc>,
    ) -> EngagementSnapshot {
        let records = self.tracking_for_contact(contact.id);
        let record = records
            .iter()
            .filter(|r| r.step_number == step_number)
            .max_by_key(|r| r.created_at);

        match record {
            Some(r) => EngagementSnapshot {
                replied: r.replied_at.is_some(),
                opened: r.opened_at.is_some(),
                clicked: r.clicked_at.is_some(),
                hours_since_send: r
                    .sent_at
                    .map(|sent| (now - sent).num_hours())
                    .unwrap_or(0),
            },
            None => EngagementSnapshot {
                hours_since_send: contact
                    .last_step_sent_at
                    .map(|sent| (now - sent).num_hours())
                    .unwrap_or(0),
                ..Default::default()
            },
        }
    }
}

/// DashMap-backed store for single-node deployments and tests.
#[derive(Default)]
pub struct MemoryStore {
    campaigns: DashMap<Uuid, Campaign>,
    contacts: DashMap<Uuid, CampaignContact>,
    accounts: DashMap<Uuid, EmailAccount>,
    tracking: DashMap<String, TrackingRecord>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutreachStore for MemoryStore {
    fn insert_campaign(&self, campaign: Campaign) {
        self.campaigns.insert(campaign.id, campaign);
    }

    fn campaign(&self, id: Uuid) -> Option<Campaign> {
        self.campaigns.get(&id).map(|c| c.clone())
    }

    fn update_campaign_status(&self, id: Uuid, status: CampaignStatus) -> CadenceResult<()> {
        let mut campaign = self
            .campaigns
            .get_mut(&id)
            .ok_or_else(|| CadenceError::Store(format!("campaign {id} not found")))?;
        campaign.status = status;
        campaign.updated_at = Utc::now();
        Ok(())
    }

    fn insert_contact(&self, contact: CampaignContact) {
        self.contacts.insert(contact.id, contact);
    }

    fn contact(&self, id: Uuid) -> Option<CampaignContact> {
        self.contacts.get(&id).map(|c| c.clone())
    }

    fn update_contact(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut CampaignContact),
    ) -> CadenceResult<()> {
        let mut contact = self
            .contacts
            .get_mut(&id)
            .ok_or_else(|| CadenceError::Store(format!("contact {id} not found")))?;
        apply(&mut contact);
        Ok(())
    }

    fn contacts_for_campaign(&self, campaign_id: Uuid) -> Vec<CampaignContact> {
        self.contacts
            .iter()
            .filter(|c| c.campaign_id == campaign_id)
            .map(|c| c.clone())
            .collect()
    }

    fn due_contacts(&self, now: DateTime<Utc>) -> Vec<CampaignContact> {
        let mut due: Vec<CampaignContact> = self
            .contacts
            .iter()
            .filter(|c| {
                !c.status.is_terminal()
                    && c.next_send_at.map(|at| at <= now).unwrap_or(false)
                    && self
                        .campaigns
                        .get(&c.campaign_id)
                        .map(|campaign| campaign.status == CampaignStatus::Sending)
                        .unwrap_or(false)
            })
            .map(|c| c.clone())
            .collect();
        due.sort_by_key(|c| c.next_send_at);
        due
    }

    fn stale_in_flight(&self, cutoff: DateTime<Utc>) -> Vec<CampaignContact> {
        self.contacts
            .iter()
            .filter(|c| {
                c.in_flight_message.is_some()
                    && c.last_activity_at <= cutoff
                    && self
                        .campaigns
                        .get(&c.campaign_id)
                        .map(|campaign| campaign.status == CampaignStatus::Sending)
                        .unwrap_or(false)
            })
            .map(|c| c.clone())
            .collect()
    }

    fn claim_in_flight(&self, contact_id: Uuid, message_id: &str) -> CadenceResult<()> {
        let mut contact = self
            .contacts
            .get_mut(&contact_id)
            .ok_or_else(|| CadenceError::Store(format!("contact {contact_id} not found")))?;
        if let Some(existing) = &contact.in_flight_message {
            return Err(CadenceError::Store(format!(
                "contact {contact_id} already has attempt {existing} in flight"
            )));
        }
        contact.in_flight_message = Some(message_id.to_string());
        Ok(())
    }

    fn claim_recovery(&self, contact_id: Uuid) -> bool {
        match self.contacts.get_mut(&contact_id) {
            Some(mut contact) if !contact.recovering => {
                contact.recovering = true;
                true
            }
            _ => false,
        }
    }

    fn release_recovery(&self, contact_id: Uuid) {
        if let Some(mut contact) = self.contacts.get_mut(&contact_id) {
            contact.recovering = false;
        }
    }

    fn upsert_account(&self, account: EmailAccount) {
        self.accounts.insert(account.id, account);
    }

    fn account(&self, id: Uuid) -> Option<EmailAccount> {
        self.accounts.get(&id).map(|a| a.clone())
    }

    fn accounts(&self) -> Vec<EmailAccount> {
        self.accounts.iter().map(|a| a.clone()).collect()
    }

    fn update_account(
        &self,
        id: Uuid,
        apply: &mut dyn FnMut(&mut EmailAccount),
    ) -> CadenceResult<()> {
        let mut account = self
            .accounts
            .get_mut(&id)
            .ok_or_else(|| CadenceError::Store(format!("account {id} not found")))?;
        apply(&mut account);
        Ok(())
    }

    fn insert_tracking(&self, record: TrackingRecord) -> CadenceResult<()> {
        if self.tracking.contains_key(&record.message_id) {
            return Err(CadenceError::Store(format!(
                "duplicate message_id {}",
                record.message_id
            )));
        }
        self.tracking.insert(record.message_id.clone(), record);
        Ok(())
    }

    fn tracking(&self, message_id: &str) -> Option<TrackingRecord> {
        self.tracking.get(message_id).map(|r| r.clone())
    }

    fn update_tracking(
        &self,
        message_id: &str,
        apply: &mut dyn FnMut(&mut TrackingRecord),
    ) -> CadenceResult<()> {
        let mut record = self
            .tracking
            .get_mut(message_id)
            .ok_or_else(|| CadenceError::Store(format!("tracking {message_id} not found")))?;
        apply(&mut record);
        Ok(())
    }

    fn tracking_for_contact(&self, contact_id: Uuid) -> Vec<TrackingRecord> {
        self.tracking
            .iter()
            .filter(|r| r.contact_id == contact_id)
            .map(|r| r.clone())
            .collect()
    }
}
