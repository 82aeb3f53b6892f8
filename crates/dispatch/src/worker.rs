//! The dispatch worker — a repeating poll that turns due `next_send_at`
//! intents into send attempts, records tracking, and feeds the condition
//! evaluator's verdict back into the scheduler.
//!
//! One tick runs at a time per worker (lease with expiry, so a crashed tick
//! cannot wedge the loop). Within a tick, sends on the same account run
//! sequentially with jitter between them; different accounts run as
//! concurrent lanes.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};
use uuid::Uuid;

use cadence_core::clock::Clock;
use cadence_core::config::{AppConfig, WorkerConfig};
use cadence_core::event_bus::{make_event, EventSink};
use cadence_core::types::{
    CampaignContact, CampaignStatus, ContactStatus, EventType, TrackingRecord, TrackingStatus,
    WarmupStage,
};
use cadence_core::{CadenceError, CadenceResult};
use cadence_delivery::{
    RateController, ScheduleOutcome, SchedulingEngine, WarmupEngine, WarmupOutcome,
};
use cadence_sequence::types::Campaign;
use cadence_sequence::{ConditionEvaluator, ContactStateMachine, SequenceValidator, StepDecision};

use crate::render::{PassthroughRenderer, TemplateRenderer};
use crate::retry::RetryPolicy;
use crate::sender::{AccountCredentials, EmailSender, SendError, SendRequest};
use crate::store::OutreachStore;

/// Single-flight guard for the poll loop. Unlike a bare boolean, the lease
/// expires: a tick that died without releasing is stolen once its TTL
/// passes.
pub struct TickLease {
    expires_at: Mutex<Option<DateTime<Utc>>>,
}

impl TickLease {
    pub fn new() -> Self {
        Self {
            expires_at: Mutex::new(None),
        }
    }

    pub fn try_acquire(&self, now: DateTime<Utc>, ttl_secs: i64) -> bool {
        let mut slot = self.expires_at.lock();
        if let Some(expires) = *slot {
            if now < expires {
                return false;
            }
        }
        *slot = Some(now + Duration::seconds(ttl_secs));
        true
    }

    pub fn release(&self) {
        *self.expires_at.lock() = None;
    }
}

impl Default for TickLease {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-contact result of one dispatch pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactOutcome {
    Sent,
    /// An already-resolved attempt was finished without re-sending.
    Resumed,
    Retried,
    Failed,
    Rescheduled,
    Stopped,
    Completed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub skipped_tick: bool,
    pub processed: usize,
    pub sent: usize,
    pub retried: usize,
    pub failed: usize,
    pub rescheduled: usize,
    pub terminal: usize,
}

impl TickSummary {
    fn absorb(&mut self, outcome: ContactOutcome) {
        if outcome != ContactOutcome::Skipped {
            self.processed += 1;
        }
        match outcome {
            ContactOutcome::Sent => self.sent += 1,
            ContactOutcome::Retried => self.retried += 1,
            ContactOutcome::Failed => self.failed += 1,
            ContactOutcome::Rescheduled | ContactOutcome::Resumed => self.rescheduled += 1,
            ContactOutcome::Stopped | ContactOutcome::Completed => self.terminal += 1,
            ContactOutcome::Skipped => {}
        }
    }

    fn merge(&mut self, other: TickSummary) {
        self.processed += other.processed;
        self.sent += other.sent;
        self.retried += other.retried;
        self.failed += other.failed;
        self.rescheduled += other.rescheduled;
        self.terminal += other.terminal;
    }
}

/// Drives all campaign progress. Constructed with injected dependencies so
/// tests and multi-instance deployments build isolated workers.
pub struct DispatchWorker {
    store: Arc<dyn OutreachStore>,
    sender: Arc<dyn EmailSender>,
    renderer: Arc<dyn TemplateRenderer>,
    rate: Arc<RateController>,
    scheduler: SchedulingEngine,
    evaluator: ConditionEvaluator,
    validator: SequenceValidator,
    warmup: WarmupEngine,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    config: WorkerConfig,
    lease: TickLease,
}

impl DispatchWorker {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn OutreachStore>,
        sender: Arc<dyn EmailSender>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let rate = Arc::new(RateController::new(&config.delivery));
        Self {
            scheduler: SchedulingEngine::new(rate.clone(), &config.delivery),
            rate,
            evaluator: ConditionEvaluator::new(),
            validator: SequenceValidator::new(),
            warmup: WarmupEngine::new(&config.warmup),
            retry: RetryPolicy::new(&config.retry),
            renderer: Arc::new(PassthroughRenderer),
            events: cadence_core::event_bus::noop_sink(),
            config: config.worker.clone(),
            lease: TickLease::new(),
            store,
            sender,
            clock,
        }
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Plug in the personalization service.
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Shared counters, e.g. for the external midnight reset trigger.
    pub fn rate_controller(&self) -> Arc<RateController> {
        self.rate.clone()
    }

    // ------------------------------------------------------------------
    // Campaign lifecycle
    // ------------------------------------------------------------------

    /// Validate the sequence, seed per-contact scheduling state at step 1,
    /// and move the campaign to `sending`. Returns the number of contacts
    /// entered.
    pub fn launch_campaign(
        &self,
        campaign_id: Uuid,
        recipients: Vec<CampaignContact>,
    ) -> CadenceResult<usize> {
        let campaign = self
            .store
            .campaign(campaign_id)
            .ok_or_else(|| CadenceError::Store(format!("campaign {campaign_id} not found")))?;

        if !matches!(campaign.status, CampaignStatus::Draft | CampaignStatus::Scheduled) {
            return Err(CadenceError::Lifecycle(format!(
                "campaign {campaign_id} is {:?}, cannot launch",
                campaign.status
            )));
        }

        let report = self.validator.validate(&campaign.steps);
        if !report.valid {
            return Err(CadenceError::Validation(report.messages().join("; ")));
        }

        let now = self.clock.now();
        let accounts = self.store.accounts();

        // Schedule everyone before inserting anyone, so an unschedulable
        // campaign fails activation cleanly instead of half-launching.
        let mut seeded = Vec::with_capacity(recipients.len());
        for mut contact in recipients {
            contact.campaign_id = campaign_id;
            let outcome = self.scheduler.next_send_slot(
                now,
                0,
                &campaign.schedule,
                contact.timezone.as_deref(),
                &accounts,
                &contact.recipient_domain(),
            );
            match outcome {
                ScheduleOutcome::Scheduled { at, account_id } => {
                    contact.current_step = 1;
                    contact.next_send_at = Some(at);
                    contact.assigned_account = Some(account_id);
                    seeded.push(contact);
                }
                ScheduleOutcome::Unschedulable { reason } => {
                    return Err(CadenceError::Scheduling(reason));
                }
            }
        }

        let launched = seeded.len();
        for contact in seeded {
            self.store.insert_contact(contact);
        }
        self.store
            .update_campaign_status(campaign_id, CampaignStatus::Sending)?;
        self.events.emit(make_event(
            EventType::CampaignLaunched,
            Some(campaign_id),
            None,
            Some(format!("{launched} contacts")),
        ));
        info!(campaign_id = %campaign_id, contacts = launched, "Campaign launched");
        Ok(launched)
    }

    /// Stop scheduling new sends on the next tick. In-flight sends are not
    /// rolled back.
    pub fn pause_campaign(&self, campaign_id: Uuid) -> CadenceResult<()> {
        let campaign = self
            .store
            .campaign(campaign_id)
            .ok_or_else(|| CadenceError::Store(format!("campaign {campaign_id} not found")))?;
        if !matches!(campaign.status, CampaignStatus::Sending | CampaignStatus::Scheduled) {
            return Err(CadenceError::Lifecycle(format!(
                "campaign {campaign_id} is {:?}, cannot pause",
                campaign.status
            )));
        }
        self.store
            .update_campaign_status(campaign_id, CampaignStatus::Paused)?;
        self.events
            .emit(make_event(EventType::CampaignPaused, Some(campaign_id), None, None));
        info!(campaign_id = %campaign_id, "Campaign paused");
        Ok(())
    }

    pub fn resume_campaign(&self, campaign_id: Uuid) -> CadenceResult<()> {
        let campaign = self
            .store
            .campaign(campaign_id)
            .ok_or_else(|| CadenceError::Store(format!("campaign {campaign_id} not found")))?;
        if campaign.status != CampaignStatus::Paused {
            return Err(CadenceError::Lifecycle(format!(
                "campaign {campaign_id} is {:?}, cannot resume",
                campaign.status
            )));
        }
        self.store
            .update_campaign_status(campaign_id, CampaignStatus::Sending)?;
        self.events
            .emit(make_event(EventType::CampaignResumed, Some(campaign_id), None, None));
        info!(campaign_id = %campaign_id, "Campaign resumed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Poll loop
    // ------------------------------------------------------------------

    pub async fn run(self: Arc<Self>) {
        info!(
            poll_interval_secs = self.config.poll_interval_secs,
            "Dispatch worker loop started"
        );
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(self.config.poll_interval_secs));
        loop {
            interval.tick().await;
            let summary = self.tick().await;
            if summary.processed > 0 {
                info!(
                    sent = summary.sent,
                    retried = summary.retried,
                    failed = summary.failed,
                    terminal = summary.terminal,
                    "Tick complete"
                );
            }
        }
    }

    /// One dispatch pass. Skips (rather than queues) when the previous tick
    /// still holds the lease.
    pub async fn tick(&self) -> TickSummary {
        let now = self.clock.now();
        if !self.lease.try_acquire(now, self.config.lease_ttl_secs) {
            metrics::counter!("cadence.ticks_skipped").increment(1);
            debug!("Previous tick still holds the lease, skipping");
            return TickSummary {
                skipped_tick: true,
                ..Default::default()
            };
        }
        let summary = self.run_tick(now).await;
        self.lease.release();
        summary
    }

    async fn run_tick(&self, now: DateTime<Utc>) -> TickSummary {
        self.evaluate_warmups(now);

        let due = self.store.due_contacts(now);
        let mut summary = TickSummary::default();
        if due.is_empty() {
            return summary;
        }

        // Apply per-campaign batch caps; the overflow is pushed to the next
        // batch window rather than dropped.
        let mut taken: HashMap<Uuid, u32> = HashMap::new();
        let mut touched: Vec<Uuid> = Vec::new();
        let mut lanes: HashMap<Uuid, Vec<Uuid>> = HashMap::new();

        for contact in due {
            let Some(campaign) = self.store.campaign(contact.campaign_id) else {
                continue;
            };
            if campaign.status != CampaignStatus::Sending {
                continue;
            }
            if !touched.contains(&campaign.id) {
                touched.push(campaign.id);
            }

            let cap = campaign.schedule.rate_limiting.batch_size;
            let count = taken.entry(campaign.id).or_insert(0);
            if cap > 0 && *count >= cap {
                let delay =
                    Duration::minutes(i64::from(campaign.schedule.rate_limiting.batch_delay_minutes));
                let deferred = self.store.update_contact(contact.id, &mut |c| {
                    c.next_send_at = Some(now + delay);
                    c.last_activity_at = now;
                });
                if deferred.is_ok() {
                    summary.rescheduled += 1;
                }
                continue;
            }
            *count += 1;

            lanes
                .entry(contact.assigned_account.unwrap_or(Uuid::nil()))
                .or_default()
                .push(contact.id);
        }

        // One lane per account: sequential within, concurrent across.
        let lane_runs: Vec<_> = lanes
            .into_values()
            .map(|contact_ids| self.process_lane(contact_ids))
            .collect();
        for lane_summary in join_all(lane_runs).await {
            summary.merge(lane_summary);
        }

        for campaign_id in touched {
            self.finalize_campaign(campaign_id);
        }
        summary
    }

    async fn process_lane(&self, contact_ids: Vec<Uuid>) -> TickSummary {
        let mut summary = TickSummary::default();
        let mut first = true;
        for contact_id in contact_ids {
            if !first {
                self.jitter_pause().await;
            }
            first = false;
            match self.process_contact(contact_id).await {
                Ok(outcome) => summary.absorb(outcome),
                Err(error) => {
                    // One contact's failure never aborts the rest of the lane.
                    warn!(contact_id = %contact_id, error = %error, "Contact processing failed");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    async fn jitter_pause(&self) {
        let min = self.config.jitter_min_ms;
        let max = self.config.jitter_max_ms;
        if max == 0 {
            return;
        }
        let ms = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            max
        };
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
    }

    // ------------------------------------------------------------------
    // Per-contact dispatch
    // ------------------------------------------------------------------

    pub async fn process_contact(&self, contact_id: Uuid) -> anyhow::Result<ContactOutcome> {
        let now = self.clock.now();
        let Some(contact) = self.store.contact(contact_id) else {
            return Ok(ContactOutcome::Skipped);
        };
        let Some(campaign) = self.store.campaign(contact.campaign_id) else {
            return Ok(ContactOutcome::Skipped);
        };
        if campaign.status != CampaignStatus::Sending || contact.status.is_terminal() {
            return Ok(ContactOutcome::Skipped);
        }
        if !contact.next_send_at.map(|at| at <= now).unwrap_or(false) {
            return Ok(ContactOutcome::Skipped);
        }

        // An outstanding attempt is settled before anything new happens.
        if let Some(message_id) = contact.in_flight_message.clone() {
            return self.resolve_in_flight(&campaign, &contact, &message_id, now);
        }

        // Re-check the prior step's conditions against fresh engagement: a
        // reply that arrived during the delay stops the sequence before
        // this email, not after it.
        if let Some(previous) = contact.previous_step {
            let snapshot = self.store.engagement_snapshot(&contact, previous, now);
            match self.evaluator.decide(&campaign.steps, previous, &snapshot) {
                StepDecision::Stop => {
                    self.stop_contact(&campaign, contact_id, now)?;
                    return Ok(ContactOutcome::Stopped);
                }
                StepDecision::Complete => {
                    self.complete_contact(&campaign, contact_id, now)?;
                    return Ok(ContactOutcome::Completed);
                }
                StepDecision::Next { step, .. } if step != contact.current_step => {
                    // Fresh signals re-routed the contact; reschedule from
                    // the prior step's completion.
                    let base = contact.last_step_sent_at.unwrap_or(now);
                    self.schedule_step(&campaign, contact_id, step, base, now)?;
                    return Ok(ContactOutcome::Rescheduled);
                }
                StepDecision::Next { .. } => {}
            }
        }

        let Some(step) = campaign.step(contact.current_step) else {
            self.complete_contact(&campaign, contact_id, now)?;
            return Ok(ContactOutcome::Completed);
        };
        let step = step.clone();

        let Some(account) = contact.assigned_account.and_then(|id| self.store.account(id)) else {
            self.reschedule_current(&campaign, &contact, now)?;
            return Ok(ContactOutcome::Rescheduled);
        };

        // Headroom may have evaporated since scheduling; re-check and
        // consume the slot atomically.
        let domain = contact.recipient_domain();
        let decision = self
            .rate
            .try_acquire(&account, &domain, &campaign.schedule.rate_limiting, now);
        if !decision.is_permitted() {
            debug!(
                contact_id = %contact_id,
                account = %account.address,
                ?decision,
                "No send budget at dispatch time, rescheduling"
            );
            self.reschedule_current(&campaign, &contact, now)?;
            return Ok(ContactOutcome::Rescheduled);
        }

        // The tracking record exists before the transport is invoked.
        let record = TrackingRecord::pending(campaign.id, contact.id, account.id, step.step_number, now);
        let message_id = record.message_id.clone();
        self.store.insert_tracking(record)?;
        if let Err(error) = self.store.claim_in_flight(contact.id, &message_id) {
            // Another worker claimed the contact between our read and now.
            debug!(contact_id = %contact_id, error = %error, "Lost in-flight claim, skipping");
            self.store
                .update_tracking(&message_id, &mut |r| r.mark_failed("superseded before send"))?;
            return Ok(ContactOutcome::Skipped);
        }

        let (subject, html_body) = self.renderer.render(&step, &contact);
        let request = SendRequest {
            message_id: message_id.clone(),
            to: contact.email.clone(),
            subject,
            html_body,
            account: AccountCredentials::from(&account),
        };

        let send_timeout = std::time::Duration::from_secs(self.config.send_timeout_secs);
        let result = match tokio::time::timeout(send_timeout, self.sender.send(&request)).await {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout),
        };
        let resolved_at = self.clock.now();

        match result {
            Ok(receipt) => {
                metrics::counter!("cadence.emails_sent").increment(1);
                self.store.update_tracking(&message_id, &mut |r| {
                    r.mark_sent(resolved_at);
                    if r.delivered_at.is_none() {
                        r.delivered_at = Some(resolved_at);
                    }
                })?;
                self.store
                    .update_account(account.id, &mut |a| a.total_sent += 1)?;
                self.store.update_contact(contact_id, &mut |c| {
                    if ContactStateMachine::can_transition(c.status, ContactStatus::Sent) {
                        c.status = ContactStatus::Sent;
                    }
                    c.last_step_sent_at = Some(resolved_at);
                    c.attempts = 0;
                    c.in_flight_message = None;
                    c.last_activity_at = resolved_at;
                })?;
                info!(
                    contact_id = %contact_id,
                    step = step.step_number,
                    message_id = %message_id,
                    provider_id = ?receipt.provider_message_id,
                    "Email sent"
                );
                self.events.emit(make_event(
                    EventType::EmailSent,
                    Some(campaign.id),
                    Some(contact_id),
                    Some(format!("step {}", step.step_number)),
                ));
                self.advance_after_send(&campaign, contact_id, step.step_number, resolved_at)?;
                Ok(ContactOutcome::Sent)
            }
            Err(error) if error.is_transient() => {
                metrics::counter!("cadence.emails_failed", "kind" => "transient").increment(1);
                self.store
                    .update_tracking(&message_id, &mut |r| r.mark_failed(error.to_string()))?;
                self.events.emit(make_event(
                    EventType::EmailFailed,
                    Some(campaign.id),
                    Some(contact_id),
                    Some(error.to_string()),
                ));
                self.retry_or_fail(&campaign, contact_id, contact.attempts + 1, resolved_at, &error)
            }
            Err(error) => {
                metrics::counter!("cadence.emails_failed", "kind" => "permanent").increment(1);
                let bounced = matches!(
                    error,
                    SendError::InvalidRecipient(_) | SendError::HardBounce(_)
                );
                if bounced {
                    self.store.update_tracking(&message_id, &mut |r| {
                        r.mark_bounced(error.to_string(), resolved_at)
                    })?;
                    self.store
                        .update_account(account.id, &mut |a| a.total_bounced += 1)?;
                } else {
                    self.store
                        .update_tracking(&message_id, &mut |r| r.mark_failed(error.to_string()))?;
                }

                let target = if bounced {
                    ContactStatus::Bounced
                } else {
                    ContactStatus::Failed
                };
                self.store.update_contact(contact_id, &mut |c| {
                    if ContactStateMachine::can_transition(c.status, target) {
                        c.status = target;
                    }
                    c.next_send_at = None;
                    c.in_flight_message = None;
                    c.completed_at = Some(resolved_at);
                    c.last_activity_at = resolved_at;
                })?;
                warn!(
                    contact_id = %contact_id,
                    error = %error,
                    "Permanent send failure, contact excluded from further steps"
                );
                self.events.emit(make_event(
                    if bounced {
                        EventType::EmailBounced
                    } else {
                        EventType::ContactFailed
                    },
                    Some(campaign.id),
                    Some(contact_id),
                    Some(error.to_string()),
                ));
                Ok(ContactOutcome::Failed)
            }
        }
    }

    /// Resume a contact whose in-flight attempt stalled (reconciler entry
    /// point). A record that resolved `sent` is finished without another
    /// transport call; an unresolved record is written off as failed with
    /// unknown outcome and retried under a fresh message id.
    pub async fn resume_contact(&self, contact_id: Uuid) -> anyhow::Result<ContactOutcome> {
        let now = self.clock.now();
        let Some(contact) = self.store.contact(contact_id) else {
            return Ok(ContactOutcome::Skipped);
        };
        let Some(campaign) = self.store.campaign(contact.campaign_id) else {
            return Ok(ContactOutcome::Skipped);
        };
        if campaign.status != CampaignStatus::Sending || contact.status.is_terminal() {
            return Ok(ContactOutcome::Skipped);
        }
        let Some(message_id) = contact.in_flight_message.clone() else {
            return Ok(ContactOutcome::Skipped);
        };

        match self.store.tracking(&message_id) {
            Some(record) if record.status == TrackingStatus::Sent => {
                self.finish_resolved_send(&campaign, &contact, &record, now)?;
                Ok(ContactOutcome::Resumed)
            }
            Some(record) if !record.is_resolved() => {
                self.store.update_tracking(&message_id, &mut |r| {
                    r.mark_failed("stalled in flight; outcome unknown")
                })?;
                self.retry_or_fail(
                    &campaign,
                    contact_id,
                    contact.attempts + 1,
                    now,
                    &SendError::Connection("stalled in flight".to_string()),
                )
            }
            _ => {
                self.store.update_contact(contact_id, &mut |c| {
                    c.in_flight_message = None;
                    c.last_activity_at = now;
                })?;
                Ok(ContactOutcome::Rescheduled)
            }
        }
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    fn resolve_in_flight(
        &self,
        campaign: &Campaign,
        contact: &CampaignContact,
        message_id: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<ContactOutcome> {
        match self.store.tracking(message_id) {
            Some(record) if record.status == TrackingStatus::Sent => {
                // A crash landed between send and transition; finish the
                // step without calling the transport again.
                self.finish_resolved_send(campaign, contact, &record, now)?;
                Ok(ContactOutcome::Resumed)
            }
            Some(record) if !record.is_resolved() => {
                // Attempt still owned by a live send elsewhere.
                debug!(contact_id = %contact.id, message_id, "Attempt already in flight, skipping");
                Ok(ContactOutcome::Skipped)
            }
            _ => {
                // Resolved as failed (or vanished): free the slot; the
                // contact is still due and retries on the next pass.
                self.store.update_contact(contact.id, &mut |c| {
                    c.in_flight_message = None;
                    c.last_activity_at = now;
                })?;
                Ok(ContactOutcome::Rescheduled)
            }
        }
    }

    fn finish_resolved_send(
        &self,
        campaign: &Campaign,
        contact: &CampaignContact,
        record: &TrackingRecord,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store.update_contact(contact.id, &mut |c| {
            if ContactStateMachine::can_transition(c.status, ContactStatus::Sent) {
                c.status = ContactStatus::Sent;
            }
            if c.last_step_sent_at.is_none() {
                c.last_step_sent_at = record.sent_at;
            }
            c.in_flight_message = None;
            c.attempts = 0;
            c.last_activity_at = now;
        })?;
        self.advance_after_send(campaign, contact.id, record.step_number, now)
    }

    fn retry_or_fail(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        attempts: u32,
        now: DateTime<Utc>,
        error: &SendError,
    ) -> anyhow::Result<ContactOutcome> {
        if self.retry.should_retry(attempts) {
            let delay = self.retry.backoff(attempts);
            self.store.update_contact(contact_id, &mut |c| {
                c.attempts = attempts;
                c.next_send_at = Some(now + delay);
                c.in_flight_message = None;
                c.last_activity_at = now;
            })?;
            warn!(
                contact_id = %contact_id,
                attempts,
                retry_in_minutes = delay.num_minutes(),
                error = %error,
                "Transient send failure, rescheduled"
            );
            Ok(ContactOutcome::Retried)
        } else {
            self.store.update_contact(contact_id, &mut |c| {
                if ContactStateMachine::can_transition(c.status, ContactStatus::Failed) {
                    c.status = ContactStatus::Failed;
                }
                c.attempts = attempts;
                c.next_send_at = None;
                c.in_flight_message = None;
                c.completed_at = Some(now);
                c.last_activity_at = now;
            })?;
            warn!(contact_id = %contact_id, attempts, "Retries exhausted, contact failed");
            self.events.emit(make_event(
                EventType::ContactFailed,
                Some(campaign.id),
                Some(contact_id),
                Some(error.to_string()),
            ));
            Ok(ContactOutcome::Failed)
        }
    }

    /// Post-send step boundary: evaluate conditions, then either terminate
    /// the contact or hand the next step to the scheduler.
    fn advance_after_send(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        sent_step: u32,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(contact) = self.store.contact(contact_id) else {
            return Ok(());
        };
        // Engagement (e.g. a bounce webhook) may have terminated the
        // contact while the send resolved.
        if contact.status.is_terminal() {
            return Ok(());
        }

        self.store
            .update_contact(contact_id, &mut |c| c.previous_step = Some(sent_step))?;

        let snapshot = self.store.engagement_snapshot(&contact, sent_step, now);
        match self.evaluator.decide(&campaign.steps, sent_step, &snapshot) {
            StepDecision::Stop => self.stop_contact(campaign, contact_id, now),
            StepDecision::Complete => self.complete_contact(campaign, contact_id, now),
            StepDecision::Next { step, branched } => {
                if branched {
                    debug!(contact_id = %contact_id, from = sent_step, to = step, "Contact branched");
                }
                self.schedule_step(campaign, contact_id, step, now, now)
            }
        }
    }

    /// Compute `next_send_at` for `step_number` from `base` and write it to
    /// the contact. An unschedulable outcome pauses the campaign and
    /// surfaces the reason.
    fn schedule_step(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        step_number: u32,
        base: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let Some(contact) = self.store.contact(contact_id) else {
            return Ok(());
        };
        let Some(step) = campaign.step(step_number) else {
            return self.complete_contact(campaign, contact_id, now);
        };

        let accounts = self.store.accounts();
        let outcome = self.scheduler.next_send_slot(
            base,
            step.delay_hours_total(),
            &campaign.schedule,
            contact.timezone.as_deref(),
            &accounts,
            &contact.recipient_domain(),
        );
        match outcome {
            ScheduleOutcome::Scheduled { at, account_id } => {
                self.store.update_contact(contact_id, &mut |c| {
                    c.current_step = step_number;
                    c.next_send_at = Some(at);
                    c.assigned_account = Some(account_id);
                    c.attempts = 0;
                    c.last_activity_at = now;
                })?;
                Ok(())
            }
            ScheduleOutcome::Unschedulable { reason } => {
                warn!(campaign_id = %campaign.id, reason = %reason, "Campaign unschedulable, pausing");
                self.store
                    .update_campaign_status(campaign.id, CampaignStatus::Paused)?;
                self.events.emit(make_event(
                    EventType::CampaignPaused,
                    Some(campaign.id),
                    None,
                    Some(reason),
                ));
                Ok(())
            }
        }
    }

    fn reschedule_current(
        &self,
        campaign: &Campaign,
        contact: &CampaignContact,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        // Zero additional delay; account availability decides the real gap.
        self.schedule_step(campaign, contact.id, contact.current_step, now, now)
    }

    fn stop_contact(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store.update_contact(contact_id, &mut |c| {
            if ContactStateMachine::can_transition(c.status, ContactStatus::Stopped) {
                c.status = ContactStatus::Stopped;
            }
            c.next_send_at = None;
            c.in_flight_message = None;
            c.completed_at = Some(now);
            c.last_activity_at = now;
        })?;
        info!(contact_id = %contact_id, "Sequence stopped by condition");
        self.events.emit(make_event(
            EventType::SequenceStopped,
            Some(campaign.id),
            Some(contact_id),
            None,
        ));
        Ok(())
    }

    fn complete_contact(
        &self,
        campaign: &Campaign,
        contact_id: Uuid,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store.update_contact(contact_id, &mut |c| {
            if ContactStateMachine::can_transition(c.status, ContactStatus::Completed) {
                c.status = ContactStatus::Completed;
            }
            c.next_send_at = None;
            c.in_flight_message = None;
            c.completed_at = Some(now);
            c.last_activity_at = now;
        })?;
        info!(contact_id = %contact_id, "Contact completed sequence");
        self.events.emit(make_event(
            EventType::ContactCompleted,
            Some(campaign.id),
            Some(contact_id),
            None,
        ));
        Ok(())
    }

    fn finalize_campaign(&self, campaign_id: Uuid) {
        let contacts = self.store.contacts_for_campaign(campaign_id);
        if contacts.is_empty() || !contacts.iter().all(|c| c.status.is_terminal()) {
            return;
        }
        let Some(campaign) = self.store.campaign(campaign_id) else {
            return;
        };
        if campaign.status != CampaignStatus::Sending {
            return;
        }
        if self
            .store
            .update_campaign_status(campaign_id, CampaignStatus::Completed)
            .is_ok()
        {
            info!(campaign_id = %campaign_id, "Campaign completed");
            self.events.emit(make_event(
                EventType::CampaignCompleted,
                Some(campaign_id),
                None,
                None,
            ));
        }
    }

    fn evaluate_warmups(&self, now: DateTime<Utc>) {
        for account in self.store.accounts() {
            if account.warmup.stage != WarmupStage::InProgress {
                continue;
            }
            let _ = self.store.update_account(account.id, &mut |a| {
                match self.warmup.evaluate_progression(a, now) {
                    WarmupOutcome::Advanced { week } => {
                        self.events.emit(make_event(
                            EventType::WarmupAdvanced,
                            None,
                            None,
                            Some(format!("{} week {week}", a.address)),
                        ));
                    }
                    WarmupOutcome::Paused => {
                        self.events.emit(make_event(
                            EventType::WarmupPaused,
                            None,
                            None,
                            Some(a.address.clone()),
                        ));
                    }
                    _ => {}
                }
            });
        }
    }
}
