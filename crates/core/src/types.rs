use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Scheduled,
    Sending,
    Paused,
    Completed,
}

/// Per-contact progress through a campaign. Engagement statuses escalate
/// (sent -> delivered -> opened -> clicked -> replied); terminal statuses
/// admit no further scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Pending,
    Sent,
    Delivered,
    Opened,
    Clicked,
    Replied,
    Bounced,
    Complained,
    Unsubscribed,
    Stopped,
    Completed,
    Failed,
}

impl ContactStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ContactStatus::Bounced
                | ContactStatus::Complained
                | ContactStatus::Unsubscribed
                | ContactStatus::Stopped
                | ContactStatus::Completed
                | ContactStatus::Failed
        )
    }

    /// Position on the engagement ladder. Non-engagement statuses rank 0 so
    /// they are never produced by an engagement upgrade.
    pub fn engagement_rank(&self) -> u8 {
        match self {
            ContactStatus::Sent => 1,
            ContactStatus::Delivered => 2,
            ContactStatus::Opened => 3,
            ContactStatus::Clicked => 4,
            ContactStatus::Replied => 5,
            _ => 0,
        }
    }
}

/// Scheduling state for one (campaign, contact) pair. Created once at
/// campaign launch; the dispatch worker is the only writer afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignContact {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub email: String,
    pub first_name: Option<String>,
    /// Detected recipient timezone (IANA name), if known.
    pub timezone: Option<String>,
    /// 1-based pointer into the campaign sequence.
    pub current_step: u32,
    /// The step whose send last resolved, kept so its conditions can be
    /// re-checked against fresh engagement right before the next send.
    pub previous_step: Option<u32>,
    pub next_send_at: Option<DateTime<Utc>>,
    pub assigned_account: Option<Uuid>,
    pub status: ContactStatus,
    /// Send attempts at the current step (reset on success).
    pub attempts: u32,
    /// Message id of the unresolved send attempt, if one is outstanding.
    /// At most one attempt may be in flight per contact.
    pub in_flight_message: Option<String>,
    /// Set while the reconciler owns a resume attempt for this contact.
    pub recovering: bool,
    pub last_step_sent_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl CampaignContact {
    pub fn new(campaign_id: Uuid, contact_id: Uuid, email: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            campaign_id,
            contact_id,
            email: email.into(),
            first_name: None,
            timezone: None,
            current_step: 1,
            previous_step: None,
            next_send_at: None,
            assigned_account: None,
            status: ContactStatus::Pending,
            attempts: 0,
            in_flight_message: None,
            recovering: false,
            last_step_sent_at: None,
            last_activity_at: now,
            completed_at: None,
            created_at: now,
        }
    }

    /// Domain portion of the recipient address, lowercased. Falls back to
    /// the whole address when no `@` is present.
    pub fn recipient_domain(&self) -> String {
        recipient_domain(&self.email)
    }
}

pub fn recipient_domain(email: &str) -> String {
    email
        .rsplit_once('@')
        .map(|(_, d)| d.to_ascii_lowercase())
        .unwrap_or_else(|| email.to_ascii_lowercase())
}

/// Warmup lifecycle for a sending account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarmupStage {
    NotStarted,
    InProgress,
    /// Safety valve tripped; only a manual resume moves the account forward.
    Paused,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarmupState {
    pub stage: WarmupStage,
    /// 1-based week in the warmup ladder.
    pub current_week: u32,
    pub current_daily_limit: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub week_started_at: Option<DateTime<Utc>>,
}

impl Default for WarmupState {
    fn default() -> Self {
        Self {
            stage: WarmupStage::NotStarted,
            current_week: 0,
            current_daily_limit: 0,
            started_at: None,
            week_started_at: None,
        }
    }
}

/// A sending identity with its limits and reputation counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailAccount {
    pub id: Uuid,
    pub address: String,
    pub from_name: String,
    pub enabled: bool,
    pub daily_send_limit: u32,
    pub warmup: WarmupState,
    pub total_sent: u64,
    pub total_bounced: u64,
    pub total_complained: u64,
    pub created_at: DateTime<Utc>,
}

impl EmailAccount {
    pub fn new(address: impl Into<String>, from_name: impl Into<String>, daily_send_limit: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.into(),
            from_name: from_name.into(),
            enabled: true,
            daily_send_limit,
            warmup: WarmupState::default(),
            total_sent: 0,
            total_bounced: 0,
            total_complained: 0,
            created_at: Utc::now(),
        }
    }

    pub fn bounce_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.total_bounced as f64 / self.total_sent as f64
        }
    }

    pub fn complaint_rate(&self) -> f64 {
        if self.total_sent == 0 {
            0.0
        } else {
            self.total_complained as f64 / self.total_sent as f64
        }
    }

    /// Daily ceiling honoring the warmup ramp while it is active.
    pub fn effective_daily_limit(&self) -> u32 {
        match self.warmup.stage {
            WarmupStage::InProgress | WarmupStage::Paused => {
                self.daily_send_limit.min(self.warmup.current_daily_limit)
            }
            WarmupStage::NotStarted | WarmupStage::Completed => self.daily_send_limit,
        }
    }
}

/// Resolution state of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStatus {
    Pending,
    Sent,
    Failed,
    Bounced,
}

/// One row per send attempt, keyed by a globally unique message id minted
/// before the transport call. Engagement timestamps are set at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub message_id: String,
    pub campaign_id: Uuid,
    pub contact_id: Uuid,
    pub account_id: Uuid,
    pub step_number: u32,
    pub status: TrackingStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub opened_at: Option<DateTime<Utc>>,
    pub clicked_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub bounced_at: Option<DateTime<Utc>>,
    pub complained_at: Option<DateTime<Utc>>,
    pub unsubscribed_at: Option<DateTime<Utc>>,
}

impl TrackingRecord {
    pub fn pending(
        campaign_id: Uuid,
        contact_id: Uuid,
        account_id: Uuid,
        step_number: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id: format!("cad-{}", Uuid::new_v4()),
            campaign_id,
            contact_id,
            account_id,
            step_number,
            status: TrackingStatus::Pending,
            error: None,
            created_at: now,
            sent_at: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            replied_at: None,
            bounced_at: None,
            complained_at: None,
            unsubscribed_at: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status != TrackingStatus::Pending
    }

    pub fn mark_sent(&mut self, at: DateTime<Utc>) {
        self.status = TrackingStatus::Sent;
        if self.sent_at.is_none() {
            self.sent_at = Some(at);
        }
    }

    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        self.status = TrackingStatus::Failed;
        self.error = Some(reason.into());
    }

    pub fn mark_bounced(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.status = TrackingStatus::Bounced;
        self.error = Some(reason.into());
        if self.bounced_at.is_none() {
            self.bounced_at = Some(at);
        }
    }
}

/// Rate-limit section of a campaign's schedule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_daily_limit")]
    pub daily_limit: u32,
    #[serde(default = "default_domain_limit")]
    pub domain_limit: u32,
    #[serde(default)]
    pub account_rotation: bool,
    #[serde(default)]
    pub warmup_mode: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default)]
    pub batch_delay_minutes: u32,
}

fn default_daily_limit() -> u32 {
    500
}
fn default_domain_limit() -> u32 {
    50
}
fn default_batch_size() -> u32 {
    25
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            daily_limit: default_daily_limit(),
            domain_limit: default_domain_limit(),
            account_rotation: false,
            warmup_mode: false,
            batch_size: default_batch_size(),
            batch_delay_minutes: 0,
        }
    }
}

/// Delivery-window and rate settings attached to a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleSettings {
    #[serde(default)]
    pub timezone_detection: bool,
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    #[serde(default)]
    pub business_hours_only: bool,
    /// Local hour, inclusive start of the sending window.
    #[serde(default = "default_business_hours_start")]
    pub business_hours_start: u32,
    /// Local hour, exclusive end of the sending window.
    #[serde(default = "default_business_hours_end")]
    pub business_hours_end: u32,
    /// Allowed weekdays, 0 = Sunday .. 6 = Saturday. Empty means all days.
    #[serde(default)]
    pub business_days: Vec<u8>,
    #[serde(default)]
    pub avoid_weekends: bool,
    #[serde(default)]
    pub avoid_holidays: bool,
    #[serde(default)]
    pub holiday_list: Vec<NaiveDate>,
    #[serde(default)]
    pub rate_limiting: RateLimitSettings,
}

fn default_timezone() -> String {
    "UTC".to_string()
}
fn default_business_hours_start() -> u32 {
    9
}
fn default_business_hours_end() -> u32 {
    17
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        Self {
            timezone_detection: false,
            default_timezone: default_timezone(),
            business_hours_only: false,
            business_hours_start: default_business_hours_start(),
            business_hours_end: default_business_hours_end(),
            business_days: Vec::new(),
            avoid_weekends: false,
            avoid_holidays: false,
            holiday_list: Vec::new(),
            rate_limiting: RateLimitSettings::default(),
        }
    }
}

/// Analytics event kinds emitted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    CampaignLaunched,
    CampaignPaused,
    CampaignResumed,
    CampaignCompleted,
    EmailSent,
    EmailFailed,
    EmailBounced,
    SequenceStopped,
    ContactCompleted,
    ContactFailed,
    ContactRecovered,
    EngagementRecorded,
    WarmupAdvanced,
    WarmupPaused,
}

/// Analytics event emitted into the configured sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutreachEvent {
    pub event_id: Uuid,
    pub event_type: EventType,
    pub campaign_id: Option<Uuid>,
    pub contact_id: Option<Uuid>,
    pub account_id: Option<Uuid>,
    pub message_id: Option<String>,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}
