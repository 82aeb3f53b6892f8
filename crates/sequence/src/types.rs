use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cadence_core::types::{CampaignStatus, ScheduleSettings};
use cadence_core::{CadenceError, CadenceResult};

/// Comparison operator inside a step condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    GreaterThan,
    LessThan,
}

/// What a step condition tests. Engagement kinds compare a boolean signal;
/// `time_elapsed` compares hours since the step's send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum ConditionTrigger {
    ReplyReceived {
        operator: ConditionOperator,
        value: bool,
    },
    EmailOpened {
        operator: ConditionOperator,
        value: bool,
    },
    LinkClicked {
        operator: ConditionOperator,
        value: bool,
    },
    TimeElapsed {
        operator: ConditionOperator,
        hours: u32,
    },
}

/// What happens when a condition matches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum ConditionAction {
    StopSequence,
    SkipStep,
    BranchToStep { target_step: u32 },
}

/// A single condition attached to a step. Conditions are evaluated in
/// declared order; the first match wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCondition {
    #[serde(flatten)]
    pub trigger: ConditionTrigger,
    #[serde(flatten)]
    pub action: ConditionAction,
}

impl StepCondition {
    pub fn new(trigger: ConditionTrigger, action: ConditionAction) -> Self {
        Self { trigger, action }
    }
}

/// One email step in a campaign sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    /// 1-based, contiguous, unique within the sequence.
    pub step_number: u32,
    pub subject_template: String,
    pub content_template: String,
    /// Delay relative to the prior step's completion.
    pub delay_days: u32,
    pub delay_hours: u32,
    pub conditions: Vec<StepCondition>,
}

impl SequenceStep {
    pub fn new(
        step_number: u32,
        subject_template: impl Into<String>,
        content_template: impl Into<String>,
    ) -> Self {
        Self {
            step_number,
            subject_template: subject_template.into(),
            content_template: content_template.into(),
            delay_days: 0,
            delay_hours: 0,
            conditions: Vec::new(),
        }
    }

    pub fn with_delay(mut self, days: u32, hours: u32) -> Self {
        self.delay_days = days;
        self.delay_hours = hours;
        self
    }

    pub fn with_condition(mut self, condition: StepCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Total delay before this step, in hours.
    pub fn delay_hours_total(&self) -> i64 {
        i64::from(self.delay_days) * 24 + i64::from(self.delay_hours)
    }
}

/// Sum of all step delays: how long a contact that never branches takes to
/// traverse the sequence, excluding window adjustments.
pub fn total_duration_hours(steps: &[SequenceStep]) -> i64 {
    steps.iter().map(SequenceStep::delay_hours_total).sum()
}

/// A campaign: an immutable-once-active sequence plus schedule settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub steps: Vec<SequenceStep>,
    pub schedule: ScheduleSettings,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Campaign {
    pub fn draft(name: impl Into<String>, steps: Vec<SequenceStep>, schedule: ScheduleSettings) -> Self {
        let now = Utc::now();
        let mut campaign = Self {
            id: Uuid::new_v4(),
            name: name.into(),
            status: CampaignStatus::Draft,
            steps,
            schedule,
            created_at: now,
            updated_at: now,
        };
        campaign.steps.sort_by_key(|s| s.step_number);
        campaign
    }

    pub fn step(&self, step_number: u32) -> Option<&SequenceStep> {
        self.steps.iter().find(|s| s.step_number == step_number)
    }

    pub fn last_step_number(&self) -> u32 {
        self.steps.iter().map(|s| s.step_number).max().unwrap_or(0)
    }

    /// Replace the sequence. Only drafts may be edited; an active campaign
    /// requires a new draft.
    pub fn replace_steps(&mut self, steps: Vec<SequenceStep>) -> CadenceResult<()> {
        if self.status != CampaignStatus::Draft {
            return Err(CadenceError::Lifecycle(format!(
                "campaign {} is {:?}; sequence edits require a new draft",
                self.id, self.status
            )));
        }
        self.steps = steps;
        self.steps.sort_by_key(|s| s.step_number);
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_hours_total() {
        let step = SequenceStep::new(2, "s", "b").with_delay(2, 6);
        assert_eq!(step.delay_hours_total(), 54);

        let step = SequenceStep::new(1, "s", "b");
        assert_eq!(step.delay_hours_total(), 0);
    }

    #[test]
    fn test_total_duration_hours() {
        let steps = vec![
            SequenceStep::new(1, "a", "b"),
            SequenceStep::new(2, "c", "d").with_delay(2, 12),
            SequenceStep::new(3, "e", "f").with_delay(1, 6),
        ];
        assert_eq!(total_duration_hours(&steps), 90);
    }

    #[test]
    fn test_condition_wire_shape() {
        let condition = StepCondition::new(
            ConditionTrigger::ReplyReceived {
                operator: ConditionOperator::Equals,
                value: true,
            },
            ConditionAction::BranchToStep { target_step: 4 },
        );

        let json = serde_json::to_value(&condition).unwrap();
        assert_eq!(json["type"], "reply_received");
        assert_eq!(json["operator"], "equals");
        assert_eq!(json["value"], true);
        assert_eq!(json["action"], "branch_to_step");
        assert_eq!(json["target_step"], 4);

        let back: StepCondition = serde_json::from_value(json).unwrap();
        assert_eq!(back, condition);
    }

    #[test]
    fn test_active_campaign_rejects_edits() {
        let mut campaign = Campaign::draft(
            "Q3 outreach",
            vec![SequenceStep::new(1, "s", "b")],
            ScheduleSettings::default(),
        );

        campaign.status = CampaignStatus::Sending;
        let result = campaign.replace_steps(vec![SequenceStep::new(1, "new", "body")]);
        assert!(result.is_err());
        assert_eq!(campaign.steps[0].subject_template, "s");
    }
}
