use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{ConditionAction, ConditionOperator, ConditionTrigger, SequenceStep, StepCondition};

/// The contact's engagement signals at a step boundary, derived from its
/// tracking records.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EngagementSnapshot {
    pub replied: bool,
    pub opened: bool,
    pub clicked: bool,
    /// Hours since the current step's email was sent.
    pub hours_since_send: i64,
}

/// Where a contact goes after finishing a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "decision")]
pub enum StepDecision {
    /// Schedule the given step next. `branched` records that a
    /// `branch_to_step` condition chose it.
    Next { step: u32, branched: bool },
    /// A stop condition matched; the contact is done, by rule.
    Stop,
    /// The sequence ran off its last step; the contact is done, naturally.
    Complete,
}

/// Evaluates a step's ordered condition list against an engagement snapshot.
/// First match wins; remaining conditions are not consulted.
#[derive(Debug, Clone, Default)]
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Decides the contact's next step after completing `current_step`.
    ///
    /// `skip_step` advances the cursor past the following step without
    /// sending it and re-evaluates from there, so chained skips walk
    /// forward until a sendable step or the end of the sequence.
    pub fn decide(
        &self,
        steps: &[SequenceStep],
        current_step: u32,
        snapshot: &EngagementSnapshot,
    ) -> StepDecision {
        let last = steps.iter().map(|s| s.step_number).max().unwrap_or(0);
        let mut cursor = current_step;

        loop {
            let Some(step) = steps.iter().find(|s| s.step_number == cursor) else {
                return StepDecision::Complete;
            };

            match self.first_matching_action(&step.conditions, snapshot) {
                Some(ConditionAction::StopSequence) => return StepDecision::Stop,
                Some(ConditionAction::BranchToStep { target_step }) => {
                    debug!(from = cursor, to = target_step, "Branch condition matched");
                    return StepDecision::Next {
                        step: *target_step,
                        branched: true,
                    };
                }
                Some(ConditionAction::SkipStep) => {
                    // The next step is passed over unsent; its own conditions
                    // then decide what follows it.
                    cursor += 1;
                    if cursor > last {
                        return StepDecision::Complete;
                    }
                }
                None => {
                    return if cursor >= last {
                        StepDecision::Complete
                    } else {
                        StepDecision::Next {
                            step: cursor + 1,
                            branched: false,
                        }
                    };
                }
            }
        }
    }

    /// Returns the action of the first condition whose predicate matches.
    pub fn first_matching_action<'a>(
        &self,
        conditions: &'a [StepCondition],
        snapshot: &EngagementSnapshot,
    ) -> Option<&'a ConditionAction> {
        conditions
            .iter()
            .find(|c| self.matches(&c.trigger, snapshot))
            .map(|c| &c.action)
    }

    pub fn matches(&self, trigger: &ConditionTrigger, snapshot: &EngagementSnapshot) -> bool {
        match trigger {
            ConditionTrigger::ReplyReceived { operator, value } => {
                bool_matches(*operator, snapshot.replied, *value)
            }
            ConditionTrigger::EmailOpened { operator, value } => {
                bool_matches(*operator, snapshot.opened, *value)
            }
            ConditionTrigger::LinkClicked { operator, value } => {
                bool_matches(*operator, snapshot.clicked, *value)
            }
            ConditionTrigger::TimeElapsed { operator, hours } => {
                let elapsed = snapshot.hours_since_send;
                let threshold = i64::from(*hours);
                match operator {
                    ConditionOperator::Equals => elapsed == threshold,
                    ConditionOperator::NotEquals => elapsed != threshold,
                    ConditionOperator::GreaterThan => elapsed > threshold,
                    ConditionOperator::LessThan => elapsed < threshold,
                }
            }
        }
    }
}

fn bool_matches(operator: ConditionOperator, actual: bool, expected: bool) -> bool {
    match operator {
        ConditionOperator::Equals => actual == expected,
        ConditionOperator::NotEquals => actual != expected,
        // Ordering operators are meaningless on booleans.
        ConditionOperator::GreaterThan | ConditionOperator::LessThan => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reply_stop() -> StepCondition {
        StepCondition::new(
            ConditionTrigger::ReplyReceived {
                operator: ConditionOperator::Equals,
                value: true,
            },
            ConditionAction::StopSequence,
        )
    }

    fn opened_branch(target: u32) -> StepCondition {
        StepCondition::new(
            ConditionTrigger::EmailOpened {
                operator: ConditionOperator::Equals,
                value: true,
            },
            ConditionAction::BranchToStep {
                target_step: target,
            },
        )
    }

    fn not_opened_skip() -> StepCondition {
        StepCondition::new(
            ConditionTrigger::EmailOpened {
                operator: ConditionOperator::Equals,
                value: false,
            },
            ConditionAction::SkipStep,
        )
    }

    fn three_steps(first_conditions: Vec<StepCondition>) -> Vec<SequenceStep> {
        let mut first = SequenceStep::new(1, "s1", "b1");
        first.conditions = first_conditions;
        vec![
            first,
            SequenceStep::new(2, "s2", "b2").with_delay(1, 0),
            SequenceStep::new(3, "s3", "b3").with_delay(1, 0),
        ]
    }

    #[test]
    fn test_no_match_advances_sequentially() {
        let steps = three_steps(vec![reply_stop()]);
        let snapshot = EngagementSnapshot::default();

        let decision = ConditionEvaluator::new().decide(&steps, 1, &snapshot);
        assert_eq!(
            decision,
            StepDecision::Next {
                step: 2,
                branched: false
            }
        );
    }

    #[test]
    fn test_reply_stops_sequence() {
        let steps = three_steps(vec![reply_stop()]);
        let snapshot = EngagementSnapshot {
            replied: true,
            ..Default::default()
        };

        let decision = ConditionEvaluator::new().decide(&steps, 1, &snapshot);
        assert_eq!(decision, StepDecision::Stop);
    }

    #[test]
    fn test_last_step_completes() {
        let steps = three_steps(vec![]);
        let decision = ConditionEvaluator::new().decide(&steps, 3, &EngagementSnapshot::default());
        assert_eq!(decision, StepDecision::Complete);
    }

    #[test]
    fn test_first_match_wins_in_declared_order() {
        // Both conditions match an opened+replied snapshot; the stop comes
        // first, so the branch must never be consulted.
        let steps = three_steps(vec![reply_stop(), opened_branch(3)]);
        let snapshot = EngagementSnapshot {
            replied: true,
            opened: true,
            ..Default::default()
        };
        let decision = ConditionEvaluator::new().decide(&steps, 1, &snapshot);
        assert_eq!(decision, StepDecision::Stop);

        // Reversed order flips the outcome.
        let steps = three_steps(vec![opened_branch(3), reply_stop()]);
        let decision = ConditionEvaluator::new().decide(&steps, 1, &snapshot);
        assert_eq!(
            decision,
            StepDecision::Next {
                step: 3,
                branched: true
            }
        );
    }

    #[test]
    fn test_skip_passes_over_next_step() {
        let steps = three_steps(vec![not_opened_skip()]);
        let snapshot = EngagementSnapshot::default();

        // Step 2 is skipped; step 2 has no conditions, so the default
        // advance lands on step 3.
        let decision = ConditionEvaluator::new().decide(&steps, 1, &snapshot);
        assert_eq!(
            decision,
            StepDecision::Next {
                step: 3,
                branched: false
            }
        );
    }

    #[test]
    fn test_skip_chain_runs_off_the_end() {
        let mut steps = three_steps(vec![not_opened_skip()]);
        steps[1].conditions = vec![not_opened_skip()];
        let snapshot = EngagementSnapshot::default();

        // 1 skips 2, 2's conditions skip 3, nothing remains.
        let decision = ConditionEvaluator::new().decide(&steps, 1, &snapshot);
        assert_eq!(decision, StepDecision::Complete);
    }

    #[test]
    fn test_time_elapsed_operators() {
        let evaluator = ConditionEvaluator::new();
        let trigger = ConditionTrigger::TimeElapsed {
            operator: ConditionOperator::GreaterThan,
            hours: 72,
        };

        let early = EngagementSnapshot {
            hours_since_send: 24,
            ..Default::default()
        };
        let late = EngagementSnapshot {
            hours_since_send: 96,
            ..Default::default()
        };

        assert!(!evaluator.matches(&trigger, &early));
        assert!(evaluator.matches(&trigger, &late));
    }

    #[test]
    fn test_ordering_operator_on_bool_never_matches() {
        let evaluator = ConditionEvaluator::new();
        let trigger = ConditionTrigger::ReplyReceived {
            operator: ConditionOperator::GreaterThan,
            value: true,
        };
        let snapshot = EngagementSnapshot {
            replied: true,
            ..Default::default()
        };
        assert!(!evaluator.matches(&trigger, &snapshot));
    }
}
