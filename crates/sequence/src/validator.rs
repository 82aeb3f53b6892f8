use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ConditionAction, SequenceStep};

/// A structural violation found in a sequence definition.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ValidationIssue {
    #[error("sequence has no steps")]
    EmptySequence,

    #[error("step numbers are not sequential: missing step {missing}")]
    NonSequentialSteps { missing: u32 },

    #[error("duplicate step number {step_number}")]
    DuplicateSteps { step_number: u32 },

    #[error("step 1 must have zero delay")]
    FirstStepHasDelay,

    #[error("step {step_number} branches to non-existent step {target_step}")]
    DanglingConditionTarget { step_number: u32, target_step: u32 },
}

/// Outcome of validating a sequence. All violations are collected so a
/// caller can surface every problem at once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn messages(&self) -> Vec<String> {
        self.errors.iter().map(|e| e.to_string()).collect()
    }
}

/// Checks a sequence's structural invariants before a campaign may activate.
#[derive(Debug, Clone, Default)]
pub struct SequenceValidator;

impl SequenceValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, steps: &[SequenceStep]) -> ValidationReport {
        let mut errors = Vec::new();

        if steps.is_empty() {
            return ValidationReport {
                valid: false,
                errors: vec![ValidationIssue::EmptySequence],
            };
        }

        let numbers: Vec<u32> = steps.iter().map(|s| s.step_number).collect();

        // Contiguity: numbers must cover 1..=N. Report the first hole.
        let expected = steps.len() as u32;
        if let Some(missing) = (1..=expected).find(|n| !numbers.contains(n)) {
            errors.push(ValidationIssue::NonSequentialSteps { missing });
        }

        // Duplicates, each reported once.
        let mut seen = Vec::with_capacity(numbers.len());
        let mut reported = Vec::new();
        for n in &numbers {
            if seen.contains(n) && !reported.contains(n) {
                errors.push(ValidationIssue::DuplicateSteps { step_number: *n });
                reported.push(*n);
            }
            seen.push(*n);
        }

        if let Some(first) = steps.iter().find(|s| s.step_number == 1) {
            if first.delay_days != 0 || first.delay_hours != 0 {
                errors.push(ValidationIssue::FirstStepHasDelay);
            }
        }

        // Every branch target must resolve to a defined step.
        for step in steps {
            for condition in &step.conditions {
                if let ConditionAction::BranchToStep { target_step } = condition.action {
                    if !numbers.contains(&target_step) {
                        errors.push(ValidationIssue::DanglingConditionTarget {
                            step_number: step.step_number,
                            target_step,
                        });
                    }
                }
            }
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ConditionOperator, ConditionTrigger, StepCondition};

    fn step(n: u32) -> SequenceStep {
        SequenceStep::new(n, format!("subject {n}"), format!("body {n}"))
    }

    fn branch_condition(target: u32) -> StepCondition {
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

    #[test]
    fn test_valid_sequence() {
        let steps = vec![step(1), step(2).with_delay(1, 0), step(3).with_delay(2, 6)];
        let report = SequenceValidator::new().validate(&steps);
        assert!(report.valid);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_empty_sequence() {
        let report = SequenceValidator::new().validate(&[]);
        assert!(!report.valid);
        assert_eq!(report.errors, vec![ValidationIssue::EmptySequence]);
    }

    #[test]
    fn test_missing_step_names_first_hole() {
        let steps = vec![step(1), step(2), step(5)];
        let report = SequenceValidator::new().validate(&steps);
        assert!(!report.valid);
        assert!(report
            .errors
            .contains(&ValidationIssue::NonSequentialSteps { missing: 3 }));
    }

    #[test]
    fn test_duplicate_step_numbers() {
        let steps = vec![step(1), step(2), step(2)];
        let report = SequenceValidator::new().validate(&steps);
        assert!(!report.valid);
        assert!(report
            .errors
            .contains(&ValidationIssue::DuplicateSteps { step_number: 2 }));
    }

    #[test]
    fn test_first_step_delay_rejected() {
        let steps = vec![step(1).with_delay(0, 1), step(2)];
        let report = SequenceValidator::new().validate(&steps);
        assert!(!report.valid);
        assert!(report.errors.contains(&ValidationIssue::FirstStepHasDelay));
    }

    #[test]
    fn test_dangling_branch_target() {
        let steps = vec![step(1).with_condition(branch_condition(9)), step(2)];
        let report = SequenceValidator::new().validate(&steps);
        assert!(!report.valid);
        assert!(report.errors.contains(&ValidationIssue::DanglingConditionTarget {
            step_number: 1,
            target_step: 9,
        }));
    }

    #[test]
    fn test_multiple_violations_collected() {
        // Step 1 delayed, a hole at 3, and a dangling branch all at once.
        let steps = vec![
            step(1).with_delay(1, 0).with_condition(branch_condition(7)),
            step(2),
            step(4),
        ];
        let report = SequenceValidator::new().validate(&steps);
        assert!(!report.valid);
        assert_eq!(report.errors.len(), 3);
        assert!(report
            .errors
            .contains(&ValidationIssue::NonSequentialSteps { missing: 3 }));
        assert!(report.errors.contains(&ValidationIssue::FirstStepHasDelay));
        assert!(report.errors.contains(&ValidationIssue::DanglingConditionTarget {
            step_number: 1,
            target_step: 7,
        }));

        let messages = report.messages();
        assert!(messages.iter().any(|m| m.contains("missing step 3")));
    }
}
