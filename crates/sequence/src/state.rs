use anyhow::{anyhow, Result};

use cadence_core::types::ContactStatus;

/// Guards per-contact lifecycle transitions. Statuses move monotonically:
/// up the engagement ladder, or into a terminal status, never back out.
#[derive(Debug, Clone)]
pub struct ContactStateMachine {
    pub state: ContactStatus,
}

impl ContactStateMachine {
    pub fn new(initial: ContactStatus) -> Self {
        Self { state: initial }
    }

    pub fn can_transition(from: ContactStatus, to: ContactStatus) -> bool {
        if from == to {
            return false;
        }
        if from.is_terminal() {
            return false;
        }
        match to {
            // Engagement statuses only escalate.
            ContactStatus::Sent
            | ContactStatus::Delivered
            | ContactStatus::Opened
            | ContactStatus::Clicked
            | ContactStatus::Replied => to.engagement_rank() > from.engagement_rank(),
            // Completion requires at least one resolved send.
            ContactStatus::Completed => from != ContactStatus::Pending,
            // Any live contact can be stopped, failed, or suppressed.
            ContactStatus::Stopped
            | ContactStatus::Bounced
            | ContactStatus::Complained
            | ContactStatus::Unsubscribed
            | ContactStatus::Failed => true,
            // Nothing returns to pending.
            ContactStatus::Pending => false,
        }
    }

    pub fn transition(&mut self, to: ContactStatus) -> Result<()> {
        if Self::can_transition(self.state, to) {
            self.state = to;
            Ok(())
        } else {
            Err(anyhow!(
                "Invalid contact transition from {:?} to {:?}",
                self.state,
                to
            ))
        }
    }

    /// Escalate to `to` only if it outranks the current engagement status;
    /// lower-ranked events are dropped rather than erroring, since webhook
    /// delivery order is not guaranteed.
    pub fn escalate(&mut self, to: ContactStatus) -> bool {
        if Self::can_transition(self.state, to) && to.engagement_rank() > 0 {
            self.state = to;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engagement_ladder_escalates() {
        let mut machine = ContactStateMachine::new(ContactStatus::Pending);
        machine.transition(ContactStatus::Sent).unwrap();
        machine.transition(ContactStatus::Opened).unwrap();
        machine.transition(ContactStatus::Replied).unwrap();
        assert_eq!(machine.state, ContactStatus::Replied);
    }

    #[test]
    fn test_no_downgrade() {
        let mut machine = ContactStateMachine::new(ContactStatus::Opened);
        assert!(machine.transition(ContactStatus::Delivered).is_err());
        assert_eq!(machine.state, ContactStatus::Opened);
        assert!(!machine.escalate(ContactStatus::Delivered));
    }

    #[test]
    fn test_terminal_is_final() {
        let mut machine = ContactStateMachine::new(ContactStatus::Stopped);
        assert!(machine.transition(ContactStatus::Sent).is_err());
        assert!(machine.transition(ContactStatus::Completed).is_err());
    }

    #[test]
    fn test_pending_cannot_complete() {
        assert!(!ContactStateMachine::can_transition(
            ContactStatus::Pending,
            ContactStatus::Completed
        ));
        assert!(ContactStateMachine::can_transition(
            ContactStatus::Sent,
            ContactStatus::Completed
        ));
    }

    #[test]
    fn test_any_live_status_can_bounce() {
        for from in [
            ContactStatus::Pending,
            ContactStatus::Sent,
            ContactStatus::Replied,
        ] {
            assert!(ContactStateMachine::can_transition(from, ContactStatus::Bounced));
        }
    }
}
