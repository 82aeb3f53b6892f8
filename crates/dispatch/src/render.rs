//! Content seam. Personalization happens outside the engine; dispatch only
//! needs final `(subject, body)` strings for a step and contact.

use cadence_core::types::CampaignContact;
use cadence_sequence::SequenceStep;

pub trait TemplateRenderer: Send + Sync {
    fn render(&self, step: &SequenceStep, contact: &CampaignContact) -> (String, String);
}

/// Minimal merge-field renderer: `{{first_name}}` and `{{email}}` only.
/// Real deployments plug in their personalization service here.
pub struct PassthroughRenderer;

impl TemplateRenderer for PassthroughRenderer {
    fn render(&self, step: &SequenceStep, contact: &CampaignContact) -> (String, String) {
        let first_name = contact.first_name.as_deref().unwrap_or("there");
        let substitute = |template: &str| {
            template
                .replace("{{first_name}}", first_name)
                .replace("{{email}}", &contact.email)
        };
        (
            substitute(&step.subject_template),
            substitute(&step.content_template),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_merge_fields() {
        let step = SequenceStep::new(1, "Hi {{first_name}}", "Reaching out to {{email}}");
        let mut contact =
            CampaignContact::new(Uuid::new_v4(), Uuid::new_v4(), "ada@example.com", Utc::now());
        contact.first_name = Some("Ada".to_string());

        let (subject, body) = PassthroughRenderer.render(&step, &contact);
        assert_eq!(subject, "Hi Ada");
        assert_eq!(body, "Reaching out to ada@example.com");
    }

    #[test]
    fn test_missing_first_name_falls_back() {
        let step = SequenceStep::new(1, "Hi {{first_name}}", "b");
        let contact =
            CampaignContact::new(Uuid::new_v4(), Uuid::new_v4(), "ada@example.com", Utc::now());

        let (subject, _) = PassthroughRenderer.render(&step, &contact);
        assert_eq!(subject, "Hi there");
    }
}
