//! Chat over the user's merged intelligence.
//!
//! The system prompt is built from the top slices of the persisted record:
//! five relationships, five projects, five action items, three facts.

use std::sync::Arc;

use crate::claude::{CompletionClient, LlmError};
use crate::db::IntelligenceSummary;

/// Answer a chat message with the user's intelligence as context.
pub async fn answer(
    client: Arc<dyn CompletionClient>,
    user_email: &str,
    summary: &IntelligenceSummary,
    message: &str,
) -> Result<String, LlmError> {
    let system = build_system_prompt(user_email, summary);
    client.complete(&system, message).await
}

/// Concatenate the summary slices into an assistant persona prompt.
pub fn build_system_prompt(user_email: &str, summary: &IntelligenceSummary) -> String {
    let mut prompt = format!(
        "You are a personal chief-of-staff assistant for {}.\n\
         Answer using what you know about their work below. Be concise and\n\
         concrete; say so plainly when the context doesn't cover a question.\n",
        user_email
    );

    if !summary.relationships.is_empty() {
        prompt.push_str("\nKey relationships:\n");
        for contact in &summary.relationships {
            let name = contact.contact_name.as_deref().unwrap_or("Unknown");
            match &contact.context {
                Some(context) => prompt.push_str(&format!(
                    "- {} <{}>: {}\n",
                    name, contact.contact_email, context
                )),
                None => prompt.push_str(&format!("- {} <{}>\n", name, contact.contact_email)),
            }
        }
    }

    if !summary.projects.is_empty() {
        prompt.push_str("\nActive projects:\n");
        for project in &summary.projects {
            match &project.description {
                Some(description) => {
                    prompt.push_str(&format!("- {}: {}\n", project.name, description))
                }
                None => prompt.push_str(&format!("- {}\n", project.name)),
            }
        }
    }

    if !summary.action_items.is_empty() {
        prompt.push_str("\nOpen action items:\n");
        for task in &summary.action_items {
            match &task.deadline {
                Some(deadline) => {
                    prompt.push_str(&format!("- {} (due {})\n", task.description, deadline))
                }
                None => prompt.push_str(&format!("- {}\n", task.description)),
            }
        }
    }

    if !summary.facts.is_empty() {
        prompt.push_str("\nRecent facts:\n");
        for fact in &summary.facts {
            prompt.push_str(&format!("- {}\n", fact.text));
        }
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{DbContact, DbProject, DbTask, FactNote};

    fn summary() -> IntelligenceSummary {
        IntelligenceSummary {
            relationships: vec![DbContact {
                id: "c1".to_string(),
                contact_email: "alice@x.com".to_string(),
                contact_name: Some("Alice".to_string()),
                context: Some("Launch partner".to_string()),
                first_seen: "2026-08-01T00:00:00Z".to_string(),
                last_seen: "2026-08-01T00:00:00Z".to_string(),
                total_mentions: 4,
            }],
            projects: vec![DbProject {
                id: "p1".to_string(),
                name: "Launch Plan".to_string(),
                description: None,
                status: "active".to_string(),
                created_at: "2026-08-01T00:00:00Z".to_string(),
            }],
            action_items: vec![DbTask {
                id: "t1".to_string(),
                description: "send report".to_string(),
                deadline: Some("Friday".to_string()),
                status: "pending".to_string(),
                created_at: "2026-08-01T00:00:00Z".to_string(),
            }],
            facts: vec![FactNote {
                text: "Budget approved".to_string(),
                noted_at: "2026-08-01T00:00:00Z".to_string(),
            }],
        }
    }

    #[test]
    fn test_system_prompt_includes_all_sections() {
        let prompt = build_system_prompt("me@example.com", &summary());
        assert!(prompt.contains("me@example.com"));
        assert!(prompt.contains("Alice <alice@x.com>: Launch partner"));
        assert!(prompt.contains("Launch Plan"));
        assert!(prompt.contains("send report (due Friday)"));
        assert!(prompt.contains("Budget approved"));
    }

    #[test]
    fn test_system_prompt_empty_summary_skips_sections() {
        let prompt = build_system_prompt("me@example.com", &IntelligenceSummary::default());
        assert!(!prompt.contains("Key relationships"));
        assert!(!prompt.contains("Active projects"));
        assert!(!prompt.contains("Open action items"));
        assert!(!prompt.contains("Recent facts"));
    }
}
