//! Insight extraction from message batches via the Claude API.
//!
//! Messages are grouped into size-capped batches; each batch becomes one
//! completion call with a fixed instruction schema asking for relationships,
//! projects, action items, and important facts as a single JSON object. A
//! batch whose response cannot be parsed contributes nothing and the run
//! keeps going.

use std::ops::Range;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::claude::CompletionClient;
use crate::google_api::gmail::MessageRecord;

/// Most messages a single completion call sees.
const MAX_BATCH_MESSAGES: usize = 30;

/// Character budget per batch across subjects + excerpts, keeping prompts
/// under the model's context limit with room for instructions.
const MAX_BATCH_CHARS: usize = 24_000;

/// Subject length cap inside the prompt.
const PROMPT_SUBJECT_CHARS: usize = 100;

/// Snippet length cap inside the prompt.
const PROMPT_SNIPPET_CHARS: usize = 300;

// ============================================================================
// Batch types
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipMention {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "email")]
    pub address: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMention {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionItem {
    pub description: String,
    #[serde(default)]
    pub deadline: Option<String>,
}

/// Everything one sync run learned, before merging into persisted state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractedInsightBatch {
    #[serde(default)]
    pub relationships: Vec<RelationshipMention>,
    #[serde(default)]
    pub projects: Vec<ProjectMention>,
    #[serde(default)]
    pub action_items: Vec<ActionItem>,
    #[serde(default, alias = "important_facts")]
    pub facts: Vec<String>,
}

impl ExtractedInsightBatch {
    pub fn is_empty(&self) -> bool {
        self.relationships.is_empty()
            && self.projects.is_empty()
            && self.action_items.is_empty()
            && self.facts.is_empty()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("extraction response was not valid JSON: {0}")]
pub struct ExtractionParseError(String);

// ============================================================================
// Natural keys
// ============================================================================

/// Dedup key for a relationship: the address, falling back to the name.
pub fn relationship_key(mention: &RelationshipMention) -> String {
    let address = mention.address.trim().to_lowercase();
    if !address.is_empty() {
        address
    } else {
        mention.name.trim().to_lowercase()
    }
}

/// Case-insensitive, whitespace-folded project name.
pub fn normalized_project_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Stable hash of description + deadline for action-item dedup.
pub fn action_item_key(description: &str, deadline: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(description.trim().to_lowercase().as_bytes());
    hasher.update(b"|");
    hasher.update(deadline.unwrap_or("").trim().to_lowercase().as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Extractor
// ============================================================================

pub struct InsightExtractor {
    client: Arc<dyn CompletionClient>,
}

impl InsightExtractor {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    /// Run extraction over all messages.
    ///
    /// `progress(done, total)` fires after each batch; returning false stops
    /// the run early (cancellation), yielding whatever was collected so far.
    pub async fn extract<F>(
        &self,
        user_email: &str,
        messages: &[MessageRecord],
        mut progress: F,
    ) -> ExtractedInsightBatch
    where
        F: FnMut(usize, usize) -> bool,
    {
        if messages.is_empty() {
            return ExtractedInsightBatch::default();
        }

        let ranges = batch_ranges(messages);
        let total = ranges.len();
        let system = system_prompt(user_email);
        let mut collected: Vec<ExtractedInsightBatch> = Vec::new();

        for (index, range) in ranges.into_iter().enumerate() {
            let prompt = build_extraction_prompt(user_email, &messages[range]);

            match self.client.complete(&system, &prompt).await {
                Ok(text) => match parse_batch(&text) {
                    Ok(batch) => collected.push(batch),
                    Err(e) => {
                        log::warn!(
                            "Dropping extraction batch {}/{} for {}: {}",
                            index + 1,
                            total,
                            user_email,
                            e
                        );
                    }
                },
                Err(e) => {
                    log::warn!(
                        "Completion failed for batch {}/{} for {}: {}",
                        index + 1,
                        total,
                        user_email,
                        e
                    );
                }
            }

            if !progress(index + 1, total) {
                log::info!(
                    "Extraction stopped after batch {}/{} for {}",
                    index + 1,
                    total,
                    user_email
                );
                break;
            }
        }

        merge_batches(collected)
    }
}

/// Greedy batch split bounded by message count and character budget.
///
/// Every batch holds at least one message, so an oversized single message
/// still gets processed (its excerpt is already bounded upstream).
fn batch_ranges(messages: &[MessageRecord]) -> Vec<Range<usize>> {
    let mut ranges = Vec::new();
    let mut start = 0;
    let mut chars = 0usize;

    for (i, message) in messages.iter().enumerate() {
        let cost = message.subject.chars().count() + message.excerpt.chars().count();
        let count = i - start;

        if count > 0 && (count >= MAX_BATCH_MESSAGES || chars + cost > MAX_BATCH_CHARS) {
            ranges.push(start..i);
            start = i;
            chars = 0;
        }
        chars += cost;
    }

    if start < messages.len() {
        ranges.push(start..messages.len());
    }
    ranges
}

fn system_prompt(user_email: &str) -> String {
    format!(
        "You are an expert email analyst for {}.\n\
         Analyze the email data provided in the prompt and extract insights.\n\
         Always respond with a single well-formed JSON object exactly matching \
         the requested structure. Do not include any text outside the JSON.",
        user_email
    )
}

fn build_extraction_prompt(user_email: &str, messages: &[MessageRecord]) -> String {
    let summaries: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| {
            serde_json::json!({
                "sender": format!("{} <{}>", m.sender.name, m.sender.address),
                "to": m.recipients
                    .iter()
                    .map(|r| r.address.as_str())
                    .collect::<Vec<_>>(),
                "subject": clip(&m.subject, PROMPT_SUBJECT_CHARS),
                "date": m.timestamp.to_rfc3339(),
                "snippet": clip(&m.excerpt, PROMPT_SNIPPET_CHARS),
            })
        })
        .collect();

    format!(
        r#"Analyze the following email summaries from {user}'s mailbox.

Email data (sender, recipients, subject, date, snippet):
{data}

Extract insights into JSON with exactly this structure:
{{
    "relationships": [
        {{"name": "Person's Name", "address": "person@example.com", "context": "who they are and recent interactions"}}
    ],
    "projects": [
        {{"name": "Project Name", "description": "brief description"}}
    ],
    "action_items": [
        {{"description": "what needs to be done", "deadline": "due date if stated, else null"}}
    ],
    "important_facts": [
        "a notable fact worth remembering"
    ]
}}

Only include entries supported by the email data. Use empty arrays when a
category has nothing. Respond with the JSON object and nothing else."#,
        user = user_email,
        data = serde_json::to_string_pretty(&summaries).unwrap_or_else(|_| "[]".to_string()),
    )
}

fn clip(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        text.to_string()
    } else {
        text.chars().take(budget).collect()
    }
}

// ============================================================================
// Response parsing
// ============================================================================

/// Parse one batch response, tolerating markdown fences and stray prose.
fn parse_batch(response: &str) -> Result<ExtractedInsightBatch, ExtractionParseError> {
    let cleaned = strip_code_fences(response);

    if let Ok(batch) = serde_json::from_str::<ExtractedInsightBatch>(cleaned.trim()) {
        return Ok(batch);
    }

    // Fall back to the outermost {...} in the response
    if let Ok(re) = regex::Regex::new(r"(?s)\{.*\}") {
        if let Some(found) = re.find(&cleaned) {
            if let Ok(batch) = serde_json::from_str::<ExtractedInsightBatch>(found.as_str()) {
                return Ok(batch);
            }
        }
    }

    Err(ExtractionParseError(
        cleaned.chars().take(120).collect::<String>(),
    ))
}

fn strip_code_fences(response: &str) -> String {
    let trimmed = response.trim();
    if let Some(rest) = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
    {
        return rest.trim_end_matches("```").trim().to_string();
    }
    trimmed.to_string()
}

/// Combine per-batch results, deduplicating by natural key.
fn merge_batches(batches: Vec<ExtractedInsightBatch>) -> ExtractedInsightBatch {
    use std::collections::HashSet;

    let mut merged = ExtractedInsightBatch::default();
    let mut seen_relationships: HashSet<String> = HashSet::new();
    let mut seen_projects: HashSet<String> = HashSet::new();
    let mut seen_actions: HashSet<String> = HashSet::new();
    let mut seen_facts: HashSet<String> = HashSet::new();

    for batch in batches {
        for mention in batch.relationships {
            let key = relationship_key(&mention);
            if key.is_empty() || !seen_relationships.insert(key) {
                continue;
            }
            merged.relationships.push(mention);
        }
        for project in batch.projects {
            let key = normalized_project_name(&project.name);
            if key.is_empty() || !seen_projects.insert(key) {
                continue;
            }
            merged.projects.push(project);
        }
        for item in batch.action_items {
            if item.description.trim().is_empty() {
                continue;
            }
            let key = action_item_key(&item.description, item.deadline.as_deref());
            if !seen_actions.insert(key) {
                continue;
            }
            merged.action_items.push(item);
        }
        for fact in batch.facts {
            let key = fact.trim().to_lowercase();
            if key.is_empty() || !seen_facts.insert(key) {
                continue;
            }
            merged.facts.push(fact);
        }
    }

    merged
}

// ============================================================================
// Tests
// ============================================================================
