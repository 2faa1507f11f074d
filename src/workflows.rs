//! General email analysis workflows.
//!
//! Each workflow is a composed pipeline over the corpus primitives, the
//! invoker, and the fan-out layer. Dependencies are injected through
//! [`Workflows`], so every pipeline is testable against a stub endpoint.
//!
//! Contract shared by all workflows: on empty input they return their
//! normal result shape with every collection empty and a summary string
//! that explicitly says there was no data.

use std::collections::BTreeMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::RlmError;
use crate::fanout::{parallel_llm_query, parallel_map};
use crate::invoker::{is_sentinel, Invoker};
use crate::models::EmailRecord;
use crate::primitives::{
    batch_summaries, chunk_by_date, chunk_by_size, top_senders, DatePeriod,
};
use crate::structured::invoke_json;

/// Inbox triage categories, in reporting order.
pub const TRIAGE_CATEGORIES: [&str; 4] = ["urgent", "action_required", "fyi", "newsletter"];

static TRIAGE_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)email\s*(\d+)\s*:\s*([a-z_]+)").unwrap());

/// Result of [`Workflows::inbox_triage`].
#[derive(Debug, Clone, Serialize)]
pub struct InboxTriage {
    pub categories: BTreeMap<String, Vec<EmailRecord>>,
    pub counts: BTreeMap<String, usize>,
    pub summary: String,
}

/// Result of [`Workflows::weekly_summary`].
#[derive(Debug, Clone, Serialize)]
pub struct WeeklySummary {
    pub period_summaries: BTreeMap<String, String>,
    pub summary: String,
}

/// One extracted task with its metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionItem {
    pub task: String,
    #[serde(default)]
    pub deadline: String,
    #[serde(default)]
    pub sender: String,
    #[serde(default)]
    pub priority: String,
}

/// Result of [`Workflows::find_action_items`].
#[derive(Debug, Clone, Serialize)]
pub struct ActionItemsReport {
    pub action_items: Vec<ActionItem>,
    /// Chunks whose replies never produced valid JSON; their items are
    /// missing from `action_items`.
    pub failed_chunks: Vec<usize>,
    pub summary: String,
}

/// Per-sender report inside [`SenderAnalysis`].
#[derive(Debug, Clone, Serialize)]
pub struct SenderReport {
    pub sender: String,
    pub count: usize,
    pub summary: String,
}

/// Result of [`Workflows::sender_analysis`].
#[derive(Debug, Clone, Serialize)]
pub struct SenderAnalysis {
    pub senders: Vec<SenderReport>,
    pub summary: String,
}

/// Schema for the action-items reply.
pub fn action_items_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "action_items": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "task": {"type": "string"},
                        "deadline": {"type": "string"},
                        "sender": {"type": "string"},
                        "priority": {"type": "string"}
                    },
                    "required": ["task"]
                }
            }
        },
        "required": ["action_items"]
    })
}

/// General workflow library with injected dependencies.
pub struct Workflows {
    invoker: Arc<Invoker>,
    workers: usize,
}

impl Workflows {
    pub fn new(invoker: Arc<Invoker>, workers: usize) -> Self {
        Workflows { invoker, workers }
    }

    /// Classify every email into urgent / action_required / fyi /
    /// newsletter via fan-out over size-chunked input.
    pub async fn inbox_triage(&self, emails: &[EmailRecord]) -> Result<InboxTriage, RlmError> {
        let mut categories: BTreeMap<String, Vec<EmailRecord>> = TRIAGE_CATEGORIES
            .iter()
            .map(|c| (c.to_string(), Vec::new()))
            .collect();

        if emails.is_empty() {
            let counts = categories.keys().map(|k| (k.clone(), 0)).collect();
            return Ok(InboxTriage {
                categories,
                counts,
                summary: "No emails to triage.".to_string(),
            });
        }

        let chunks = chunk_by_size(emails, 20);
        let prompt = "Classify each email into exactly one category: urgent, \
                      action_required, fyi, or newsletter.\n\
                      Respond with one line per email, nothing else:\n\
                      Email 1: <category>\nEmail 2: <category>";

        let replies = parallel_map(
            &self.invoker,
            prompt,
            &chunks,
            |chunk| batch_summaries(chunk, 4000),
            self.workers,
        )
        .await?;

        for (chunk, reply) in chunks.iter().zip(replies.iter()) {
            let mut assigned: BTreeMap<usize, String> = BTreeMap::new();
            if !is_sentinel(reply) {
                for caps in TRIAGE_LINE.captures_iter(reply) {
                    if let Ok(n) = caps[1].parse::<usize>() {
                        let category = caps[2].to_lowercase();
                        if TRIAGE_CATEGORIES.contains(&category.as_str()) {
                            assigned.insert(n, category);
                        }
                    }
                }
            }
            for (i, email) in chunk.iter().enumerate() {
                // Replies number emails from 1; unparsed emails land in fyi.
                let category = assigned
                    .get(&(i + 1))
                    .cloned()
                    .unwrap_or_else(|| "fyi".to_string());
                categories.get_mut(&category).unwrap().push(email.clone());
            }
        }

        let counts: BTreeMap<String, usize> = categories
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect();
        let summary = TRIAGE_CATEGORIES
            .iter()
            .map(|c| format!("{}: {}", c, counts[*c]))
            .collect::<Vec<_>>()
            .join(", ");

        Ok(InboxTriage {
            categories,
            counts,
            summary,
        })
    }

    /// Group by week and summarize each group in parallel, then aggregate.
    pub async fn weekly_summary(&self, emails: &[EmailRecord]) -> Result<WeeklySummary, RlmError> {
        if emails.is_empty() {
            return Ok(WeeklySummary {
                period_summaries: BTreeMap::new(),
                summary: "No emails to summarize.".to_string(),
            });
        }

        let groups = chunk_by_date(emails, DatePeriod::Week);
        let pairs: Vec<(String, String)> = groups
            .iter()
            .map(|(week, msgs)| {
                (
                    format!(
                        "Summarize the notable email activity for {} in 3-4 bullet points.",
                        week
                    ),
                    batch_summaries(msgs, 4000),
                )
            })
            .collect();

        let replies = parallel_llm_query(&self.invoker, pairs, self.workers).await?;

        let period_summaries: BTreeMap<String, String> = groups
            .keys()
            .cloned()
            .zip(replies.into_iter())
            .collect();

        let summary = period_summaries
            .iter()
            .map(|(week, text)| format!("## {}\n{}", week, text))
            .collect::<Vec<_>>()
            .join("\n\n");

        Ok(WeeklySummary {
            period_summaries,
            summary,
        })
    }

    /// Extract action items per chunk with a schema-validated JSON reply,
    /// then flatten. A chunk that never yields valid JSON is skipped and
    /// reported rather than failing the whole run.
    pub async fn find_action_items(
        &self,
        emails: &[EmailRecord],
    ) -> Result<ActionItemsReport, RlmError> {
        if emails.is_empty() {
            return Ok(ActionItemsReport {
                action_items: Vec::new(),
                failed_chunks: Vec::new(),
                summary: "No emails to scan for action items.".to_string(),
            });
        }

        let schema = action_items_schema();
        let prompt = "Extract every action item from these emails. For each, give the \
                      task, any deadline mentioned, the sender it came from, and a \
                      priority of high, medium, or low. Return JSON of the form \
                      {\"action_items\": [{\"task\", \"deadline\", \"sender\", \"priority\"}]}.";

        let mut action_items = Vec::new();
        let mut failed_chunks = Vec::new();

        for (index, chunk) in chunk_by_size(emails, 20).iter().enumerate() {
            let context = batch_summaries(chunk, 4000);
            match invoke_json(&self.invoker, prompt, Some(&context), Some(&schema), 2).await {
                Ok(value) => {
                    if let Ok(items) = serde_json::from_value::<Vec<ActionItem>>(
                        value.get("action_items").cloned().unwrap_or_default(),
                    ) {
                        action_items.extend(items);
                    }
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(_) => failed_chunks.push(index),
            }
        }

        let summary = format!(
            "{} action items extracted from {} emails.",
            action_items.len(),
            emails.len()
        );

        Ok(ActionItemsReport {
            action_items,
            failed_chunks,
            summary,
        })
    }

    /// Top senders by volume with a per-sender summary generated in
    /// parallel.
    pub async fn sender_analysis(
        &self,
        emails: &[EmailRecord],
        top_n: usize,
    ) -> Result<SenderAnalysis, RlmError> {
        if emails.is_empty() {
            return Ok(SenderAnalysis {
                senders: Vec::new(),
                summary: "No emails to analyze.".to_string(),
            });
        }

        let top = top_senders(emails, top_n);
        let by_sender = crate::primitives::chunk_by_sender(emails);

        let pairs: Vec<(String, String)> = top
            .iter()
            .map(|(sender, _)| {
                let msgs = by_sender.get(sender).cloned().unwrap_or_default();
                (
                    format!("What is {} emailing about? Answer in 1-2 sentences.", sender),
                    batch_summaries(&msgs, 3000),
                )
            })
            .collect();

        let replies = parallel_llm_query(&self.invoker, pairs, self.workers).await?;

        let senders: Vec<SenderReport> = top
            .into_iter()
            .zip(replies.into_iter())
            .map(|((sender, count), summary)| SenderReport {
                sender,
                count,
                summary,
            })
            .collect();

        let summary = format!(
            "Top {} senders cover {} of {} emails.",
            senders.len(),
            senders.iter().map(|s| s.count).sum::<usize>(),
            emails.len()
        );

        Ok(SenderAnalysis { senders, summary })
    }
}
