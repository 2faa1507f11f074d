//! Auto-router: natural-language goal → workflow execution plan.
//!
//! One model call (strict JSON, schema-validated) turns a goal into a
//! list of [`Action`]s, which are then dispatched **directly** onto the
//! workflow functions by name with a typed argument map — no generated
//! code is ever executed.
//!
//! The keyword heuristics, the simple/complex workflow split, and the
//! 100-record threshold are deliberate routing policy; change them only
//! as configuration, not silently.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::RlmError;
use crate::invoker::Invoker;
use crate::models::EmailRecord;
use crate::primitives::{dedupe_emails, filter_by_keyword, filter_by_sender};
use crate::security_workflows::{SecurityWorkflows, TriageOptions};
use crate::structured::invoke_json;
use crate::workflows::Workflows;

/// Workflows cheap enough for a direct (non-RLM) path on small corpora.
pub const SIMPLE_WORKFLOWS: [&str; 4] = [
    "find_action_items",
    "inbox_triage",
    "weekly_summary",
    "sender_analysis",
];

/// Workflows that always warrant the RLM path.
pub const COMPLEX_WORKFLOWS: [&str; 3] = [
    "security_triage",
    "detect_attack_chains",
    "phishing_analysis",
];

/// Corpus size under which simple goals can skip the RLM entirely.
pub const SMALL_CORPUS_THRESHOLD: usize = 100;

/// One planned operation: a workflow or primitive name plus arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    pub function: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

/// The model's interpretation of a goal.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutePlan {
    #[serde(default)]
    pub reasoning: String,
    pub actions: Vec<Action>,
}

/// Routing decision for a goal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Run the planned actions through the RLM engine.
    Rlm,
    /// Small corpus, simple goal: plain retrieval is enough.
    Direct,
}

/// Detect coarse intent from goal keywords.
pub fn detect_intent(goal: &str) -> &'static str {
    let goal = goal.to_lowercase();
    let table: [(&str, &[&str]); 7] = [
        ("send", &["send", "compose", "email to", "write to"]),
        ("read", &["read", "show", "display", "get", "fetch"]),
        ("label", &["label", "tag", "folder"]),
        ("triage", &["triage", "organize", "categorize", "classify"]),
        ("summarize", &["summarize", "summary", "overview"]),
        ("action_items", &["action items", "tasks", "todo", "deadlines"]),
        (
            "security",
            &["security", "alert", "threat", "attack", "phishing", "malware"],
        ),
    ];
    for (intent, keywords) in table {
        if keywords.iter().any(|k| goal.contains(k)) {
            return intent;
        }
    }
    "analyze"
}

/// Detect whether a goal maps to a pre-built workflow.
pub fn detect_workflow(goal: &str) -> Option<&'static str> {
    let goal = goal.to_lowercase();
    // Security workflows take precedence over the general ones: a goal
    // like "triage security alerts" is a security triage.
    if goal.contains("security") && goal.contains("triage") {
        return Some("security_triage");
    }
    if goal.contains("attack chain") || goal.contains("kill chain") {
        return Some("detect_attack_chains");
    }
    if goal.contains("phishing") {
        return Some("phishing_analysis");
    }
    if goal.contains("action item") || goal.contains("todo") {
        return Some("find_action_items");
    }
    if goal.contains("triage") || goal.contains("categorize") {
        return Some("inbox_triage");
    }
    if goal.contains("summary") || goal.contains("summarize") {
        return Some("weekly_summary");
    }
    if goal.contains("sender") && goal.contains("analy") {
        return Some("sender_analysis");
    }
    None
}

/// Decide between the RLM path and direct retrieval. Returns the route
/// and the reason, which is reported to the user.
pub fn should_use_rlm(
    email_count: usize,
    intent: &str,
    workflow: Option<&str>,
) -> (Route, String) {
    if matches!(intent, "send" | "label" | "read") {
        return (
            Route::Direct,
            format!("simple operation ({}) does not need the RLM", intent),
        );
    }
    if email_count >= SMALL_CORPUS_THRESHOLD {
        return (
            Route::Rlm,
            format!("large dataset ({} emails) needs chunked processing", email_count),
        );
    }
    if intent == "security" || workflow.map(|w| COMPLEX_WORKFLOWS.contains(&w)).unwrap_or(false) {
        return (Route::Rlm, "complex security analysis".to_string());
    }
    if workflow.map(|w| SIMPLE_WORKFLOWS.contains(&w)).unwrap_or(false) {
        return (
            Route::Direct,
            format!(
                "small dataset ({} emails) with a simple workflow",
                email_count
            ),
        );
    }
    (Route::Rlm, "analysis task".to_string())
}

/// Rough cost estimate for a plan, used to warn before expensive runs.
pub fn estimate_cost(actions: &[Action], email_count: usize) -> f64 {
    let per_email = |function: &str| -> f64 {
        match function {
            "security_triage" => 0.005,
            "detect_attack_chains" | "phishing_analysis" => 0.004,
            "inbox_triage" => 0.003,
            "weekly_summary" | "find_action_items" => 0.002,
            "parallel_map" => 0.003,
            "invoke" => 0.002,
            _ => 0.001,
        }
    };
    let total: f64 = actions
        .iter()
        .map(|a| 0.01 + per_email(&a.function) * email_count as f64)
        .sum();
    (total * 100.0).round() / 100.0
}

fn plan_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "reasoning": {"type": "string"},
            "actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "function": {"type": "string"},
                        "args": {"type": "object"},
                        "description": {"type": "string"}
                    },
                    "required": ["function"]
                }
            }
        },
        "required": ["actions"]
    })
}

const PLANNING_GUIDE: &str = r#"You are an email analysis planner. Decide which analysis functions accomplish the user's goal.

Available functions:

SECURITY WORKFLOWS:
- security_triage(deduplicate?, include_exec_summary?): complete alert triage (P1-P5 classification, IOCs, kill chains, executive summary)
- detect_attack_chains(window_minutes?, min_alerts_per_chain?): multi-stage attack detection over time windows
- phishing_analysis(): credential harvesting, BEC, brand impersonation buckets

GENERAL WORKFLOWS:
- inbox_triage(): classify emails into urgent/action_required/fyi/newsletter
- weekly_summary(): per-week summaries of activity
- find_action_items(): extract tasks with deadlines
- sender_analysis(top_n?): top senders with per-sender summaries

FILTERS (transform the working set before a workflow):
- filter_by_keyword(keyword)
- filter_by_sender(pattern)
- dedupe_emails()

Return a JSON object:
{
  "reasoning": "why these functions",
  "actions": [{"function": "name", "args": {"arg": "value"}, "description": "what this does"}]
}

Guidelines:
1. Prefer security_triage as the comprehensive starting point for security goals.
2. Prefer inbox_triage for inbox management goals.
3. Keep plans short: 1-3 actions.
4. Only use functions from the list above.
5. Return ONLY valid JSON."#;

/// Goal interpretation and dispatch.
pub struct Router {
    invoker: Arc<Invoker>,
}

impl Router {
    pub fn new(invoker: Arc<Invoker>) -> Self {
        Router { invoker }
    }

    /// Ask the model once for an action plan.
    pub async fn plan(
        &self,
        goal: &str,
        email_count: usize,
        history: &[(String, String)],
    ) -> Result<RoutePlan, RlmError> {
        let mut context = format!("The user has {} emails. Goal: {:?}", email_count, goal);
        if !history.is_empty() {
            context.push_str("\n\nConversation history:\n");
            for (turn_goal, turn_response) in history.iter().rev().take(3).rev() {
                let preview: String = turn_response.chars().take(200).collect();
                context.push_str(&format!("User: {}\nAgent: {}\n\n", turn_goal, preview));
            }
        }

        let value = invoke_json(
            &self.invoker,
            PLANNING_GUIDE,
            Some(&context),
            Some(&plan_schema()),
            2,
        )
        .await?;

        serde_json::from_value(value).map_err(|e| RlmError::InvalidStructuredOutput {
            reason: format!("plan did not match the expected shape: {}", e),
            last_response: String::new(),
        })
    }

    /// Dispatch a plan directly onto the workflow functions. Filter
    /// actions transform the working set; the last action's result is the
    /// plan result.
    pub async fn execute_plan(
        &self,
        plan: &RoutePlan,
        records: &[EmailRecord],
        workflows: &Workflows,
        security: &SecurityWorkflows,
    ) -> Result<serde_json::Value, RlmError> {
        let mut working: Vec<EmailRecord> = records.to_vec();
        let mut last_result = serde_json::json!(null);

        for action in &plan.actions {
            let args = &action.args;
            let str_arg = |name: &str| args.get(name).and_then(|v| v.as_str()).map(str::to_string);
            let num_arg = |name: &str| args.get(name).and_then(|v| v.as_u64());
            let bool_arg = |name: &str| args.get(name).and_then(|v| v.as_bool());

            last_result = match action.function.as_str() {
                "filter_by_keyword" => {
                    let keyword = str_arg("keyword").or_else(|| str_arg("pattern")).ok_or_else(
                        || RlmError::Configuration("filter_by_keyword needs a keyword".into()),
                    )?;
                    working = filter_by_keyword(&working, &keyword);
                    serde_json::json!({"filtered_to": working.len()})
                }
                "filter_by_sender" => {
                    let pattern = str_arg("pattern").or_else(|| str_arg("sender")).ok_or_else(
                        || RlmError::Configuration("filter_by_sender needs a pattern".into()),
                    )?;
                    working = filter_by_sender(&working, &pattern);
                    serde_json::json!({"filtered_to": working.len()})
                }
                "dedupe_emails" => {
                    working = dedupe_emails(&working);
                    serde_json::json!({"deduped_to": working.len()})
                }
                "inbox_triage" => to_json(&workflows.inbox_triage(&working).await?)?,
                "weekly_summary" => to_json(&workflows.weekly_summary(&working).await?)?,
                "find_action_items" => to_json(&workflows.find_action_items(&working).await?)?,
                "sender_analysis" => {
                    let top_n = num_arg("top_n").unwrap_or(10) as usize;
                    to_json(&workflows.sender_analysis(&working, top_n).await?)?
                }
                "security_triage" => {
                    let options = TriageOptions {
                        deduplicate: bool_arg("deduplicate").unwrap_or(true),
                        include_exec_summary: bool_arg("include_exec_summary").unwrap_or(true),
                    };
                    to_json(&security.security_triage(&working, options).await?)?
                }
                "detect_attack_chains" => {
                    let window = num_arg("window_minutes").unwrap_or(5) as u32;
                    let min_alerts = num_arg("min_alerts_per_chain").unwrap_or(2) as usize;
                    to_json(
                        &security
                            .detect_attack_chains(&working, window, min_alerts)
                            .await?,
                    )?
                }
                "phishing_analysis" => to_json(&security.phishing_analysis(&working).await?)?,
                other => {
                    return Err(RlmError::Configuration(format!(
                        "planned unknown function '{}'",
                        other
                    )))
                }
            };
        }

        Ok(last_result)
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<serde_json::Value, RlmError> {
    serde_json::to_value(value)
        .map_err(|e| RlmError::Configuration(format!("result serialization failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_intent() {
        assert_eq!(detect_intent("Triage security alerts"), "triage");
        assert_eq!(detect_intent("find malware in my inbox"), "security");
        assert_eq!(detect_intent("summarize my week"), "summarize");
        assert_eq!(detect_intent("what happened recently"), "analyze");
    }

    #[test]
    fn test_detect_workflow_precedence() {
        assert_eq!(
            detect_workflow("triage security alerts from last week"),
            Some("security_triage")
        );
        assert_eq!(detect_workflow("triage my inbox"), Some("inbox_triage"));
        assert_eq!(
            detect_workflow("find kill chains in alerts"),
            Some("detect_attack_chains")
        );
        assert_eq!(detect_workflow("analyze phishing"), Some("phishing_analysis"));
        assert_eq!(detect_workflow("draft a reply"), None);
    }

    #[test]
    fn test_should_use_rlm_thresholds() {
        // Large corpora always use the RLM.
        let (route, _) = should_use_rlm(250, "summarize", Some("weekly_summary"));
        assert_eq!(route, Route::Rlm);
        // Small + simple goes direct.
        let (route, _) = should_use_rlm(40, "summarize", Some("weekly_summary"));
        assert_eq!(route, Route::Direct);
        // Security always uses the RLM, even when small.
        let (route, _) = should_use_rlm(10, "security", Some("security_triage"));
        assert_eq!(route, Route::Rlm);
        // Reads never do.
        let (route, _) = should_use_rlm(500, "read", None);
        assert_eq!(route, Route::Direct);
    }

    #[test]
    fn test_estimate_cost_scales_with_corpus() {
        let triage = Action {
            function: "security_triage".into(),
            args: serde_json::Map::new(),
            description: String::new(),
        };
        let small = estimate_cost(std::slice::from_ref(&triage), 10);
        let large = estimate_cost(&[triage], 1000);
        assert!(large > small);
        assert!((estimate_cost(&[], 100)).abs() < f64::EPSILON);
    }
}
