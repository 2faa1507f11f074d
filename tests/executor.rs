//! End-to-end user program execution: the Lua binding surface, result
//! sinks, and boundary error mapping.

mod common;

use std::sync::Arc;

use common::{email, Reply, StubEndpoint};
use rlm_harness::executor::{run_program, RlmEnv, NO_FINAL_NOTICE};
use rlm_harness::invoker::Invoker;
use rlm_harness::models::{Corpus, CorpusMetadata, FormatLevel};
use rlm_harness::security_workflows::SecurityWorkflows;
use rlm_harness::session::{RlmSession, DEFAULT_MODEL};
use rlm_harness::workflows::Workflows;

fn corpus(records: Vec<rlm_harness::models::EmailRecord>) -> Corpus {
    Corpus::new(
        records,
        CorpusMetadata {
            query: "test".to_string(),
            count: 0,
            format: FormatLevel::Metadata,
            pages_fetched: 0,
            source_file: None,
        },
    )
}

fn env_with(endpoint: Arc<StubEndpoint>, max_budget: f64, max_calls: u64) -> RlmEnv {
    let session = RlmSession::new(DEFAULT_MODEL, max_budget, max_calls, 10);
    let invoker = Arc::new(Invoker::new(endpoint, session, None));
    RlmEnv {
        workflows: Arc::new(Workflows::new(Arc::clone(&invoker), 3)),
        security: Arc::new(SecurityWorkflows::new(Arc::clone(&invoker), None, None)),
        invoker,
        workers: 3,
        checkpoint: None,
        checkpoint_interval: 10,
    }
}

fn sample_corpus() -> Corpus {
    corpus(vec![
        email("m1", "alice@corp.example", "standup", "notes"),
        email("m2", "bob@corp.example", "lunch", "tacos"),
        email("m3", "alice@corp.example", "review", "please look"),
    ])
}

#[tokio::test]
async fn program_sees_corpus_and_sets_final() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        "final('corpus has ' .. #emails .. ' emails for query ' .. metadata.query)".to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();

    assert_eq!(report.result, "corpus has 3 emails for query test");
    assert!(report.aborted.is_none());
    assert_eq!(report.stats.call_count, 0);
}

#[tokio::test]
async fn only_first_final_takes_effect() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        "final('first'); final('second')".to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "first");
}

#[tokio::test]
async fn final_named_serializes_binding() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        "counts = { total = #emails, senders = 2 }\nfinal_named('counts')".to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();

    let value: serde_json::Value = serde_json::from_str(&report.result).unwrap();
    assert_eq!(value["total"], 3);
    assert_eq!(value["senders"], 2);
}

#[tokio::test]
async fn final_named_missing_variable() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program("final_named('nope')".to_string(), sample_corpus(), env)
        .await
        .unwrap();
    assert_eq!(report.result, "[Error: variable 'nope' not found]");
}

#[tokio::test]
async fn missing_final_returns_notice() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program("local x = 1 + 1".to_string(), sample_corpus(), env)
        .await
        .unwrap();
    assert_eq!(report.result, NO_FINAL_NOTICE);
}

#[tokio::test]
async fn runtime_error_becomes_execution_error_string() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        "error('something broke in the program')".to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();
    assert!(report.result.starts_with("[Execution Error:"));
    assert!(report.result.contains("something broke"));
    assert!(report.aborted.is_none());
}

#[tokio::test]
async fn invoke_binding_reaches_endpoint() {
    let endpoint = StubEndpoint::new(vec![Reply::Text("two action items".into(), 50, 20)]);
    let env = env_with(endpoint.clone(), 5.0, 100);
    let report = run_program(
        "final(invoke('what are the action items?', batch_summaries(emails)))".to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();

    assert_eq!(report.result, "two action items");
    assert_eq!(report.stats.call_count, 1);
    assert_eq!(report.stats.total_input_tokens, 50);
}

#[tokio::test]
async fn parallel_map_binding_preserves_order() {
    let endpoint = StubEndpoint::new(vec![
        Reply::Text("summary 1".into(), 10, 5),
        Reply::Text("summary 2".into(), 10, 5),
    ]);
    let env = env_with(endpoint, 5.0, 100);
    let report = run_program(
        r#"
local chunks = chunk_by_size(emails, 2)
local results = parallel_map('summarize', chunks, 1)
final(aggregate_results(results, ' | '))
"#
        .to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();

    assert_eq!(report.result, "summary 1 | summary 2");
}

#[tokio::test]
async fn primitive_bindings_work_without_model() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        r#"
local groups = chunk_by_sender(emails)
local alice = groups['alice@corp.example']
final('alice sent ' .. #alice)
"#
        .to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "alice sent 2");
}

#[tokio::test]
async fn security_bindings_extract_iocs() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let mut rec = email("s1", "soc@corp.example", "alert", "");
    rec.body = "beacon to 10.9.8.7 via https://bad.xyz/cb".to_string();
    let report = run_program(
        r#"
local iocs = extract_iocs(emails)
final(iocs.ips[1] .. ' ' .. iocs.urls[1])
"#
        .to_string(),
        corpus(vec![rec]),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "10.9.8.7 https://bad.xyz/cb");
}

#[tokio::test]
async fn budget_exhaustion_classified_in_report() {
    // Stub replies bill ~$0.0001 each; the $0.001 ceiling trips after a
    // handful of calls, well before the loop finishes.
    let env = env_with(StubEndpoint::always("x"), 0.001, 100);
    let report = run_program(
        r#"
for i = 1, 50 do
    invoke('question ' .. i)
end
final('never reached')
"#
        .to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();

    assert_eq!(report.aborted.as_deref(), Some("BudgetExceeded"));
    assert!(report.result.starts_with("[Execution Error:"));
    assert!(report.stats.call_count >= 1);
}

#[tokio::test]
async fn pcall_can_catch_structured_output_error_but_not_hide_budget_kind() {
    // InvalidStructuredOutput is catchable by programs.
    let env = env_with(StubEndpoint::always("never json"), 5.0, 100);
    let report = run_program(
        r#"
local ok, err = pcall(function()
    return invoke_json('give json', nil, nil, 0)
end)
if not ok then
    final('caught: ' .. (errors.kind(tostring(err)) or 'unknown'))
end
"#
        .to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "caught: InvalidStructuredOutput");
    assert!(report.aborted.is_none());
}

#[tokio::test]
async fn budget_abort_recorded_even_when_swallowed() {
    // A program that swallows the budget error still ends with the abort
    // recorded in the session classification.
    let env = env_with(StubEndpoint::always("x"), 0.001, 100);
    let report = run_program(
        r#"
for i = 1, 50 do
    local ok = pcall(function() return invoke('q' .. i) end)
    if not ok then break end
end
final('finished quietly')
"#
        .to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();

    assert_eq!(report.result, "finished quietly");
    assert_eq!(report.aborted.as_deref(), Some("BudgetExceeded"));
}

#[tokio::test]
async fn session_accessor_reports_counters() {
    let env = env_with(StubEndpoint::always("fine"), 5.0, 100);
    let report = run_program(
        r#"
invoke('one')
invoke('two')
local stats = session()
final('calls=' .. stats.call_count)
"#
        .to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "calls=2");
}

#[tokio::test]
async fn security_triage_binding_empty_corpus() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        r#"
local triage = security_triage(emails)
final(triage.executive_summary)
"#
        .to_string(),
        corpus(vec![]),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "No alerts to triage.");
}

#[tokio::test]
async fn sandbox_removes_dangerous_globals() {
    let env = env_with(StubEndpoint::always("unused"), 5.0, 100);
    let report = run_program(
        "final(tostring(os) .. ' ' .. tostring(io) .. ' ' .. tostring(dofile))".to_string(),
        sample_corpus(),
        env,
    )
    .await
    .unwrap();
    assert_eq!(report.result, "nil nil nil");
}
