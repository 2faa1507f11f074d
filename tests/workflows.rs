//! Workflow pipelines against a scripted endpoint, including the fixed
//! empty-input shapes and the structured-output retry contract.

mod common;

use std::sync::Arc;

use common::{dated_email, email, Reply, StubEndpoint};
use rlm_harness::error::RlmError;
use rlm_harness::invoker::Invoker;
use rlm_harness::security::{chunk_by_time, Severity};
use rlm_harness::security_workflows::{SecurityWorkflows, TriageOptions};
use rlm_harness::session::{RlmSession, DEFAULT_MODEL};
use rlm_harness::structured::{invoke_json, invoke_with_confidence};
use rlm_harness::workflows::Workflows;

fn security_stack(endpoint: Arc<StubEndpoint>) -> SecurityWorkflows {
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    SecurityWorkflows::new(Arc::new(Invoker::new(endpoint, session, None)), None, None)
}

fn general_stack(endpoint: Arc<StubEndpoint>) -> Workflows {
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    Workflows::new(Arc::new(Invoker::new(endpoint, session, None)), 3)
}

// ── empty corpus security triage ─────────────────────────────────────

#[tokio::test]
async fn empty_security_triage_has_fixed_shape() {
    let endpoint = StubEndpoint::always("unused");
    let stack = security_stack(endpoint.clone());

    let triage = stack
        .security_triage(&[], TriageOptions::default())
        .await
        .unwrap();

    assert_eq!(triage.summary.total, 0);
    assert_eq!(triage.summary.unique, 0);
    assert_eq!(triage.summary.critical, 0);
    assert_eq!(triage.summary.chains, 0);
    for severity in Severity::ALL {
        assert!(triage.classifications[&severity].is_empty());
    }
    assert!(triage.iocs.is_empty());
    assert!(triage.kill_chains.is_empty());
    assert!(triage.source_ip_analysis.is_empty());
    assert!(triage.suspicious_senders.is_empty());
    assert!(triage.risky_attachments.is_empty());
    assert!(triage.suspicious_urls.is_empty());
    assert_eq!(triage.executive_summary, "No alerts to triage.");
    // No model call happens for an empty corpus.
    assert_eq!(endpoint.call_count(), 0);

    // The serialized form keys classifications by P1..P5.
    let json = serde_json::to_value(&triage).unwrap();
    assert!(json["classifications"]["P1"].as_array().unwrap().is_empty());
    assert_eq!(json["iocs"]["file_hashes"]["md5"], serde_json::json!([]));
}

// ── classify_alerts ──────────────────────────────────────────────────

#[tokio::test]
async fn classify_alerts_two_pass() {
    // Two alerts carry explicit signals; two go to the model.
    let alerts = vec![
        email("1", "soc@x.com", "CRITICAL breach on db01", "active exploitation"),
        email("2", "soc@x.com", "medium disk usage advisory", "p3 routine"),
        email("3", "soc@x.com", "odd beacon", "something unusual"),
        email("4", "soc@x.com", "strange traffic", "unrecognized burst"),
    ];
    let endpoint = StubEndpoint::new(vec![Reply::Text("Alert 1: P2\nAlert 2: P5".into(), 10, 5)]);
    let stack = security_stack(endpoint.clone());

    let classified = stack.classify_alerts(&alerts, 20).await.unwrap();

    assert_eq!(classified[&Severity::P1].len(), 1);
    assert_eq!(classified[&Severity::P3].len(), 1);
    assert_eq!(classified[&Severity::P2].len(), 1);
    assert_eq!(classified[&Severity::P5].len(), 1);
    assert_eq!(endpoint.call_count(), 1);

    let total: usize = classified.values().map(Vec::len).sum();
    assert_eq!(total, alerts.len());
}

#[tokio::test]
async fn classify_alerts_sentinel_falls_back_to_p3() {
    let alerts = vec![email("1", "a@x.com", "odd beacon", "unusual")];
    let endpoint = StubEndpoint::new(vec![Reply::Timeout]);
    let stack = security_stack(endpoint);

    let classified = stack.classify_alerts(&alerts, 20).await.unwrap();
    assert_eq!(classified[&Severity::P3].len(), 1);
}

// ── time windows + kill chains ───────────────────────────────────────

#[tokio::test]
async fn kill_chain_detection_inspects_multi_alert_windows() {
    let alerts = vec![
        dated_email("a", "2026-01-15 10:00:00", "Phishing email delivered", "T1566 lure"),
        dated_email("b", "2026-01-15 10:01:00", "Powershell execution", "encoded command"),
        dated_email("c", "2026-01-15 10:02:00", "Outbound C2 beacon", "callback traffic"),
        dated_email("d", "2026-01-15 10:07:00", "Lone scanner hit", "single event"),
    ];

    let windows = chunk_by_time(&alerts, 5);
    assert_eq!(windows.len(), 2);
    assert_eq!(windows["2026-01-15T10:00:00"].len(), 3);
    assert_eq!(windows["2026-01-15T10:05:00"].len(), 1);

    let endpoint = StubEndpoint::new(vec![Reply::Text(
        "CHAIN_DETECTED: yes\nPATTERN: Phishing -> Execution -> C2\nSEVERITY: P1\n\
         MITRE_TECHNIQUES: T1566, T1059, T1071"
            .into(),
        10,
        5,
    )]);
    let stack = security_stack(endpoint.clone());

    let chains = stack.detect_kill_chains(&windows).await.unwrap();

    // Only the 3-alert window is inspected; the singleton is skipped.
    assert_eq!(chains.len(), 1);
    assert_eq!(endpoint.call_count(), 1);
    let chain = &chains[0];
    assert!(chain.chain_detected);
    assert_eq!(chain.window, "2026-01-15T10:00:00");
    assert_eq!(chain.pattern, "Phishing -> Execution -> C2");
    assert_eq!(chain.severity, Severity::P1);
    assert_eq!(chain.mitre_techniques, vec!["T1059", "T1071", "T1566"]);
    assert_eq!(chain.alert_count, 3);
}

#[tokio::test]
async fn attack_chains_sorted_by_severity_then_confidence() {
    let alerts = vec![
        // Window one: two low-severity alerts.
        dated_email("a", "2026-01-15 09:00:00", "Recon scan", "from 10.1.1.1"),
        dated_email("b", "2026-01-15 09:01:00", "Recon scan 2", "from 10.1.1.1"),
        // Window two: two critical alerts.
        dated_email("c", "2026-01-15 11:00:00", "Ransomware staging", "host fs01"),
        dated_email("d", "2026-01-15 11:02:00", "File encryption started", "host fs01"),
    ];

    let endpoint = StubEndpoint::new(vec![
        // Window 09:00 verdict.
        Reply::Text(
            "CHAIN_DETECTED: yes\nPATTERN: Recon\nSEVERITY: P4\nMITRE_TECHNIQUES: T1082".into(),
            10,
            5,
        ),
        // Window 11:00 verdict.
        Reply::Text(
            "CHAIN_DETECTED: yes\nPATTERN: Ransomware\nSEVERITY: P1\nMITRE_TECHNIQUES: T1486"
                .into(),
            10,
            5,
        ),
        // Confidence follow-ups, one per detected chain, in window order.
        Reply::Text("CONFIDENCE: 60\nREASONING: weak".into(), 10, 5),
        Reply::Text("CONFIDENCE: 95\nREASONING: strong".into(), 10, 5),
    ]);
    let stack = security_stack(endpoint);

    let chains = stack.detect_attack_chains(&alerts, 5, 2).await.unwrap();

    assert_eq!(chains.len(), 2);
    // P1 ranks before P4 regardless of detection order.
    assert_eq!(chains[0].severity, Severity::P1);
    assert!((chains[0].confidence - 0.95).abs() < 1e-9);
    assert_eq!(chains[1].severity, Severity::P4);
    // Synthetic ids carry the chain_ prefix and a 3-digit counter.
    assert!(chains[0].attack_id.starts_with("chain_"));
    assert!(chains[0].attack_id.ends_with("_001") || chains[0].attack_id.ends_with("_002"));
    // Affected systems picked up the snippet IP.
    assert!(chains[1].affected_systems.contains(&"10.1.1.1".to_string()));
}

#[tokio::test]
async fn detect_attack_chains_empty_input() {
    let endpoint = StubEndpoint::always("unused");
    let stack = security_stack(endpoint.clone());
    let chains = stack.detect_attack_chains(&[], 5, 2).await.unwrap();
    assert!(chains.is_empty());
    assert_eq!(endpoint.call_count(), 0);
}

// ── phishing analysis ────────────────────────────────────────────────

#[tokio::test]
async fn phishing_analysis_buckets() {
    let emails = vec![
        email(
            "1",
            "PayPal Billing <billing@pay-pal-alerts.ru>",
            "verify account now",
            "your suspended account requires action",
        ),
        email(
            "2",
            "it@corp.example",
            "invoice attached",
            "open the attached invoice.exe urgently",
        ),
    ];
    let endpoint = StubEndpoint::new(vec![Reply::Text("Mostly credential phishing.".into(), 10, 5)]);
    let stack = security_stack(endpoint);

    let report = stack.phishing_analysis(&emails).await.unwrap();

    assert!(!report.credential_harvesting.is_empty());
    assert!(!report.brand_impersonation.is_empty());
    assert!(!report.malicious_attachments.is_empty());
    assert_eq!(report.summary, "Mostly credential phishing.");
}

#[tokio::test]
async fn phishing_analysis_empty_input() {
    let endpoint = StubEndpoint::always("unused");
    let stack = security_stack(endpoint.clone());
    let report = stack.phishing_analysis(&[]).await.unwrap();
    assert!(report.credential_harvesting.is_empty());
    assert_eq!(report.summary, "No emails to analyze.");
    assert_eq!(endpoint.call_count(), 0);
}

// ── general workflows ────────────────────────────────────────────────

#[tokio::test]
async fn inbox_triage_parses_categories() {
    let emails = vec![
        email("1", "boss@corp.example", "budget approval", "need this today"),
        email("2", "news@list.example", "weekly digest", "top stories"),
    ];
    let endpoint = StubEndpoint::new(vec![Reply::Text(
        "Email 1: urgent\nEmail 2: newsletter".into(),
        10,
        5,
    )]);
    let stack = general_stack(endpoint);

    let triage = stack.inbox_triage(&emails).await.unwrap();
    assert_eq!(triage.counts["urgent"], 1);
    assert_eq!(triage.counts["newsletter"], 1);
    assert_eq!(triage.counts["fyi"], 0);
    assert_eq!(triage.categories["urgent"][0].id, "1");
}

#[tokio::test]
async fn inbox_triage_empty_input() {
    let endpoint = StubEndpoint::always("unused");
    let stack = general_stack(endpoint.clone());
    let triage = stack.inbox_triage(&[]).await.unwrap();
    assert_eq!(triage.summary, "No emails to triage.");
    assert!(triage.categories.values().all(|v| v.is_empty()));
    assert_eq!(endpoint.call_count(), 0);
}

#[tokio::test]
async fn find_action_items_flattens_chunks() {
    let emails: Vec<_> = (0..25)
        .map(|i| email(&format!("m{}", i), "pm@corp.example", "standup notes", "tasks inside"))
        .collect();
    // 25 emails → two chunks of 20 and 5.
    let endpoint = StubEndpoint::new(vec![
        Reply::Text(
            r#"{"action_items":[{"task":"ship report","deadline":"Friday","sender":"pm","priority":"high"}]}"#.into(),
            10,
            5,
        ),
        Reply::Text(r#"{"action_items":[{"task":"book room"}]}"#.into(), 10, 5),
    ]);
    let stack = general_stack(endpoint);

    let report = stack.find_action_items(&emails).await.unwrap();
    assert_eq!(report.action_items.len(), 2);
    assert_eq!(report.action_items[0].task, "ship report");
    assert_eq!(report.action_items[1].deadline, "");
    assert!(report.failed_chunks.is_empty());
}

#[tokio::test]
async fn weekly_summary_empty_input() {
    let endpoint = StubEndpoint::always("unused");
    let stack = general_stack(endpoint);
    let summary = stack.weekly_summary(&[]).await.unwrap();
    assert_eq!(summary.summary, "No emails to summarize.");
}

#[tokio::test]
async fn sender_analysis_orders_by_volume() {
    let mut emails = vec![
        email("1", "alice@corp.example", "a", ""),
        email("2", "alice@corp.example", "b", ""),
        email("3", "bob@corp.example", "c", ""),
    ];
    emails.push(email("4", "alice@corp.example", "d", ""));
    let endpoint = StubEndpoint::always("talks about projects");
    let stack = general_stack(endpoint);

    let analysis = stack.sender_analysis(&emails, 2).await.unwrap();
    assert_eq!(analysis.senders.len(), 2);
    assert_eq!(analysis.senders[0].sender, "alice@corp.example");
    assert_eq!(analysis.senders[0].count, 3);
}

// ── structured-output contract ───────────────────────────────────────

#[tokio::test]
async fn invoke_json_retries_exactly_max_plus_one() {
    // A reply that never parses fails after exactly max_retries + 1 attempts.
    let endpoint = StubEndpoint::always("this is not json");
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    let invoker = Invoker::new(endpoint.clone(), session, None);

    let err = invoke_json(&invoker, "give json", None, None, 2)
        .await
        .unwrap_err();
    assert!(matches!(err, RlmError::InvalidStructuredOutput { .. }));
    assert_eq!(endpoint.call_count(), 3);

    if let RlmError::InvalidStructuredOutput { last_response, .. } = err {
        assert_eq!(last_response, "this is not json");
    }
}

#[tokio::test]
async fn invoke_json_succeeds_on_second_attempt() {
    let endpoint = StubEndpoint::new(vec![
        Reply::Text("oops".into(), 10, 5),
        Reply::Text(r#"{"ok": true}"#.into(), 10, 5),
    ]);
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    let invoker = Invoker::new(endpoint.clone(), session, None);

    let value = invoke_json(&invoker, "give json", None, None, 3)
        .await
        .unwrap();
    assert_eq!(value["ok"], true);
    assert_eq!(endpoint.call_count(), 2);
}

#[tokio::test]
async fn invoke_json_schema_mismatch_retries_with_feedback() {
    let schema = serde_json::json!({
        "type": "object",
        "properties": {"count": {"type": "integer"}},
        "required": ["count"]
    });
    let endpoint = StubEndpoint::new(vec![
        Reply::Text(r#"{"count": "three"}"#.into(), 10, 5),
        Reply::Text(r#"{"count": 3}"#.into(), 10, 5),
    ]);
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    let invoker = Invoker::new(endpoint.clone(), session, None);

    let value = invoke_json(&invoker, "count", None, Some(&schema), 2)
        .await
        .unwrap();
    assert_eq!(value["count"], 3);
    assert_eq!(endpoint.call_count(), 2);
}

#[tokio::test]
async fn low_confidence_raises() {
    let endpoint = StubEndpoint::new(vec![Reply::Text(
        "Probably fine.\nCONFIDENCE: 30\nREASONING: sparse evidence".into(),
        10,
        5,
    )]);
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    let invoker = Invoker::new(endpoint, session, None);

    let err = invoke_with_confidence(&invoker, "assess", None, 0.7)
        .await
        .unwrap_err();
    match err {
        RlmError::LowConfidence {
            confidence,
            threshold,
            reasoning,
        } => {
            assert!((confidence - 0.3).abs() < 1e-9);
            assert!((threshold - 0.7).abs() < 1e-9);
            assert_eq!(reasoning, "sparse evidence");
        }
        other => panic!("expected LowConfidence, got {:?}", other),
    }
}

#[tokio::test]
async fn high_confidence_passes_through() {
    let endpoint = StubEndpoint::new(vec![Reply::Text(
        "Definitely.\nCONFIDENCE: 90\nREASONING: corroborated".into(),
        10,
        5,
    )]);
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 1000, 10);
    let invoker = Invoker::new(endpoint, session, None);

    let reply = invoke_with_confidence(&invoker, "assess", None, 0.7)
        .await
        .unwrap();
    assert!((reply.confidence - 0.9).abs() < 1e-9);
    assert!(reply.answer.starts_with("Definitely."));
}
