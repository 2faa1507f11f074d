//! Fan-out ordering and abort semantics.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Reply, StubEndpoint};
use rlm_harness::error::RlmError;
use rlm_harness::fanout::{parallel_llm_query, parallel_map};
use rlm_harness::invoker::{is_sentinel, Invoker};
use rlm_harness::session::{RlmSession, DEFAULT_MODEL};

#[tokio::test]
async fn results_follow_input_order_regardless_of_completion() {
    // The first input finishes last; slots still line up.
    let endpoint = StubEndpoint::new(vec![
        Reply::Delayed(Duration::from_millis(120), "result a".into()),
        Reply::Delayed(Duration::from_millis(60), "result b".into()),
        Reply::Delayed(Duration::from_millis(5), "result c".into()),
    ]);
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 10);
    let invoker = Invoker::new(endpoint, session, None);

    let results = parallel_map(
        &invoker,
        "summarize",
        &["a", "b", "c"],
        |chunk| chunk.to_string(),
        3,
    )
    .await
    .unwrap();

    assert_eq!(results, vec!["result a", "result b", "result c"]);
}

#[tokio::test]
async fn sentinel_occupies_failing_slot() {
    let endpoint = StubEndpoint::new(vec![
        Reply::Text("ok 1".into(), 10, 5),
        Reply::Timeout,
        Reply::Text("ok 3".into(), 10, 5),
    ]);
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 10);
    let invoker = Invoker::new(endpoint, session, None);

    // Workers=1 keeps the scripted replies aligned with the inputs.
    let results = parallel_map(&invoker, "p", &[1, 2, 3], |n| n.to_string(), 1)
        .await
        .unwrap();

    assert_eq!(results.len(), 3);
    assert_eq!(results[0], "ok 1");
    assert!(is_sentinel(&results[1]));
    assert_eq!(results[2], "ok 3");
}

#[tokio::test]
async fn budget_error_aborts_fanout() {
    let endpoint = StubEndpoint::always("ok");
    // Two calls allowed, then the governor trips.
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 2, 10);
    let invoker = Invoker::new(endpoint.clone(), Arc::clone(&session), None);

    let pairs: Vec<(String, String)> = (0..10)
        .map(|i| ("p".to_string(), format!("chunk {}", i)))
        .collect();

    let err = parallel_llm_query(&invoker, pairs, 1).await.unwrap_err();
    assert!(matches!(err, RlmError::BudgetExceeded(_)));
    // Work stopped promptly: nowhere near all ten chunks ran.
    assert!(endpoint.call_count() <= 3);
    assert_eq!(session.current_depth(), 0);
}

#[tokio::test]
async fn fanout_matches_single_invocations() {
    // Each fanned slot equals the corresponding single invocation.
    let fan_endpoint = StubEndpoint::always("uniform");
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 10);
    let invoker = Invoker::new(fan_endpoint, session, None);

    let chunks = vec!["x", "y", "z"];
    let fanned = parallel_map(&invoker, "p", &chunks, |c| c.to_string(), 2)
        .await
        .unwrap();

    for (i, chunk) in chunks.iter().enumerate() {
        let single = invoker.invoke("p", Some(chunk)).await.unwrap();
        assert_eq!(fanned[i], single);
    }
}

#[tokio::test]
async fn depth_slots_released_after_fanout() {
    let endpoint = StubEndpoint::always("ok");
    let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 4);
    let invoker = Invoker::new(endpoint, Arc::clone(&session), None);

    let pairs: Vec<(String, String)> = (0..8)
        .map(|i| ("p".to_string(), i.to_string()))
        .collect();
    parallel_llm_query(&invoker, pairs, 4).await.unwrap();
    assert_eq!(session.current_depth(), 0);
}
