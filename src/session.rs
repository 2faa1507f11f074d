//! Budget and depth governor.
//!
//! One [`RlmSession`] exists per program execution and is shared (via
//! `Arc`) by every invocation path: direct `invoke`, fan-out workers, and
//! workflow pipelines. It enforces three ceilings:
//!
//! - **Cost** — cumulative token usage priced against a fixed per-model
//!   table must stay below `max_budget_usd`.
//! - **Calls** — at most `max_calls` external model calls.
//! - **Depth** — a logical recursion counter bounded by `max_depth`,
//!   tracked per invocation scope with an RAII guard (not a call-stack
//!   walk; fan-out chains share the same counter).
//!
//! Token and call counters sit behind one mutex; the depth counter is an
//! atomic so guard acquisition never blocks on the counter lock.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::RlmError;

/// USD per million tokens, `(model_prefix, input, output)`. Unknown models
/// price as the default model.
const MODEL_PRICING: [(&str, f64, f64); 4] = [
    ("claude-sonnet-4", 3.0, 15.0),
    ("claude-opus-4", 15.0, 75.0),
    ("claude-3-5-haiku", 0.80, 4.0),
    ("claude-3-5-sonnet", 3.0, 15.0),
];

/// Default model for all invocations.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Price table lookup by model-id prefix.
pub fn pricing_for(model: &str) -> (f64, f64) {
    for (prefix, input, output) in MODEL_PRICING {
        if model.starts_with(prefix) {
            return (input, output);
        }
    }
    (3.0, 15.0)
}

#[derive(Debug, Default)]
struct Counters {
    total_input_tokens: u64,
    total_output_tokens: u64,
    call_count: u64,
    cache_hits: u64,
    cache_misses: u64,
    tokens_saved: u64,
    updated_at: Option<DateTime<Utc>>,
}

/// Session governor: cost/call/depth ceilings plus usage accounting.
pub struct RlmSession {
    pub session_id: String,
    pub model_id: String,
    pub max_budget_usd: f64,
    pub max_calls: u64,
    pub max_depth: u32,
    pub created_at: DateTime<Utc>,
    counters: Mutex<Counters>,
    current_depth: AtomicU32,
}

impl RlmSession {
    pub fn new(model_id: &str, max_budget_usd: f64, max_calls: u64, max_depth: u32) -> Arc<Self> {
        Arc::new(RlmSession {
            session_id: format!("rlm_{}", Utc::now().format("%Y%m%d_%H%M%S")),
            model_id: model_id.to_string(),
            max_budget_usd,
            max_calls,
            max_depth,
            created_at: Utc::now(),
            counters: Mutex::new(Counters::default()),
            current_depth: AtomicU32::new(0),
        })
    }

    /// Cumulative cost in USD at the configured model's pricing.
    pub fn current_cost(&self) -> f64 {
        let counters = self.counters.lock().unwrap();
        let (input_price, output_price) = pricing_for(&self.model_id);
        counters.total_input_tokens as f64 / 1_000_000.0 * input_price
            + counters.total_output_tokens as f64 / 1_000_000.0 * output_price
    }

    /// Raise [`RlmError::BudgetExceeded`] when the cumulative cost or the
    /// call count has reached its ceiling. Must be called before every
    /// model invocation; no successful call may begin once the pre-call
    /// cost already meets the budget.
    pub fn check_budget(&self) -> Result<(), RlmError> {
        let cost = self.current_cost();
        if cost >= self.max_budget_usd {
            return Err(RlmError::BudgetExceeded(format!(
                "cost ${:.4} reached budget ${:.4}",
                cost, self.max_budget_usd
            )));
        }
        let calls = self.counters.lock().unwrap().call_count;
        if calls >= self.max_calls {
            return Err(RlmError::BudgetExceeded(format!(
                "call count {} reached limit {}",
                calls, self.max_calls
            )));
        }
        Ok(())
    }

    /// Enter an invocation scope, incrementing the depth counter. Fails
    /// with [`RlmError::RecursionDepthExceeded`] when the counter already
    /// equals `max_depth`. The returned guard decrements on every exit
    /// path, including panics and cancellation.
    pub fn enter(self: &Arc<Self>) -> Result<DepthGuard, RlmError> {
        let result =
            self.current_depth
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                    if depth >= self.max_depth {
                        None
                    } else {
                        Some(depth + 1)
                    }
                });
        match result {
            Ok(_) => Ok(DepthGuard {
                session: Arc::clone(self),
            }),
            Err(depth) => Err(RlmError::RecursionDepthExceeded(format!(
                "depth {} reached limit {}",
                depth, self.max_depth
            ))),
        }
    }

    pub fn current_depth(&self) -> u32 {
        self.current_depth.load(Ordering::SeqCst)
    }

    /// Record one completed external call's token usage.
    pub fn add_usage(&self, input_tokens: u64, output_tokens: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.total_input_tokens += input_tokens;
        counters.total_output_tokens += output_tokens;
        counters.updated_at = Some(Utc::now());
    }

    /// Count one external model call (timeouts included; cache hits not).
    pub fn record_call(&self) {
        let mut counters = self.counters.lock().unwrap();
        counters.call_count += 1;
        counters.updated_at = Some(Utc::now());
    }

    pub fn record_cache_hit(&self, tokens_saved: u64) {
        let mut counters = self.counters.lock().unwrap();
        counters.cache_hits += 1;
        counters.tokens_saved += tokens_saved;
        counters.updated_at = Some(Utc::now());
    }

    pub fn record_cache_miss(&self) {
        self.counters.lock().unwrap().cache_misses += 1;
    }

    /// Point-in-time snapshot of every counter.
    pub fn stats(&self) -> SessionStats {
        let counters = self.counters.lock().unwrap();
        let (input_price, output_price) = pricing_for(&self.model_id);
        let total_cost = counters.total_input_tokens as f64 / 1_000_000.0 * input_price
            + counters.total_output_tokens as f64 / 1_000_000.0 * output_price;
        SessionStats {
            session_id: self.session_id.clone(),
            model_id: self.model_id.clone(),
            created_at: self.created_at,
            updated_at: counters.updated_at,
            total_input_tokens: counters.total_input_tokens,
            total_output_tokens: counters.total_output_tokens,
            call_count: counters.call_count,
            cache_hits: counters.cache_hits,
            cache_misses: counters.cache_misses,
            tokens_saved: counters.tokens_saved,
            total_cost,
            max_budget_usd: self.max_budget_usd,
            max_calls: self.max_calls,
            current_depth: self.current_depth(),
            max_depth: self.max_depth,
        }
    }
}

/// RAII scope for one invocation's depth slot.
pub struct DepthGuard {
    session: Arc<RlmSession>,
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.session.current_depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serializable session snapshot, reported with results and persisted in
/// checkpoints.
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
pub struct SessionStats {
    pub session_id: String,
    pub model_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub call_count: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub tokens_saved: u64,
    pub total_cost: f64,
    pub max_budget_usd: f64,
    pub max_calls: u64,
    pub current_depth: u32,
    pub max_depth: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_and_cost_accumulate() {
        let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 3);
        session.add_usage(1_000_000, 0);
        session.record_call();
        assert!((session.current_cost() - 3.0).abs() < 1e-9);
        session.add_usage(0, 1_000_000);
        session.record_call();
        assert!((session.current_cost() - 18.0).abs() < 1e-9);

        let stats = session.stats();
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.total_input_tokens, 1_000_000);
        assert_eq!(stats.total_output_tokens, 1_000_000);
    }

    #[test]
    fn test_budget_ceiling() {
        let session = RlmSession::new(DEFAULT_MODEL, 0.001, 100, 3);
        assert!(session.check_budget().is_ok());
        // 1000 output tokens at $15/M = $0.015 > $0.001.
        session.add_usage(0, 1000);
        let err = session.check_budget().unwrap_err();
        assert!(matches!(err, RlmError::BudgetExceeded(_)));
    }

    #[test]
    fn test_call_ceiling() {
        let session = RlmSession::new(DEFAULT_MODEL, 5.0, 2, 3);
        session.record_call();
        assert!(session.check_budget().is_ok());
        session.record_call();
        assert!(matches!(
            session.check_budget(),
            Err(RlmError::BudgetExceeded(_))
        ));
    }

    #[test]
    fn test_depth_guard_scoping() {
        let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 2);
        let g1 = session.enter().unwrap();
        let g2 = session.enter().unwrap();
        assert_eq!(session.current_depth(), 2);
        assert!(matches!(
            session.enter(),
            Err(RlmError::RecursionDepthExceeded(_))
        ));
        drop(g2);
        assert_eq!(session.current_depth(), 1);
        let _g3 = session.enter().unwrap();
        drop(g1);
        assert_eq!(session.current_depth(), 1);
    }

    #[test]
    fn test_depth_never_exceeds_max_under_contention() {
        let session = RlmSession::new(DEFAULT_MODEL, 5.0, 100, 4);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = Arc::clone(&session);
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    if let Ok(guard) = s.enter() {
                        assert!(s.current_depth() <= s.max_depth);
                        drop(guard);
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(session.current_depth(), 0);
    }

    #[test]
    fn test_pricing_table() {
        assert_eq!(pricing_for("claude-sonnet-4-20250514"), (3.0, 15.0));
        assert_eq!(pricing_for("claude-opus-4-20250514"), (15.0, 75.0));
        assert_eq!(pricing_for("claude-3-5-haiku-20241022"), (0.80, 4.0));
        assert_eq!(pricing_for("somebody-elses-model"), (3.0, 15.0));
    }
}
