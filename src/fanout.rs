//! Parallel fan-out over chunks with bounded concurrency.
//!
//! Results are indexed by input position regardless of completion order.
//! A failing invocation leaves its sentinel string in its slot; a
//! `BudgetExceeded` / `RecursionDepthExceeded` from any worker cancels
//! outstanding work and propagates (dropping the stream aborts the
//! in-flight futures).

use futures::stream::{self, StreamExt, TryStreamExt};

use crate::error::RlmError;
use crate::invoker::{InvokeOptions, Invoker};

/// Default fan-out worker count.
pub const DEFAULT_WORKERS: usize = 5;

/// Apply one prompt to every chunk, rendering each chunk to context text
/// with `context_fn`. Returns one result per chunk, in chunk order.
pub async fn parallel_map<T, F>(
    invoker: &Invoker,
    prompt: &str,
    chunks: &[T],
    context_fn: F,
    max_workers: usize,
) -> Result<Vec<String>, RlmError>
where
    F: Fn(&T) -> String,
{
    let pairs: Vec<(String, String)> = chunks
        .iter()
        .map(|chunk| (prompt.to_string(), context_fn(chunk)))
        .collect();
    parallel_llm_query(invoker, pairs, max_workers).await
}

/// Lower-level fan-out over pre-built `(prompt, context)` pairs.
///
/// `buffered` both bounds concurrency and yields results in input order,
/// so no index bookkeeping is needed here.
pub async fn parallel_llm_query(
    invoker: &Invoker,
    pairs: Vec<(String, String)>,
    max_workers: usize,
) -> Result<Vec<String>, RlmError> {
    let workers = max_workers.max(1);
    stream::iter(pairs.into_iter().map(|(prompt, context)| async move {
        invoker
            .invoke_with(
                &prompt,
                InvokeOptions {
                    context: Some(context),
                    ..Default::default()
                },
            )
            .await
    }))
    .buffered(workers)
    .try_collect()
    .await
}
