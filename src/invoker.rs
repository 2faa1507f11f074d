//! Model invocation: endpoint abstraction, prompt composition, governor
//! enforcement, caching, and sentinel mapping.
//!
//! [`Invoker::invoke`] is the single gate every model call goes through —
//! workflows, fan-out workers, the structured-output layer, and user
//! programs all end up here. Guarantees, in order:
//!
//! 1. Governor check (budget, call ceiling) — may raise `BudgetExceeded`.
//! 2. Depth scope acquired — may raise `RecursionDepthExceeded`. Both are
//!    control flow and propagate; they are never reduced to strings.
//! 3. Prompt composed: optional RLM framing preamble, optional context
//!    block, task line, optional strict-JSON instruction.
//! 4. Cache probe (when enabled): a hit returns the stored text without an
//!    external call.
//! 5. External call with a hard max-tokens and per-call timeout.
//! 6. On success usage is added to the governor and the result cached; on
//!    failure a sentinel string starting `"[LLM Error: "` is returned in
//!    place of a result. Sentinels are in-band values — they are never
//!    cached and a multi-chunk workflow degrades gracefully around them.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::QueryCache;
use crate::error::RlmError;
use crate::session::RlmSession;

/// Hard completion cap for every request.
pub const MAX_COMPLETION_TOKENS: u32 = 4096;

/// Default per-call timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Fixed preamble prepended to sub-queries so the callee answers tersely
/// and in an aggregation-ready form.
pub const RLM_FRAMING: &str = "You are answering one sub-query within a larger recursive \
analysis. Many sub-queries like this one run over different slices of the same dataset and \
your answer will be aggregated programmatically with the others. Be concise and factual, \
structure your answer so it is easy to merge, and do not add preambles, caveats, or \
restatements of the task.";

/// A prompt ready to send to the model endpoint.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// A completion plus the usage counters the endpoint reported.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Endpoint failure classes. These map to sentinel strings, not errors,
/// at the invoker boundary.
#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("query timed out")]
    Timeout,
    #[error("{0}")]
    Other(String),
}

/// A remote completion service. The engine performs no inference of its
/// own; this trait is the entire model dependency.
#[async_trait]
pub trait ModelEndpoint: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, EndpointError>;
}

// ═══════════════════════════════════════════════════════════════════════
// Anthropic Messages API endpoint
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: [MessageBody<'a>; 1],
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    role: &'a str,
    content: &'a str,
}

/// Anthropic Messages API client.
///
/// Reads the API key from `ANTHROPIC_API_KEY`; a missing key is a
/// configuration error raised before any work starts.
pub struct AnthropicEndpoint {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl AnthropicEndpoint {
    pub fn from_env() -> Result<Self, RlmError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| {
            RlmError::Configuration("ANTHROPIC_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self::new(api_key, "https://api.anthropic.com".to_string()))
    }

    pub fn new(api_key: String, base_url: String) -> Self {
        AnthropicEndpoint {
            client: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }
}

#[async_trait]
impl ModelEndpoint for AnthropicEndpoint {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, EndpointError> {
        let body = MessagesRequest {
            model: &request.model,
            max_tokens: request.max_tokens,
            messages: [MessageBody {
                role: "user",
                content: &request.prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("content-type", "application/json")
            .timeout(request.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EndpointError::Timeout
                } else {
                    EndpointError::Other(format!("request failed: {}", e))
                }
            })?;

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            let detail = response.text().await.unwrap_or_default();
            return Err(EndpointError::Auth(format!("HTTP {}: {}", status, detail)));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(EndpointError::Other(format!("HTTP {}: {}", status, detail)));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| EndpointError::Other(format!("invalid response body: {}", e)))?;

        let text = parsed
            .content
            .first()
            .map(|block| block.text.trim().to_string())
            .ok_or_else(|| EndpointError::Other("no text content in response".to_string()))?;

        Ok(Completion {
            text,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Invoker
// ═══════════════════════════════════════════════════════════════════════

/// Per-call options for [`Invoker::invoke_with`].
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Data block placed between the framing and the task.
    pub context: Option<String>,
    /// Per-call timeout; the invoker default applies when unset.
    pub timeout_secs: Option<u64>,
    /// Model override for this call only.
    pub model: Option<String>,
    /// Append the strict-JSON closing instruction.
    pub json_mode: bool,
    /// Skip the cache for this call (e.g. confidence sampling).
    pub no_cache: bool,
    /// Framing override; the invoker default applies when unset.
    pub framing: Option<bool>,
}

/// True for the in-band failure values returned in place of model replies.
pub fn is_sentinel(text: &str) -> bool {
    text.starts_with("[LLM Error:")
}

/// The single entry point for model invocations.
pub struct Invoker {
    endpoint: Arc<dyn ModelEndpoint>,
    session: Arc<RlmSession>,
    cache: Option<Arc<QueryCache>>,
    rlm_framing: bool,
    timeout_secs: u64,
    verbose: bool,
}

impl Invoker {
    pub fn new(
        endpoint: Arc<dyn ModelEndpoint>,
        session: Arc<RlmSession>,
        cache: Option<Arc<QueryCache>>,
    ) -> Self {
        Invoker {
            endpoint,
            session,
            cache,
            rlm_framing: true,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            verbose: false,
        }
    }

    pub fn with_framing(mut self, framing: bool) -> Self {
        self.rlm_framing = framing;
        self
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn session(&self) -> &Arc<RlmSession> {
        &self.session
    }

    /// Compose the full prompt sent to the endpoint.
    fn compose(&self, prompt: &str, opts: &InvokeOptions) -> String {
        let mut full = String::new();
        if opts.framing.unwrap_or(self.rlm_framing) {
            full.push_str(RLM_FRAMING);
            full.push_str("\n\n");
        }
        if let Some(context) = &opts.context {
            full.push_str("Data to analyze:\n");
            full.push_str(context);
            full.push('\n');
        }
        full.push_str("Task: ");
        full.push_str(prompt);
        if opts.json_mode {
            full.push_str(
                "\n\nRespond with strict JSON only: no markdown fences, no commentary, \
                 no text outside the JSON value.",
            );
        }
        full
    }

    /// Invoke with default options plus an optional context block.
    pub async fn invoke(&self, prompt: &str, context: Option<&str>) -> Result<String, RlmError> {
        self.invoke_with(
            prompt,
            InvokeOptions {
                context: context.map(str::to_string),
                ..Default::default()
            },
        )
        .await
    }

    /// Full invocation sequence. Returns either the model text or a
    /// sentinel string; `Err` is reserved for budget/depth control flow.
    pub async fn invoke_with(
        &self,
        prompt: &str,
        opts: InvokeOptions,
    ) -> Result<String, RlmError> {
        self.session.check_budget()?;
        // Depth is claimed before the cache is consulted: a fan-out that
        // is already at the ceiling must not appear to succeed via hits.
        let _depth = self.session.enter()?;

        let model = opts.model.as_deref().unwrap_or(&self.session.model_id);
        let full_prompt = self.compose(prompt, &opts);
        let context_str = opts.context.as_deref().unwrap_or("");

        let cache_key = QueryCache::key(prompt, context_str, model);
        if !opts.no_cache {
            if let Some(cache) = &self.cache {
                if let Some(hit) = cache.get(&cache_key) {
                    self.session.record_cache_hit(estimate_tokens(&hit));
                    if self.verbose {
                        eprintln!("[rlm] cache hit for {}", &cache_key[..12]);
                    }
                    return Ok(hit);
                }
                self.session.record_cache_miss();
            }
        }

        let request = CompletionRequest {
            model: model.to_string(),
            prompt: full_prompt,
            max_tokens: MAX_COMPLETION_TOKENS,
            timeout: Duration::from_secs(opts.timeout_secs.unwrap_or(self.timeout_secs)),
        };

        if self.verbose {
            eprintln!(
                "[rlm] invoking {} (depth {}, {} prompt chars)",
                model,
                self.session.current_depth(),
                request.prompt.len()
            );
        }

        match self.endpoint.complete(&request).await {
            Ok(completion) => {
                self.session.record_call();
                self.session
                    .add_usage(completion.input_tokens, completion.output_tokens);
                if !opts.no_cache {
                    if let Some(cache) = &self.cache {
                        cache.set(
                            &cache_key,
                            &completion.text,
                            completion.input_tokens + completion.output_tokens,
                            model,
                        );
                    }
                }
                Ok(completion.text)
            }
            Err(EndpointError::Auth(detail)) => {
                self.session.record_call();
                Ok(format!("[LLM Error: authentication failed: {}]", detail))
            }
            Err(EndpointError::Timeout) => {
                self.session.record_call();
                Ok("[LLM Error: query timed out]".to_string())
            }
            Err(EndpointError::Other(detail)) => {
                self.session.record_call();
                Ok(format!("[LLM Error: {}]", detail))
            }
        }
    }
}

/// Rough token estimate for cache-hit accounting when only text is known.
fn estimate_tokens(text: &str) -> u64 {
    (text.len() / 4) as u64
}
