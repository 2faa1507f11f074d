//! Shared test fixtures: a scripted stub model endpoint and email
//! builders.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use rlm_harness::invoker::{Completion, CompletionRequest, EndpointError, ModelEndpoint};
use rlm_harness::models::EmailRecord;

/// One scripted endpoint behavior.
#[derive(Clone)]
pub enum Reply {
    /// Return this text with the given `(input, output)` token usage.
    Text(String, u64, u64),
    /// Fail with an authentication error.
    AuthError,
    /// Fail with a timeout.
    Timeout,
    /// Sleep this long, then return the text.
    Delayed(Duration, String),
}

/// Scripted model endpoint. Replies are consumed in order; when the
/// script runs dry, a default reply is returned. Every external call is
/// counted.
pub struct StubEndpoint {
    replies: Mutex<VecDeque<Reply>>,
    pub calls: AtomicUsize,
    default_reply: Reply,
}

impl StubEndpoint {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(StubEndpoint {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
            default_reply: Reply::Text("stub reply".to_string(), 10, 5),
        })
    }

    /// Endpoint that always answers `text` with small usage numbers.
    pub fn always(text: &str) -> Arc<Self> {
        Arc::new(StubEndpoint {
            replies: Mutex::new(VecDeque::new()),
            calls: AtomicUsize::new(0),
            default_reply: Reply::Text(text.to_string(), 10, 5),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelEndpoint for StubEndpoint {
    async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, EndpointError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_reply.clone());
        match reply {
            Reply::Text(text, input, output) => Ok(Completion {
                text,
                input_tokens: input,
                output_tokens: output,
            }),
            Reply::AuthError => Err(EndpointError::Auth("invalid x-api-key".to_string())),
            Reply::Timeout => Err(EndpointError::Timeout),
            Reply::Delayed(delay, text) => {
                tokio::time::sleep(delay).await;
                Ok(Completion {
                    text,
                    input_tokens: 10,
                    output_tokens: 5,
                })
            }
        }
    }
}

#[allow(dead_code)]
pub fn email(id: &str, from: &str, subject: &str, snippet: &str) -> EmailRecord {
    EmailRecord {
        id: id.to_string(),
        thread_id: id.to_string(),
        from: from.to_string(),
        subject: subject.to_string(),
        snippet: snippet.to_string(),
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn dated_email(id: &str, date: &str, subject: &str, snippet: &str) -> EmailRecord {
    EmailRecord {
        id: id.to_string(),
        date: date.to_string(),
        subject: subject.to_string(),
        snippet: snippet.to_string(),
        from: "soc@corp.example".to_string(),
        ..Default::default()
    }
}
