//! # RLM Harness
//!
//! **A Recursive Language Model execution engine for large-inbox email
//! analysis.**
//!
//! RLM Harness applies a context-limited model to inboxes of hundreds to
//! thousands of messages without overflowing any single invocation's
//! context window, while staying inside a user-declared monetary budget.
//! The corpus is held in memory, a user-supplied Lua program (or a
//! pre-built workflow) examines it with pure chunking/correlation
//! primitives, and bounded recursive model invocations run over small
//! slices whose results are aggregated programmatically.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌────────────────────────────┐
//! │   Mail   │──▶│  Corpus   │──▶│  Executor (Lua program)     │
//! │  Source  │   │ (memory)  │   │  or Workflow pipelines      │
//! └──────────┘   └───────────┘   └──────┬─────────────────────┘
//!                                       │ invoke / parallel_map
//!                                ┌──────▼──────┐
//!                 governor ◀────▶│   Invoker   │◀──▶ query cache
//!                 (budget,       └──────┬──────┘
//!                  depth)               ▼
//!                                Model Endpoint
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | `EmailRecord`, `Corpus`, format levels |
//! | [`source`] | Mail-source contract, paged loading, saved-file loading |
//! | [`primitives`] | Pure chunk/filter/group/sort/dedupe operations |
//! | [`security`] | IOC extraction, severity, auth checks, MITRE matching, time windows |
//! | [`cache`] | Content-addressed query cache + security pattern cache |
//! | [`threat_store`] | Persistent IOC observations and attack patterns |
//! | [`session`] | Budget/call/depth governor |
//! | [`invoker`] | Model endpoint trait, Anthropic client, the `invoke` gate |
//! | [`fanout`] | Ordered bounded-concurrency fan-out |
//! | [`checkpoint`] | Fan-out with resumable progress snapshots |
//! | [`structured`] | Schema-validated JSON and confidence-thresholded replies |
//! | [`workflows`] | inbox triage, weekly summary, action items, sender analysis |
//! | [`security_workflows`] | security triage, attack chains, phishing analysis |
//! | [`executor`] | Sandboxed Lua user-program execution |
//! | [`session_store`] | Multi-turn session persistence |
//! | [`router`] | Goal → action plan, routing heuristics, direct dispatch |
//! | [`config`] | Run configuration and validation |
//!
//! ## Failure semantics
//!
//! Model failures become in-band sentinel strings (`"[LLM Error: …"`) so
//! multi-chunk workflows degrade gracefully. `BudgetExceeded` and
//! `RecursionDepthExceeded` are control flow: they abort the current
//! program promptly and are reported in the final session stats. Corrupt
//! cache and checkpoint files are deleted silently and treated as absent.

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod executor;
pub mod fanout;
pub mod invoker;
pub mod lua_env;
pub mod models;
pub mod primitives;
pub mod router;
pub mod security;
pub mod security_workflows;
pub mod session;
pub mod session_store;
pub mod source;
pub mod structured;
pub mod threat_store;
pub mod workflows;
