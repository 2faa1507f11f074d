//! # RLM Harness CLI (`rlm`)
//!
//! The `rlm` binary drives the engine: it loads a corpus from a mail
//! source (or a saved file), executes a user program or an auto-routed
//! goal against it, and reports results plus session statistics.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `rlm run` | Execute a Lua analysis program against a corpus |
//! | `rlm agent "<goal>"` | Interpret a natural-language goal and run it |
//! | `rlm sessions list` | List saved agent sessions |
//! | `rlm sessions delete <id>` | Delete a saved session |
//! | `rlm cache cleanup` | Remove expired query-cache entries |
//!
//! ## Examples
//!
//! ```bash
//! # Run a program over a saved corpus
//! rlm run --load-file /tmp/emails.json --code '
//!   local by_sender = chunk_by_sender(emails)
//!   final_named("by_sender")'
//!
//! # Security triage of a live query, capped at $2
//! rlm run --query "label:security-alerts" --max-budget 2.0 \
//!     --code 'final(security_triage(emails))'
//!
//! # Goal-driven agent turn, resumable session
//! rlm agent "triage security alerts from last week" --query "newer_than:7d"
//! ```
//!
//! Exit codes: `0` success, `1` configuration or execution error, `130`
//! user cancellation.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use rlm_harness::cache::{QueryCache, SecurityPatternCache};
use rlm_harness::config::{CacheSettings, RlmConfig};
use rlm_harness::error::RlmError;
use rlm_harness::executor::{run_program, RlmEnv};
use rlm_harness::invoker::{AnthropicEndpoint, Invoker};
use rlm_harness::models::{Corpus, FormatLevel};
use rlm_harness::router::{
    detect_intent, detect_workflow, estimate_cost, should_use_rlm, Route, Router,
};
use rlm_harness::security_workflows::SecurityWorkflows;
use rlm_harness::session::RlmSession;
use rlm_harness::session_store::SessionStore;
use rlm_harness::source::{load_corpus, load_corpus_file, CommandSource};
use rlm_harness::threat_store::ThreatPatternStore;
use rlm_harness::workflows::Workflows;

/// RLM Harness — recursive language model execution for email analysis.
#[derive(Parser)]
#[command(
    name = "rlm",
    about = "Recursive Language Model execution engine for email analysis",
    version,
    long_about = "Loads a corpus of emails into memory, runs a user-supplied Lua analysis \
    program (or an auto-routed goal) against it, and issues bounded recursive model \
    invocations under a cost budget, a call ceiling, and a recursion-depth ceiling."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Flags shared by the corpus-loading commands.
#[derive(clap::Args)]
struct CorpusArgs {
    /// Mail-source query (requires the RLM_MAIL_SOURCE fetcher command).
    #[arg(long, conflicts_with = "load_file")]
    query: Option<String>,

    /// Load a previously saved corpus file instead of querying.
    #[arg(long)]
    load_file: Option<PathBuf>,

    /// Maximum emails to fetch.
    #[arg(long, default_value_t = 200)]
    max_results: usize,

    /// Record detail level: minimal, metadata, or full.
    #[arg(long, default_value = "metadata")]
    format: FormatLevel,
}

/// Flags shared by the model-using commands.
#[derive(clap::Args)]
struct EngineArgs {
    /// Model id.
    #[arg(long, default_value = rlm_harness::session::DEFAULT_MODEL)]
    model: String,

    /// Budget ceiling in USD.
    #[arg(long, default_value_t = 5.0)]
    max_budget: f64,

    /// Model-call ceiling.
    #[arg(long, default_value_t = 100)]
    max_calls: u64,

    /// Recursion-depth ceiling.
    #[arg(long, default_value_t = 3)]
    max_depth: u32,

    /// Fan-out worker count.
    #[arg(long, default_value_t = 5)]
    workers: usize,

    /// Disable the query cache for this run.
    #[arg(long)]
    no_cache: bool,

    /// Query-cache directory (default: system temp).
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// Query-cache TTL in hours.
    #[arg(long, default_value_t = 24)]
    cache_ttl: i64,

    /// Checkpoint file for resumable fan-outs.
    #[arg(long)]
    checkpoint: Option<PathBuf>,

    /// Completions between checkpoint snapshots.
    #[arg(long, default_value_t = 10)]
    checkpoint_interval: usize,

    /// Omit the sub-query framing preamble.
    #[arg(long)]
    no_rlm_framing: bool,

    /// Verbose diagnostics on stderr.
    #[arg(long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a Lua analysis program against a corpus.
    ///
    /// The program sees the corpus as `emails`, the load metadata as
    /// `metadata`, and the full primitive/workflow surface as globals.
    /// Its first `final(value)` or `final_named(name)` call sets the
    /// result.
    Run {
        #[command(flatten)]
        corpus: CorpusArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Program text.
        #[arg(long, conflicts_with = "code_file")]
        code: Option<String>,

        /// Load the program from a file.
        #[arg(long)]
        code_file: Option<PathBuf>,

        /// Wrap the result in a JSON success envelope.
        #[arg(long)]
        json_output: bool,

        /// Suppress the small-dataset warning.
        #[arg(long)]
        force: bool,
    },

    /// Interpret a natural-language goal, plan workflow calls, and run
    /// them. Sessions persist across invocations and carry the budget
    /// ledger.
    Agent {
        /// Natural-language goal.
        goal: String,

        #[command(flatten)]
        corpus: CorpusArgs,

        #[command(flatten)]
        engine: EngineArgs,

        /// Resume a saved session by id.
        #[arg(long)]
        session: Option<String>,

        /// Force the RLM path even for small, simple goals.
        #[arg(long, conflicts_with = "force_direct")]
        force_rlm: bool,

        /// Force the direct retrieval path.
        #[arg(long)]
        force_direct: bool,

        /// Wrap the result in a JSON success envelope.
        #[arg(long)]
        json_output: bool,
    },

    /// Inspect or delete saved agent sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },

    /// Maintain the on-disk query cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

#[derive(Subcommand)]
enum SessionsAction {
    /// List saved sessions, most recently updated first.
    List,
    /// Delete a saved session.
    Delete {
        /// Session id (as shown by `sessions list`).
        id: String,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove expired query-cache entries.
    Cleanup {
        /// Cache directory (default: system temp).
        #[arg(long)]
        cache_dir: Option<PathBuf>,

        /// TTL in hours used to judge expiry.
        #[arg(long, default_value_t = 24)]
        cache_ttl: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tokio::select! {
        result = dispatch(cli) => match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("error: {:#}", e);
                ExitCode::from(1)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            eprintln!("\n[rlm] cancelled");
            ExitCode::from(130)
        }
    }
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run {
            corpus,
            engine,
            code,
            code_file,
            json_output,
            force,
        } => run_command(corpus, engine, code, code_file, json_output, force).await,
        Commands::Agent {
            goal,
            corpus,
            engine,
            session,
            force_rlm,
            force_direct,
            json_output,
        } => {
            agent_command(
                goal,
                corpus,
                engine,
                session,
                force_rlm,
                force_direct,
                json_output,
            )
            .await
        }
        Commands::Sessions { action } => sessions_command(action),
        Commands::Cache { action } => cache_command(action),
    }
}

fn config_from(engine: &EngineArgs) -> RlmConfig {
    RlmConfig {
        model: engine.model.clone(),
        max_budget_usd: engine.max_budget,
        max_calls: engine.max_calls,
        max_depth: engine.max_depth,
        workers: engine.workers,
        cache: CacheSettings {
            enabled: !engine.no_cache,
            dir: engine.cache_dir.clone(),
            ttl_hours: engine.cache_ttl,
        },
        checkpoint: engine.checkpoint.clone(),
        checkpoint_interval: engine.checkpoint_interval,
        rlm_framing: !engine.no_rlm_framing,
        verbose: engine.verbose,
    }
}

/// Everything a run needs, built once at startup and passed by handle.
struct Engine {
    invoker: Arc<Invoker>,
    workflows: Arc<Workflows>,
    security: Arc<SecurityWorkflows>,
}

fn build_engine(config: &RlmConfig) -> Result<Engine, RlmError> {
    config.validate()?;
    // The credential check happens here, before any corpus load.
    let endpoint = Arc::new(AnthropicEndpoint::from_env()?);

    let session = RlmSession::new(
        &config.model,
        config.max_budget_usd,
        config.max_calls,
        config.max_depth,
    );

    let cache = if config.cache.enabled {
        let dir = config
            .cache
            .dir
            .clone()
            .unwrap_or_else(QueryCache::default_dir);
        Some(Arc::new(
            QueryCache::new(dir, config.cache.ttl_hours)
                .map_err(|e| RlmError::Storage(format!("cannot open cache: {}", e)))?,
        ))
    } else {
        None
    };

    let invoker = Arc::new(
        Invoker::new(endpoint, session, cache)
            .with_framing(config.rlm_framing)
            .with_verbose(config.verbose),
    );

    let pattern_cache = SecurityPatternCache::new(
        SecurityPatternCache::default_dir(),
        SecurityPatternCache::DEFAULT_TTL_HOURS,
    )
    .ok()
    .map(Arc::new);
    let threat_store = ThreatPatternStore::new(
        ThreatPatternStore::default_dir(),
        ThreatPatternStore::DEFAULT_RETENTION_DAYS,
    )
    .ok()
    .map(Arc::new);

    let workflows = Arc::new(Workflows::new(Arc::clone(&invoker), config.workers));
    let security = Arc::new(SecurityWorkflows::new(
        Arc::clone(&invoker),
        pattern_cache,
        threat_store,
    ));

    Ok(Engine {
        invoker,
        workflows,
        security,
    })
}

async fn load_requested_corpus(args: &CorpusArgs) -> Result<Corpus, RlmError> {
    match (&args.query, &args.load_file) {
        (Some(query), None) => {
            let source = CommandSource::from_env()?;
            load_corpus(&source, query, args.max_results, args.format).await
        }
        (None, Some(path)) => load_corpus_file(path),
        (None, None) => Err(RlmError::Configuration(
            "one of --query or --load-file is required".to_string(),
        )),
        (Some(_), Some(_)) => unreachable!("clap enforces mutual exclusion"),
    }
}

async fn run_command(
    corpus_args: CorpusArgs,
    engine_args: EngineArgs,
    code: Option<String>,
    code_file: Option<PathBuf>,
    json_output: bool,
    force: bool,
) -> anyhow::Result<()> {
    let program = match (code, code_file) {
        (Some(code), None) => code,
        (None, Some(path)) => std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read program file {}", path.display()))?,
        (None, None) => {
            return Err(RlmError::Configuration(
                "one of --code or --code-file is required".to_string(),
            )
            .into())
        }
        (Some(_), Some(_)) => unreachable!("clap enforces mutual exclusion"),
    };

    let config = config_from(&engine_args);
    let engine = build_engine(&config)?;
    let corpus = load_requested_corpus(&corpus_args).await?;

    if corpus.len() < 100 && !force {
        eprintln!(
            "[rlm] warning: only {} emails loaded; the recursive engine pays off on larger \
             corpora (use --force to silence this)",
            corpus.len()
        );
    }

    let query = corpus.metadata.query.clone();
    let emails_processed = corpus.len();

    let report = run_program(
        program,
        corpus,
        RlmEnv {
            invoker: Arc::clone(&engine.invoker),
            workflows: Arc::clone(&engine.workflows),
            security: Arc::clone(&engine.security),
            workers: config.workers,
            checkpoint: config.checkpoint.clone(),
            checkpoint_interval: config.checkpoint_interval,
        },
    )
    .await?;

    if json_output {
        let envelope = serde_json::json!({
            "status": if report.aborted.is_some() { "aborted" } else { "success" },
            "result": report.result,
            "emails_processed": emails_processed,
            "query": query,
            "aborted": report.aborted,
            "session_stats": report.stats,
        });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else {
        println!("{}", report.result);
    }

    eprintln!(
        "[rlm] {} calls, ${:.4} spent, {} cache hits{}",
        report.stats.call_count,
        report.stats.total_cost,
        report.stats.cache_hits,
        report
            .aborted
            .as_deref()
            .map(|kind| format!(", terminated by {}", kind))
            .unwrap_or_default()
    );

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn agent_command(
    goal: String,
    corpus_args: CorpusArgs,
    engine_args: EngineArgs,
    session_id: Option<String>,
    force_rlm: bool,
    force_direct: bool,
    json_output: bool,
) -> anyhow::Result<()> {
    let store = SessionStore::new(SessionStore::default_dir())?;
    let mut session_state = match &session_id {
        Some(id) => store
            .load(id)?
            .ok_or_else(|| RlmError::Configuration(format!("session {} not found", id)))?,
        None => store.create(engine_args.max_budget),
    };

    if session_state.budget_remaining <= 0.0 {
        anyhow::bail!("session budget exhausted; start a new session or raise --max-budget");
    }

    // The turn runs under whatever budget the session has left.
    let mut config = config_from(&engine_args);
    config.max_budget_usd = session_state.budget_remaining;
    let engine = build_engine(&config)?;
    let corpus = load_requested_corpus(&corpus_args).await?;

    let intent = detect_intent(&goal);
    let workflow = detect_workflow(&goal);
    let (route, reason) = if force_rlm {
        (Route::Rlm, "forced by --force-rlm".to_string())
    } else if force_direct {
        (Route::Direct, "forced by --force-direct".to_string())
    } else {
        should_use_rlm(corpus.len(), intent, workflow)
    };

    eprintln!(
        "[rlm] goal: {:?} | intent: {} | workflow: {} | route: {:?} ({})",
        goal,
        intent,
        workflow.unwrap_or("-"),
        route,
        reason
    );

    let response = match route {
        Route::Direct => {
            // Plain retrieval: hand back the corpus digest and stop.
            let digest = rlm_harness::primitives::batch_summaries(&corpus.records, 8000);
            format!(
                "{} emails retrieved for {:?}.\n\n{}",
                corpus.len(),
                corpus.metadata.query,
                digest
            )
        }
        Route::Rlm => {
            let router = Router::new(Arc::clone(&engine.invoker));
            let plan = router
                .plan(&goal, corpus.len(), &session_state.history)
                .await?;
            let planned_cost = estimate_cost(&plan.actions, corpus.len());
            eprintln!(
                "[rlm] plan: {} action(s), estimated ${:.2} — {}",
                plan.actions.len(),
                planned_cost,
                plan.reasoning
            );
            if planned_cost > session_state.budget_remaining {
                eprintln!(
                    "[rlm] warning: estimate exceeds remaining budget ${:.2}; the governor \
                     will stop the run at the ceiling",
                    session_state.budget_remaining
                );
            }

            let result = router
                .execute_plan(&plan, &corpus.records, &engine.workflows, &engine.security)
                .await;

            match result {
                Ok(value) => serde_json::to_string_pretty(&value)?,
                // Budget/depth terminations still produce a turn record.
                Err(err) if err.is_fatal() => format!("[{}] run terminated early", err),
                Err(err) => return Err(err.into()),
            }
        }
    };

    let turn_cost = engine.invoker.session().stats().total_cost;
    session_state.add_turn(&goal, &response, turn_cost);
    let session_file = store.save(&session_state)?;

    if json_output {
        let envelope = serde_json::json!({
            "status": "success",
            "result": response,
            "session_id": session_state.session_id,
            "budget_used": session_state.budget_used,
            "budget_remaining": session_state.budget_remaining,
        });
        println!("{}", serde_json::to_string_pretty(&envelope)?);
    } else {
        println!("{}", response);
    }

    eprintln!(
        "[rlm] session {} saved to {} | turn cost ${:.4} | remaining ${:.4}",
        session_state.session_id,
        session_file.display(),
        turn_cost,
        session_state.budget_remaining
    );

    Ok(())
}

fn sessions_command(action: SessionsAction) -> anyhow::Result<()> {
    let store = SessionStore::new(SessionStore::default_dir())?;
    match action {
        SessionsAction::List => {
            let sessions = store.list();
            if sessions.is_empty() {
                println!("No sessions found.");
                return Ok(());
            }
            println!(
                "{:<28} {:<20} {:>6} {:>12} {:>12}",
                "SESSION", "UPDATED", "TURNS", "USED", "REMAINING"
            );
            for s in sessions {
                let updated = s.updated_at.format("%Y-%m-%d %H:%M:%S").to_string();
                println!(
                    "{:<28} {:<20} {:>6} {:>12.4} {:>12.4}",
                    s.session_id, updated, s.turns, s.budget_used, s.budget_remaining
                );
            }
        }
        SessionsAction::Delete { id } => {
            if store.delete(&id) {
                println!("Deleted session {}.", id);
            } else {
                anyhow::bail!("session {} not found", id);
            }
        }
    }
    Ok(())
}

fn cache_command(action: CacheAction) -> anyhow::Result<()> {
    match action {
        CacheAction::Cleanup {
            cache_dir,
            cache_ttl,
        } => {
            let dir = cache_dir.unwrap_or_else(QueryCache::default_dir);
            let cache = QueryCache::new(&dir, cache_ttl)
                .with_context(|| format!("cannot open cache at {}", dir.display()))?;
            let removed = cache.cleanup_expired();
            println!("Removed {} expired entries from {}.", removed, dir.display());
        }
    }
    Ok(())
}
